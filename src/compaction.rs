//! Leveled compaction.
//!
//! One pass runs after every flush, seeded with the scope of the freshly
//! written level-0 table. At each level whose table count exceeds its
//! allowance, the tables overlapping the seed scope are merged with the
//! overlapping tables one level down and rewritten there as non-overlapping
//! runs; the pass then cascades with the widened scope.
//!
//! Merge conflicts resolve by generation: the record from the younger table
//! wins. At the bottom level tombstones are dropped, since nothing deeper
//! exists for them to shadow.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::MAX_LEVELS;
use crate::engine::Core;
use crate::error::Result;
use crate::kv::Record;
use crate::scope::Scope;
use crate::sstable::SsTable;

/// Runs one cascading compaction pass, starting from the given seed scope.
pub(crate) fn compact(core: &Core, mut seed: Scope) -> Result<()> {
    for level in 0..MAX_LEVELS - 1 {
        let version = core.shared.read().unwrap().version.clone();
        if version.level_tables(level).len() as f64 <= core.config.level_allowance(level) {
            break;
        }
        let next_level = level + 1;

        // Level 0 scopes overlap each other, so the selection must chase
        // transitive overlaps to a fixpoint; deeper levels are disjoint and
        // one pass suffices.
        let (tables_at_level, scope_at_level) = if level == 0 {
            select_to_fixpoint(version.level_tables(0), &seed)
        } else {
            select_overlapping(version.level_tables(level), &seed)
        };
        let Some(scope_at_level) = scope_at_level else {
            break;
        };

        let (tables_at_next, scope_at_next) =
            select_overlapping(version.level_tables(next_level), &scope_at_level);

        let mut inputs = tables_at_level;
        inputs.extend(tables_at_next);

        let drop_tombstones = next_level == MAX_LEVELS - 1;
        let merged = merge_records(&inputs, drop_tombstones)?;

        let mut outputs = Vec::new();
        for batch in split(merged, core.config.max_sstable_size) {
            let gen = core.gen_iter.next();
            outputs.push(Arc::new(SsTable::create(
                &core.dir,
                gen,
                next_level as u8,
                &batch,
            )?));
        }

        let next_version = {
            let mut log = core.version_log.lock().unwrap();
            version.apply(&mut log, &outputs, &inputs, version.seq())?
        };
        {
            let mut shared = core.shared.write().unwrap();
            shared.version = Arc::new(next_version);
        }

        tracing::info!(
            level,
            next_level,
            inputs = inputs.len(),
            outputs = outputs.len(),
            "compacted level"
        );

        // The installed version no longer references the inputs; their files
        // can go away off the critical path.
        remove_files_async(inputs.iter().map(|t| t.path().to_path_buf()).collect());

        seed = scope_at_next.unwrap_or(scope_at_level);
    }
    Ok(())
}

fn remove_files_async(paths: Vec<PathBuf>) {
    std::thread::spawn(move || {
        for path in paths {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove stale sstable");
            }
        }
    });
}

/// Tables whose scope overlaps `scope`, with the fusion of their scopes.
fn select_overlapping(
    tables: &[Arc<SsTable>],
    scope: &Scope,
) -> (Vec<Arc<SsTable>>, Option<Scope>) {
    let selected: Vec<Arc<SsTable>> = tables
        .iter()
        .filter(|table| table.scope().overlaps(scope))
        .cloned()
        .collect();
    let fused = Scope::fusion(selected.iter().map(|table| table.scope()));
    (selected, fused)
}

/// Re-selects with the fused scope until the selection stops growing.
fn select_to_fixpoint(
    tables: &[Arc<SsTable>],
    seed: &Scope,
) -> (Vec<Arc<SsTable>>, Option<Scope>) {
    let (mut selected, mut fused) = select_overlapping(tables, seed);
    while let Some(scope) = &fused {
        let (wider, wider_fused) = select_overlapping(tables, scope);
        if wider.len() == selected.len() {
            break;
        }
        selected = wider;
        fused = wider_fused;
    }
    (selected, fused)
}

/// Merges the records of all inputs into one key-ascending run. On key
/// collision the record from the higher generation wins.
fn merge_records(tables: &[Arc<SsTable>], drop_tombstones: bool) -> Result<Vec<Record>> {
    let mut by_gen: Vec<&Arc<SsTable>> = tables.iter().collect();
    by_gen.sort_by_key(|table| table.gen());

    let mut merged = BTreeMap::new();
    for table in by_gen {
        for record in table.records()? {
            merged.insert(record.key, record.value);
        }
    }

    Ok(merged
        .into_iter()
        .filter(|(_, value)| !(drop_tombstones && value.is_none()))
        .map(|(key, value)| Record { key, value })
        .collect())
}

/// Splits a run into batches that close once their on-disk size reaches
/// `limit`; the final batch may be smaller.
fn split(records: Vec<Record>, limit: usize) -> Vec<Vec<Record>> {
    let mut batches = Vec::new();
    let mut batch = Vec::new();
    let mut size = 0;
    for record in records {
        size += record.size_on_disk();
        batch.push(record);
        if size >= limit {
            batches.push(std::mem::take(&mut batch));
            size = 0;
        }
    }
    if !batch.is_empty() {
        batches.push(batch);
    }
    batches
}
