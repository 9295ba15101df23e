//! The storage engine.
//!
//! `Engine` ties the memtable, the sstable levels, and the version log into
//! one persistent ordered map over a single directory.
//!
//! # Write path
//!
//! 1. `put`/`remove` appends to the active memtable's KV log, fsyncs, and
//!    inserts into its map, all under the engine read lock (concurrent
//!    writers are fine; the lock only excludes rotation).
//! 2. When the memtable is over capacity, the caller rotates: it waits for
//!    any previous flush to finish (one-slot backpressure), stages the full
//!    memtable in the frozen slot, signals the worker, and installs a fresh
//!    memtable with the next sequence under the write lock.
//!
//! # Background worker
//!
//! A single thread receives rotation signals. For each one it persists the
//! frozen memtable as a level-0 sstable, appends the version delta (the
//! durability fence), removes the now-redundant KV log, installs the new
//! version, and runs a compaction pass. Any failure here aborts the
//! process: nothing was promised to the version log, so the on-disk state
//! is exactly what recovery handles.
//!
//! # Read path
//!
//! `get` probes the active memtable, then the frozen one, then every level
//! in order, newest generation first. The first hit wins; a tombstone hit
//! reads as absent.
//!
//! # Recovery
//!
//! `open` replays the version log, deletes unreferenced sstable files,
//! replays every KV log newer than the recovered version into the fresh
//! memtable, and only then deletes the old KV logs (the replayed writes are
//! already durable in the new memtable's log).

use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crate::compaction;
use crate::config::Config;
use crate::errdata;
use crate::error::{Error, Result};
use crate::ids::{GenIter, Seq, SeqIter};
use crate::kv::Record;
use crate::memtable::Memtable;
use crate::version::{self, Version, VersionEdit};
use crate::wal::{self, LogIter, LogWriter};

/// State guarded by the engine lock. Readers take it shared; rotation and
/// version installation take it exclusive.
pub(crate) struct Shared {
    pub(crate) mem: Arc<Memtable>,
    pub(crate) version: Arc<Version>,
}

/// State shared between the callers and the background worker.
pub(crate) struct Core {
    pub(crate) config: Config,
    pub(crate) dir: PathBuf,
    pub(crate) gen_iter: GenIter,
    pub(crate) seq_iter: SeqIter,
    pub(crate) shared: RwLock<Shared>,
    /// The frozen memtable being flushed, if any. Kept outside the engine
    /// lock so the worker can clear it without stalling readers.
    pub(crate) prev_mem: RwLock<Option<Arc<Memtable>>>,
    pub(crate) version_log: Mutex<LogWriter<VersionEdit>>,
}

/// A single-writer persistent ordered key-value store.
pub struct Engine {
    core: Arc<Core>,
    to_persist: Option<Sender<()>>,
    persisted: Receiver<()>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dir", &self.core.dir)
            .field("config", &self.core.config)
            .finish()
    }
}

impl Engine {
    /// Opens the store in `dir`, creating the directory if needed and
    /// recovering whatever an earlier process left behind.
    pub fn open(dir: impl AsRef<Path>, config: Config) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let (version, version_log) = version::load_latest(&dir)?;
        if config.debug {
            tracing::debug!(version = %version.describe(), "recovered version");
        }
        let gen_iter = GenIter::new(version.max_gen());

        // Writes newer than the recovered version live only in KV logs.
        let (pending, stale_logs) = scan_kv_logs(&dir, version.seq())?;

        let seq_iter = SeqIter::new();
        let mem = Memtable::create(&dir, seq_iter.next(), config.max_memtable_size)?;

        let core = Arc::new(Core {
            config,
            dir,
            gen_iter,
            seq_iter,
            shared: RwLock::new(Shared {
                mem: Arc::new(mem),
                version: Arc::new(version),
            }),
            prev_mem: RwLock::new(None),
            version_log: Mutex::new(version_log),
        });

        let (to_persist_tx, to_persist_rx) = bounded(1);
        let (persisted_tx, persisted_rx) = bounded(1);
        let worker = {
            let core = core.clone();
            std::thread::Builder::new()
                .name("emberdb-worker".into())
                .spawn(move || worker_loop(core, to_persist_rx, persisted_tx))?
        };

        let engine = Self {
            core,
            to_persist: Some(to_persist_tx),
            persisted: persisted_rx,
            worker: Some(worker),
        };

        // Re-process the unflushed writes. They land in the new memtable's
        // KV log, so the old logs become redundant and can go away; if we
        // crash again before this finishes, the old logs are still there.
        let replayed = pending.len();
        for (key, value) in pending {
            let shared = engine.core.shared.read().unwrap();
            match value {
                Some(value) => shared.mem.put(&key, &value)?,
                None => shared.mem.remove(&key)?,
            }
        }
        for path in &stale_logs {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove stale kv log");
            }
        }

        tracing::info!(
            dir = %engine.core.dir.display(),
            seq = engine.core.shared.read().unwrap().version.seq().0,
            replayed,
            "opened database"
        );
        Ok(engine)
    }

    /// Inserts or updates a key. Durable when this returns.
    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        {
            let shared = self.core.shared.read().unwrap();
            shared.mem.put(key, value)?;
        }
        self.post_write()
    }

    /// Deletes a key. Durable when this returns.
    pub fn remove(&self, key: &str) -> Result<()> {
        {
            let shared = self.core.shared.read().unwrap();
            shared.mem.remove(key)?;
        }
        self.post_write()
    }

    /// Reads the value of a key. Deleted and never-written keys both read
    /// as `None`.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let shared = self.core.shared.read().unwrap();

        if let Some(value) = shared.mem.get(key) {
            return Ok(value);
        }
        // The frozen memtable is not an sstable yet; it still shadows every
        // level.
        if let Some(prev) = self.core.prev_mem.read().unwrap().clone() {
            if let Some(value) = prev.get(key) {
                return Ok(value);
            }
        }
        // Newest generation first within each level, so overlapping level-0
        // tables resolve to the latest write.
        for tables in shared.version.levels() {
            for table in tables {
                if let Some(value) = table.get(key)? {
                    return Ok(value);
                }
            }
        }
        Ok(None)
    }

    /// Rotates the memtable if it is over capacity.
    fn post_write(&self) -> Result<()> {
        if !self.core.shared.read().unwrap().mem.is_full() {
            return Ok(());
        }

        // Wait for the previous flush to complete. At most one flush is in
        // flight, which is the backpressure bound on writers.
        self.persisted
            .recv()
            .map_err(|_| Error::Io("worker is gone".into()))?;

        let full = self.core.shared.read().unwrap().mem.clone();
        *self.core.prev_mem.write().unwrap() = Some(full);
        self.to_persist
            .as_ref()
            .ok_or(Error::ReadOnly)?
            .send(())
            .map_err(|_| Error::Io("worker is gone".into()))?;

        // Swap in a fresh memtable. The exclusive lock keeps any concurrent
        // writer from landing a record in the outgoing one mid-swap.
        let mut shared = self.core.shared.write().unwrap();
        let mem = Memtable::create(
            &self.core.dir,
            self.core.seq_iter.next(),
            self.core.config.max_memtable_size,
        )?;
        shared.mem = Arc::new(mem);
        Ok(())
    }

    /// Shuts the engine down, waiting for any in-flight flush and
    /// compaction to finish. Data files stay on disk; the next `open`
    /// recovers them.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        {
            let shared = self.core.shared.read().unwrap();
            shared.mem.close_wal()?;
        }
        // Dropping the sender lets the worker drain an in-flight signal and
        // exit.
        self.to_persist.take();
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| Error::Io("worker panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Background worker: flush the frozen memtable, then compact. Runs until
/// the rotation channel closes.
fn worker_loop(core: Arc<Core>, to_persist: Receiver<()>, persisted: Sender<()>) {
    // Announce readiness for the first rotation.
    let _ = persisted.send(());
    while to_persist.recv().is_ok() {
        if let Err(e) = flush_and_compact(&core) {
            // Nothing was promised to the version log, so aborting here is
            // crash-equivalent and recovery owns the cleanup.
            tracing::error!(error = %e, "flush or compaction failed, aborting");
            std::process::abort();
        }
        *core.prev_mem.write().unwrap() = None;
        let _ = persisted.send(());
    }
}

fn flush_and_compact(core: &Core) -> Result<()> {
    let prev = core
        .prev_mem
        .read()
        .unwrap()
        .clone()
        .ok_or_else(|| errdata!("rotation signaled with no frozen memtable"))?;

    let gen = core.gen_iter.next();
    let table = Arc::new(prev.persist(&core.dir, gen)?);

    let next_version = {
        let version = core.shared.read().unwrap().version.clone();
        let mut log = core.version_log.lock().unwrap();
        version.apply(&mut log, &[table.clone()], &[], prev.seq())?
    };

    // The delta is durable, so the KV log is redundant: on recovery its
    // sequence is no longer above the version's.
    if let Err(e) = std::fs::remove_file(prev.wal_path()) {
        tracing::warn!(path = %prev.wal_path().display(), error = %e, "failed to remove flushed kv log");
    }

    {
        let mut shared = core.shared.write().unwrap();
        shared.version = Arc::new(next_version);
    }
    tracing::info!(gen = gen.0, seq = prev.seq().0, "flushed memtable to level 0");

    compaction::compact(core, table.scope().clone())
}

/// Scans `dir` for KV logs and replays those newer than `since` into a map
/// of pending writes; a later record for the same key wins. Returns the
/// pending writes and the paths of every KV log found, replayed or not.
fn scan_kv_logs(dir: &Path, since: Seq) -> Result<(PendingWrites, Vec<PathBuf>)> {
    let mut logs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path == wal::version_log_path(dir) {
            continue;
        }
        if let Some(seq) = wal::seq_from_path(&path) {
            logs.push((seq, path));
        }
    }
    logs.sort();

    let mut pending = BTreeMap::new();
    for (seq, path) in &logs {
        if *seq <= since {
            continue;
        }
        let mut iter = LogIter::<Record>::open(path)?;
        loop {
            match iter.next() {
                Ok(false) => break,
                Ok(true) => {}
                Err(e) => return Err(e),
            }
            match iter.read() {
                Ok(record) => {
                    pending.insert(record.key, record.value);
                }
                // A torn tail is where the crash happened; the clean prefix
                // is all there is to replay. No truncation needed, the log
                // is deleted once the replay is re-logged.
                Err(Error::Incomplete { .. }) => break,
                Err(e) => return Err(e),
            }
        }
    }

    let paths = logs.into_iter().map(|(_, path)| path).collect();
    Ok((pending, paths))
}

type PendingWrites = BTreeMap<String, Option<Vec<u8>>>;
