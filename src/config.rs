/// Number of levels in the tree. Level 0 holds freshly flushed tables with
/// overlapping scopes; levels 1..MAX_LEVELS hold disjoint scopes.
pub const MAX_LEVELS: usize = 4;

/// Configuration for the storage engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum memtable size in bytes before it is rotated out and flushed
    /// (default: 1MB).
    pub max_memtable_size: usize,

    /// Target on-disk size in bytes of each sstable produced by compaction
    /// (default: 1MB).
    pub max_sstable_size: usize,

    /// Table count at level 0 beyond which compaction starts (default: 100).
    pub level_size_threshold: usize,

    /// Per-level growth factor applied to the table count allowance
    /// (default: 1.4).
    pub level_size_ratio: f64,

    /// Emit a dump of the recovered version through `tracing::debug!`
    /// (default: false). Has no behavioral effect.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_memtable_size: 1 << 20, // 1MB
            max_sstable_size: 1 << 20,  // 1MB
            level_size_threshold: 100,
            level_size_ratio: 1.4,
            debug: false,
        }
    }
}

impl Config {
    /// Create a config with the default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memtable rotation threshold in bytes.
    pub fn max_memtable_size(mut self, size: usize) -> Self {
        self.max_memtable_size = size;
        self
    }

    /// Set the compaction output split size in bytes.
    pub fn max_sstable_size(mut self, size: usize) -> Self {
        self.max_sstable_size = size;
        self
    }

    /// Set the level-0 table count that triggers compaction.
    pub fn level_size_threshold(mut self, threshold: usize) -> Self {
        self.level_size_threshold = threshold;
        self
    }

    /// Set the per-level growth factor of the compaction allowance.
    pub fn level_size_ratio(mut self, ratio: f64) -> Self {
        self.level_size_ratio = ratio;
        self
    }

    /// Enable diagnostic output.
    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    /// Table count allowance for the given level: `threshold * ratio^level`.
    pub(crate) fn level_allowance(&self, level: usize) -> f64 {
        self.level_size_threshold as f64 * self.level_size_ratio.powi(level as i32)
    }
}
