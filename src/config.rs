/// Maximum allowed user key size in bytes (4 KiB).
pub const MAX_KEY_SIZE: usize = 4 * 1024;

/// Maximum allowed value size in bytes (16 KiB).
pub const MAX_VALUE_SIZE: usize = 16 * 1024;

/// Configuration for the storage engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Log size that triggers a memtable rotation (default: 4 MiB).
    pub max_log_size: u64,

    /// Target data block size inside a table (default: 4 KiB).
    pub max_block_size: usize,

    /// Target table file size; a table closes on the first block boundary at
    /// or past this (default: 2 MiB).
    pub max_table_size: usize,

    /// Level 0 table count that triggers an L0 compaction (default: 4).
    pub level0_compaction_threshold: usize,

    /// Table count cap for level 1; each deeper level multiplies this by the
    /// same factor (default: 10).
    pub level_size_base: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_log_size: 4 * 1024 * 1024,
            max_block_size: 4 * 1024,
            max_table_size: 2 * 1024 * 1024,
            level0_compaction_threshold: 4,
            level_size_base: 10,
        }
    }
}

impl EngineConfig {
    /// Create a config with the default thresholds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log size that triggers rotation.
    pub fn max_log_size(mut self, size: u64) -> Self {
        self.max_log_size = size;
        self
    }

    /// Set the target block size.
    pub fn max_block_size(mut self, size: usize) -> Self {
        self.max_block_size = size;
        self
    }

    /// Set the target table size.
    pub fn max_table_size(mut self, size: usize) -> Self {
        self.max_table_size = size;
        self
    }

    /// Set the level 0 compaction trigger.
    pub fn level0_compaction_threshold(mut self, threshold: usize) -> Self {
        self.level0_compaction_threshold = threshold;
        self
    }

    /// Set the level 1 table count cap.
    pub fn level_size_base(mut self, base: usize) -> Self {
        self.level_size_base = base;
        self
    }

    /// Table count above which level `n` (n >= 1) is due for compaction.
    pub fn level_capacity(&self, n: usize) -> usize {
        let mut cap = self.level_size_base;
        for _ in 1..n {
            cap = cap.saturating_mul(self.level_size_base);
        }
        cap
    }
}
