use std::path::PathBuf;

/// Configuration for the storage engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory path for the database.
    pub dir: PathBuf,

    /// Maximum memtable size in bytes before rotation (default: 4MB).
    pub memtable_size: u64,

    /// Soft maximum size of an SSTable produced by compaction (default: 1GB).
    pub max_file_size: u64,

    /// Level 0 file count at which compaction is triggered (default: 4).
    pub l0_compaction_trigger: usize,

    /// Level 0 file count at which writes are slowed down (default: 8).
    pub l0_slowdown_writes_trigger: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            memtable_size: 4 * 1024 * 1024,
            max_file_size: 1 << 30,
            l0_compaction_trigger: 4,
            l0_slowdown_writes_trigger: 8,
        }
    }
}

impl Config {
    /// Create a new config with the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set maximum memtable size.
    pub fn memtable_size(mut self, size: u64) -> Self {
        self.memtable_size = size;
        self
    }

    /// Set the soft maximum SSTable size.
    pub fn max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    /// Set the level 0 compaction trigger.
    pub fn l0_compaction_trigger(mut self, count: usize) -> Self {
        self.l0_compaction_trigger = count;
        self
    }

    /// Set the level 0 write slowdown trigger.
    pub fn l0_slowdown_writes_trigger(mut self, count: usize) -> Self {
        self.l0_slowdown_writes_trigger = count;
        self
    }
}
