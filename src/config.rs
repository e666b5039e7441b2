use std::path::{Path, PathBuf};

/// Programmatic configuration for an [`crate::engine::Engine`] — there is no
/// CLI surface on the core; callers construct this directly.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub file_path: PathBuf,
    pub page_cache_capacity: usize,
    pub node_cache_capacity: usize,
    pub lock_pool_capacity: usize,
}

pub const DEFAULT_PAGE_CACHE_CAPACITY: usize = 48;
pub const DEFAULT_NODE_CACHE_CAPACITY: usize = 10_000;
pub const DEFAULT_LOCK_POOL_CAPACITY: usize = 400;

impl EngineConfig {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        EngineConfig {
            file_path: file_path.as_ref().to_path_buf(),
            page_cache_capacity: DEFAULT_PAGE_CACHE_CAPACITY,
            node_cache_capacity: DEFAULT_NODE_CACHE_CAPACITY,
            lock_pool_capacity: DEFAULT_LOCK_POOL_CAPACITY,
        }
    }

    pub fn with_page_cache_capacity(mut self, capacity: usize) -> Self {
        self.page_cache_capacity = capacity;
        self
    }

    pub fn with_node_cache_capacity(mut self, capacity: usize) -> Self {
        self.node_cache_capacity = capacity;
        self
    }

    pub fn with_lock_pool_capacity(mut self, capacity: usize) -> Self {
        self.lock_pool_capacity = capacity;
        self
    }
}
