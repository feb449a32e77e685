/// Smallest pool ever created, whatever the caller asks for.
pub const POOL_FLOOR: usize = 16 * 1024;

/// Pool size requested by the key agent and daemon at startup.
pub const DEFAULT_POOL_SIZE: usize = 64 * 1024;

/// Settings applied when the secure pool is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecmemConfig {
    /// Minimum pool size in bytes; `0` disables the pool but keeps routing.
    pub min_bytes: usize,
    /// Treat a refused page lock as an error instead of degrading to an
    /// unlocked pool.
    pub require_lock: bool,
    /// Ask the kernel to leave the pool out of core dumps.
    pub exclude_from_core_dumps: bool,
}

impl SecmemConfig {
    /// Configuration for a pool of at least `min_bytes`, other settings at
    /// their defaults.
    pub fn new(min_bytes: usize) -> Self {
        Self {
            min_bytes,
            ..Self::default()
        }
    }

    /// Configuration that installs routing without any pool.
    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn require_lock(mut self, require: bool) -> Self {
        self.require_lock = require;
        self
    }

    pub fn exclude_from_core_dumps(mut self, exclude: bool) -> Self {
        self.exclude_from_core_dumps = exclude;
        self
    }

    /// Whether this configuration asks for a pool at all.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.min_bytes > 0
    }

    /// Pool size actually mapped: at least [`POOL_FLOOR`], rounded up to
    /// `page_size`.
    pub fn pool_size(&self, page_size: usize) -> usize {
        align_up(self.min_bytes.max(POOL_FLOOR), page_size)
    }
}

impl Default for SecmemConfig {
    fn default() -> Self {
        Self {
            min_bytes: DEFAULT_POOL_SIZE,
            require_lock: false,
            exclude_from_core_dumps: true,
        }
    }
}

/// Rounds `value` up to the next multiple of `align` (a power of two).
#[inline]
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_size_applies_floor() {
        assert_eq!(SecmemConfig::new(1).pool_size(4096), POOL_FLOOR);
        assert_eq!(SecmemConfig::new(16384).pool_size(4096), 16384);
    }

    #[test]
    fn test_pool_size_rounds_to_page() {
        assert_eq!(SecmemConfig::new(20000).pool_size(4096), 20480);
        assert_eq!(SecmemConfig::new(20000).pool_size(16384), 32768);
    }

    #[test]
    fn test_disabled_config() {
        let config = SecmemConfig::disabled();
        assert!(!config.is_enabled());
        assert!(SecmemConfig::default().is_enabled());
        assert!(SecmemConfig::default().exclude_from_core_dumps);
    }

    #[test]
    fn test_builder_setters() {
        let config = SecmemConfig::new(4096)
            .require_lock(true)
            .exclude_from_core_dumps(false);
        assert!(config.require_lock);
        assert!(!config.exclude_from_core_dumps);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 32), 0);
        assert_eq!(align_up(1, 32), 32);
        assert_eq!(align_up(32, 32), 32);
        assert_eq!(align_up(116, 32), 128);
    }
}
