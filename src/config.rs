//! Database configuration.

use crate::error::{GaldrError, Result};

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 8192;
/// Default bounded LRU page-cache capacity (pages).
pub const DEFAULT_CACHE_SIZE: usize = 1024;
/// Default number of pages added when the file runs out of free pages.
pub const DEFAULT_EXPANSION_PAGES: u32 = 256;
/// Default committed-frame count that triggers an automatic checkpoint.
pub const DEFAULT_CHECKPOINT_THRESHOLD: u32 = 1000;
/// Default commit count that triggers a garbage-collection pass.
pub const DEFAULT_GC_THRESHOLD: u64 = 250;
/// Minimum PBKDF2 iteration count accepted for at-rest encryption.
pub const MIN_KDF_ITERATIONS: u32 = 500_000;

/// At-rest encryption settings.
#[derive(Clone)]
pub struct EncryptionConfig {
    /// Password the page key is derived from.
    pub password: String,
    /// PBKDF2-HMAC-SHA256 iteration count (>= [`MIN_KDF_ITERATIONS`]).
    pub kdf_iterations: u32,
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("password", &"<redacted>")
            .field("kdf_iterations", &self.kdf_iterations)
            .finish()
    }
}

impl EncryptionConfig {
    /// Builds an encryption config with the default iteration count.
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            kdf_iterations: MIN_KDF_ITERATIONS,
        }
    }
}

/// Tunables for a database instance.
#[derive(Clone, Debug)]
pub struct Config {
    /// Page size in bytes; a power of two, at least 1024 and at most 32768
    /// (page offsets are 16-bit).
    pub page_size: usize,
    /// Write-ahead logging. Disabling trades crash safety for speed.
    pub use_wal: bool,
    /// Checkpoint automatically once the WAL exceeds the frame threshold.
    pub auto_checkpoint: bool,
    /// Committed WAL frame count that triggers an automatic checkpoint.
    pub wal_checkpoint_threshold: u32,
    /// Memory-map the main file for reads when the platform allows it.
    pub use_mmap: bool,
    /// Bounded LRU page-cache capacity in pages. Zero disables the cache.
    pub page_cache_size: usize,
    /// Pages added per file expansion.
    pub expansion_page_count: u32,
    /// Run garbage collection automatically after commits.
    pub auto_gc: bool,
    /// Commits between automatic garbage-collection passes.
    pub gc_threshold: u64,
    /// Open without accepting writes.
    pub read_only: bool,
    /// Optional at-rest encryption.
    pub encryption: Option<EncryptionConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            use_wal: true,
            auto_checkpoint: true,
            wal_checkpoint_threshold: DEFAULT_CHECKPOINT_THRESHOLD,
            use_mmap: true,
            page_cache_size: DEFAULT_CACHE_SIZE,
            expansion_page_count: DEFAULT_EXPANSION_PAGES,
            auto_gc: true,
            gc_threshold: DEFAULT_GC_THRESHOLD,
            read_only: false,
            encryption: None,
        }
    }
}

impl Config {
    /// Durability-first profile: every default, checkpoints eagerly.
    pub fn durable() -> Self {
        Self {
            wal_checkpoint_threshold: 256,
            ..Self::default()
        }
    }

    /// Throughput profile for bulk loads: large cache, lazy checkpoint and GC.
    pub fn fast() -> Self {
        Self {
            page_cache_size: 16 * 1024,
            wal_checkpoint_threshold: 10_000,
            gc_threshold: 2_000,
            ..Self::default()
        }
    }

    /// Validates the option set, returning `InvalidArgument` on misuse.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || self.page_size < 1024 || self.page_size > 32768 {
            return Err(GaldrError::InvalidArgument(format!(
                "page size must be a power of two in 1024..=32768, got {}",
                self.page_size
            )));
        }
        if self.expansion_page_count == 0 {
            return Err(GaldrError::InvalidArgument(
                "expansion page count must be greater than zero".into(),
            ));
        }
        if let Some(enc) = &self.encryption {
            if enc.password.is_empty() {
                return Err(GaldrError::InvalidArgument(
                    "encryption password must not be empty".into(),
                ));
            }
            if enc.kdf_iterations < MIN_KDF_ITERATIONS {
                return Err(GaldrError::InvalidArgument(format!(
                    "kdf iterations must be at least {MIN_KDF_ITERATIONS}"
                )));
            }
        }
        Ok(())
    }
}
