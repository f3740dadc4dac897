//! Runtime configuration.
//!
//! Defaults can be overridden from the environment, and the CLI overrides
//! both. Recognised variables:
//!
//! - `ZSEEK_CACHE_MB`: cache capacity in MiB.
//! - `ZSEEK_THREADS`: decompression threads, 0 for one per CPU.
//! - `ZSEEK_GZIP_BLOCK_FACTOR`: force a gzip block after this many windows.
//! - `ZSEEK_NO_INDEX_WRITE`: any value except `0` disables sidecar writes.

use std::env;
use std::str::FromStr;

use tracing::warn;

use crate::format::gzip::DEFAULT_BLOCK_FACTOR;
use crate::index_store::DEFAULT_SUFFIX;

pub const DEFAULT_CACHE_SIZE: usize = 32 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum bytes of decompressed blocks kept in the cache.
    pub cache_size: usize,
    /// Worker threads; 0 means one per CPU.
    pub threads: usize,
    /// A gzip block is forced once this many windows passed without an
    /// independent boundary.
    pub gzip_block_factor: u32,
    /// Appended to the source path to name its sidecar index.
    pub index_suffix: String,
    /// Persist freshly built indexes.
    pub write_index: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            threads: 0,
            gzip_block_factor: DEFAULT_BLOCK_FACTOR,
            index_suffix: DEFAULT_SUFFIX.to_string(),
            write_index: true,
        }
    }
}

impl Config {
    /// Defaults overlaid with the `ZSEEK_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_vars(|key| env::var(key).ok())
    }

    fn with_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(mb) = parse_var::<usize>(&var, "ZSEEK_CACHE_MB") {
            self.cache_size = mb.saturating_mul(1 << 20);
        }
        if let Some(threads) = parse_var(&var, "ZSEEK_THREADS") {
            self.threads = threads;
        }
        if let Some(factor) = parse_var::<u32>(&var, "ZSEEK_GZIP_BLOCK_FACTOR") {
            self.gzip_block_factor = factor.max(1);
        }
        if let Some(v) = var("ZSEEK_NO_INDEX_WRITE") {
            self.write_index = v.trim() == "0";
        }
        self
    }
}

fn parse_var<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment variable");
            None
        }
    }
}
