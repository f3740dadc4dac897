use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Block cache capacity in MiB. [default: 32, or ZSEEK_CACHE_MB]
    #[arg(long, global = true)]
    pub cache_mb: Option<usize>,

    /// Number of decompression threads. [0 = auto-detect based on CPU cores]
    #[arg(long, global = true)]
    pub threads: Option<usize>,

    /// Force a gzip block after this many 32 KiB windows without an independent boundary.
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(1..))]
    pub gzip_block_factor: Option<u32>,

    /// Do not write sidecar index files next to the inputs.
    #[arg(long, global = true)]
    pub no_write_index: bool,

    /// Print cache statistics to stderr when done.
    #[arg(long, global = true)]
    pub stats: bool,

    /// Increase log verbosity (-v for debug, -vv for trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Build (or load) the block index of each file and summarise it.
    #[command(alias = "i")]
    Index {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// List every block of a file: uoff, usize, coff, csize and format details.
    #[command(alias = "b")]
    Blocks {
        #[arg(required = true)]
        file: PathBuf,
    },

    /// Write uncompressed bytes of a file to stdout using random access.
    #[command(alias = "c")]
    Cat {
        #[arg(required = true)]
        file: PathBuf,

        /// First uncompressed byte to write.
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Number of bytes to write. Defaults to everything up to the end.
        #[arg(long)]
        length: Option<u64>,
    },

    /// Print the name each file's uncompressed data would be stored under.
    #[command(alias = "n")]
    Name {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

impl Args {
    /// Configuration from the environment with command-line overrides applied.
    pub fn config(&self) -> Config {
        let mut config = Config::from_env();
        if let Some(mb) = self.cache_mb {
            config.cache_size = mb.saturating_mul(1 << 20);
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(factor) = self.gzip_block_factor {
            config.gzip_block_factor = factor;
        }
        if self.no_write_index {
            config.write_index = false;
        }
        config
    }

    /// Default log filter for the verbosity flags.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Parses command-line arguments using `clap`.
///
/// Invalid arguments, `--help` and `--version` are handled by clap, which
/// prints and exits.
pub fn run() -> Args {
    Args::parse()
}
