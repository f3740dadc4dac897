//! Main entry point for the zseek CLI app

use std::io::{self, BufWriter, Write};
use std::path::Path;

use tracing_subscriber::EnvFilter;
use zseek::cli::{self, Args, Commands};
use zseek::file::detect_format;
use zseek::{CompressedFile, Config, RandomAccessReader};

const CAT_CHUNK: usize = 1 << 20;

fn main() -> std::process::ExitCode {
    let args = cli::run();
    init_logging(&args);
    if let Err(e) = run_app(&args) {
        eprintln!("Error: {}", e);
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_level()));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

fn run_app(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.config();

    match &args.command {
        Commands::Index { files } => {
            for path in files {
                let file = CompressedFile::open(path, &config)?;
                let index = file.index();
                let compressed: u64 = index.blocks().iter().map(|b| u64::from(b.csize)).sum();
                println!(
                    "{}: {}, {} blocks, {} bytes uncompressed, {} bytes in blocks, largest block {} bytes",
                    path.display(),
                    file.format(),
                    index.len(),
                    index.uncompressed_size(),
                    compressed,
                    index.max_block_size()
                );
            }
        }
        Commands::Blocks { file } => {
            let file = CompressedFile::open(file, &config)?;
            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            writeln!(out, "{:>14} {:>10} {:>14} {:>10}  extra", "uoff", "usize", "coff", "csize")?;
            for b in file.index().blocks() {
                writeln!(out, "{:>14} {:>10} {:>14} {:>10}  {}", b.uoff, b.usize, b.coff, b.csize, b.extra)?;
            }
            out.flush()?;
        }
        Commands::Cat { file, offset, length } => {
            let reader = RandomAccessReader::with_config(&config)?;
            cat(&reader, file, *offset, *length, &config)?;
            if args.stats {
                let s = reader.cache().stats();
                eprintln!(
                    "cache: {} hits, {} misses, {} entries, {}/{} bytes",
                    s.hits, s.misses, s.entries, s.weight, s.max_weight
                );
            }
        }
        Commands::Name { files } => {
            for path in files {
                let format = detect_format(path, &config)?;
                println!("{}", format.indexer(&config).destination_name(path));
            }
        }
    }

    Ok(())
}

fn cat(
    reader: &RandomAccessReader,
    path: &Path,
    offset: u64,
    length: Option<u64>,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let file = CompressedFile::open(path, config)?;
    let size = file.uncompressed_size();
    let end = length.map_or(size, |n| offset.saturating_add(n).min(size));

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut buf = vec![0u8; CAT_CHUNK];
    let mut pos = offset;
    while pos < end {
        let want = (end - pos).min(CAT_CHUNK as u64) as usize;
        let n = reader.read(&file, &mut buf[..want], pos)?;
        if n == 0 {
            break;
        }
        match out.write_all(&buf[..n]) {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
            other => other?,
        }
        pos += n as u64;
    }
    match out.flush() {
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => Ok(other?),
    }
}
