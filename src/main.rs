//! aiocp: pipelined asynchronous bulk file copying
//!
//! Copies a single file by keeping a bounded window of asynchronous read
//! and write requests in flight, driven through io_uring, Linux native
//! AIO, or POSIX AIO.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};

use aiocp::cli::Args;
use aiocp::copy::copy_file;

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging based on verbosity and quiet mode
    if !args.quiet {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(match args.verbose {
                0 => Level::WARN,
                1 => Level::INFO,
                2 => Level::DEBUG,
                _ => Level::TRACE,
            })
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();

        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        // In quiet mode, only log errors
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::ERROR)
            .with_target(false)
            .finish();

        tracing::subscriber::set_global_default(subscriber)?;
    }

    if !args.quiet {
        info!("Starting aiocp v{}", env!("CARGO_PKG_VERSION"));
        info!("Source: {}", args.source.display());
        info!("Destination: {}", args.destination.display());
        info!("Backend: {:?}", args.backend);
        info!("Block size: {} KB", args.block_size_kb);
        info!("Queue depth: {}", args.queue_depth);
    }

    // Validate arguments
    args.validate().context("Invalid arguments")?;

    match copy_file(&args.source, &args.destination, &args.copy_options()) {
        Ok(stats) => {
            info!("Copy completed successfully");
            info!("Bytes copied: {}", stats.bytes_copied);
            info!("Duration: {:?}", stats.duration);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
