//! Command-line interface definitions

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::backend::BackendKind;
use crate::copy::CopyOptions;

/// Pipelined asynchronous file copying over io_uring, Linux AIO, and POSIX AIO
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Source file
    #[arg(value_name = "SOURCE")]
    pub source: PathBuf,

    /// Destination file (created or truncated)
    #[arg(value_name = "DEST")]
    pub destination: PathBuf,

    /// Asynchronous I/O backend driving the transfer
    #[arg(long, value_enum, default_value_t = BackendKind::Auto)]
    pub backend: BackendKind,

    /// Transfer block size in KB
    ///
    /// The unit of each read and write request; the final block of a file
    /// may be shorter.
    #[arg(long, default_value = "64")]
    pub block_size_kb: usize,

    /// Pipeline depth: maximum simultaneously outstanding requests
    ///
    /// Also the number of transfer buffers, so memory usage is
    /// `queue_depth * block_size`.
    #[arg(long, default_value = "64")]
    pub queue_depth: usize,

    /// Open the source with O_DIRECT (bypass the page cache)
    ///
    /// Requires a block size that is a multiple of 512 and a filesystem
    /// that supports direct I/O.
    #[arg(long)]
    pub direct: bool,

    /// Verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress all output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Block size in bytes
    #[must_use]
    pub fn block_size_bytes(&self) -> usize {
        self.block_size_kb * 1024
    }

    /// Transfer options derived from the arguments
    #[must_use]
    pub fn copy_options(&self) -> CopyOptions {
        CopyOptions {
            backend: self.backend,
            block_size: self.block_size_bytes(),
            queue_depth: self.queue_depth,
            direct_io: self.direct,
        }
    }

    /// Validate path-level arguments before any file is touched.
    ///
    /// # Errors
    ///
    /// Returns an error if the source does not exist or is not a regular
    /// file, or if source and destination name the same path.
    pub fn validate(&self) -> Result<()> {
        if !self.source.exists() {
            bail!("source file '{}' does not exist", self.source.display());
        }
        if !self.source.is_file() {
            bail!(
                "source '{}' is not a regular file",
                self.source.display()
            );
        }
        if self.source == self.destination {
            bail!("source and destination are the same file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse_from(std::iter::once("aiocp").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_match_the_classic_constants() {
        let args = parse(&["a", "b"]);
        assert_eq!(args.block_size_kb, 64);
        assert_eq!(args.queue_depth, 64);
        assert_eq!(args.backend, BackendKind::Auto);
        assert!(!args.direct);
    }

    #[test]
    fn block_size_is_given_in_kb() {
        let args = parse(&["a", "b", "--block-size-kb", "8"]);
        assert_eq!(args.block_size_bytes(), 8192);
    }

    #[test]
    fn backend_names_parse() {
        let args = parse(&["a", "b", "--backend", "posix-aio"]);
        assert_eq!(args.backend, BackendKind::PosixAio);
        let args = parse(&["a", "b", "--backend", "io-uring"]);
        assert_eq!(args.backend, BackendKind::IoUring);
        let args = parse(&["a", "b", "--backend", "linux-aio"]);
        assert_eq!(args.backend, BackendKind::LinuxAio);
    }

    #[test]
    fn same_source_and_destination_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        let arg = path.to_str().unwrap();
        let args = parse(&[arg, arg]);
        assert!(args.validate().is_err());
    }
}
