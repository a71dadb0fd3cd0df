//! CLI surface. `clap` derive `Cli`/`Commands` covering the three core
//! commands (`decrypt`, `key`, `server`) plus a few auxiliary debugging
//! commands kept as harmless superset surface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scans a running process for the master key (and, on the v4
    /// schema, the image key), validating each candidate by attempting
    /// to verify page 1's HMAC / decrypt a known thumbnail.
    Key {
        /// Process id to scan. If omitted, every matching target process
        /// is enumerated and scanned in turn.
        #[arg(long)]
        pid: Option<u32>,

        /// Schema generation to validate against.
        #[arg(long, value_enum, default_value = "v4")]
        version: SchemaArg,

        /// Host platform override; defaults to the current platform.
        #[arg(long, value_enum)]
        platform: Option<PlatformArg>,

        /// Encrypted page-1 bytes (hex) to validate the master key
        /// against, e.g. the first page of a target database file.
        #[arg(long)]
        sample_page1: Option<PathBuf>,
    },

    /// Decrypts a database file or directory of database files.
    Decrypt {
        /// Master key, as hex.
        #[arg(short, long, required = true)]
        data_key: String,

        /// Schema generation the key and files belong to.
        #[arg(long, value_enum, default_value = "v4")]
        version: SchemaArg,

        /// Database path (file or directory).
        #[arg(short = 'i', long, required = true)]
        db_path: PathBuf,

        /// Output directory.
        #[arg(short, long, default_value = "decrypted")]
        work_dir: PathBuf,
    },

    /// Starts the HTTP query server over a decrypted data directory.
    Server {
        /// Decrypted data directory the DB pool watches.
        #[arg(long, required = true)]
        data_dir: PathBuf,

        /// Image key, as hex, for media decoding.
        #[arg(long)]
        img_key: Option<String>,

        /// Bind address port.
        #[arg(short, long, default_value_t = 5000)]
        addr: u16,

        /// Listen on 0.0.0.0 instead of 127.0.0.1.
        #[arg(long, default_value_t = false)]
        online: bool,

        /// Decrypt any not-yet-decrypted db files found under data_dir
        /// on startup, using `--data-key`/`--version`.
        #[arg(long, default_value_t = false)]
        auto_decrypt: bool,

        #[arg(long, requires = "auto_decrypt")]
        data_key: Option<String>,

        #[arg(long, value_enum, default_value = "v4")]
        version: SchemaArg,
    },

    /// Lists the group databases the pool would discover under a data
    /// directory, without opening a server.
    DbShow {
        #[arg(long, required = true)]
        data_dir: PathBuf,
    },

    /// Dumps the rows of one table from a database file (debugging aid).
    TableDump {
        #[arg(long, required = true)]
        db_path: PathBuf,

        #[arg(long, required = true)]
        table: String,
    },

    /// Merges several decrypted message-shard databases into one file.
    /// [test/debugging feature]
    Merge {
        #[arg(short, long, required = true)]
        db_path: String,

        #[arg(short, long, default_value = "decrypted")]
        out_path: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum SchemaArg {
    V3,
    V4,
}

impl From<SchemaArg> for crate::model::SchemaVersion {
    fn from(value: SchemaArg) -> Self {
        match value {
            SchemaArg::V3 => crate::model::SchemaVersion::V3,
            SchemaArg::V4 => crate::model::SchemaVersion::V4,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum PlatformArg {
    Windows,
    Macos,
}

impl From<PlatformArg> for crate::model::Platform {
    fn from(value: PlatformArg) -> Self {
        match value {
            PlatformArg::Windows => crate::model::Platform::Windows,
            PlatformArg::Macos => crate::model::Platform::MacOs,
        }
    }
}

/// Parses a hex-encoded key into a fixed-size array, for the
/// `--data-key`/`--img-key` flags.
pub fn parse_hex_key<const N: usize>(hex_str: &str) -> crate::error::CoreResult<[u8; N]> {
    let bytes = hex::decode(hex_str.trim()).map_err(|e| crate::error::CoreError::InvalidPath(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| crate::error::CoreError::InvalidPath(format!("expected {} bytes, got {}", N, v.len())))
}
