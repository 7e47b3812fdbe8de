//! Configuration types for bcast
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - The optional TOML config file
//! - Group discovery from the launcher environment
//! - Runtime configuration with validation
//!
//! Resolution order: command line / `BCAST_*` environment → config file →
//! launcher environment (rank and size only) → defaults.

use crate::collective::{Rank, ORIGIN};
use crate::error::ConfigError;
use crate::streaming::{DEFAULT_CHUNK_CAPACITY, MAX_CHUNK_CAPACITY};
use clap::{ArgAction, Parser};
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Port the origin listens on when nothing else says otherwise
pub const DEFAULT_PORT: u16 = 47470;

/// How long the group may take to assemble
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 60;

/// Destination used when none is given
pub const DEFAULT_DEST: &str = "/tmp";

/// Launcher variables that carry (rank, size), in lookup order
const LAUNCHER_ENV: &[(&str, &str)] = &[
    ("PMI_RANK", "PMI_SIZE"),
    ("OMPI_COMM_WORLD_RANK", "OMPI_COMM_WORLD_SIZE"),
    ("SLURM_PROCID", "SLURM_NTASKS"),
];

/// Broadcast a directory tree from one node to every node of a group
#[derive(Parser, Debug, Clone)]
#[command(
    name = "bcast",
    version,
    about = "Broadcast a directory tree from one node to every node of a group",
    long_about = "Packs SOURCE with tar on the origin (rank 0), broadcasts the archive stream \
                  to every rank in fixed-size chunks, and unpacks it under DEST on each node.\n\n\
                  Start one process per node. Rank and group size come from --rank/--size, \
                  BCAST_RANK/BCAST_SIZE, or the MPI/Slurm launcher environment.",
    after_help = "EXAMPLES:\n    \
        mpiexec -ppn 1 bcast --origin node0:47470 /lus/models/llama /local/scratch\n    \
        bcast --rank 0 --size 4 --no-root-write ./env /tmp\n    \
        bcast --rank 2 --size 4 --origin node0:47470 ./env /tmp"
)]
pub struct CliArgs {
    /// Directory or file to broadcast (only read on the origin)
    #[arg(value_name = "SOURCE")]
    pub source: PathBuf,

    /// Directory to unpack into on every node
    #[arg(value_name = "DEST", default_value = DEFAULT_DEST)]
    pub dest: PathBuf,

    /// Do not unpack on the origin itself
    #[arg(long)]
    pub no_root_write: bool,

    /// Chunk buffer size (e.g. 1G, 256M, 65536)
    #[arg(long, value_name = "SIZE", value_parser = parse_size)]
    pub chunk_size: Option<u64>,

    /// This process's rank
    #[arg(long, env = "BCAST_RANK", value_name = "N")]
    pub rank: Option<Rank>,

    /// Number of processes in the group
    #[arg(long, env = "BCAST_SIZE", value_name = "N")]
    pub size: Option<usize>,

    /// Origin address peers connect to
    #[arg(long, env = "BCAST_ORIGIN", value_name = "HOST:PORT")]
    pub origin: Option<String>,

    /// Address the origin listens on
    #[arg(long, env = "BCAST_BIND", value_name = "ADDR")]
    pub bind: Option<SocketAddr>,

    /// Seconds allowed for the group to assemble
    #[arg(long, value_name = "SECS")]
    pub connect_timeout: Option<u64>,

    /// tar program used for packing and unpacking
    #[arg(long, env = "BCAST_TAR", value_name = "PROGRAM")]
    pub tar: Option<String>,

    /// TOML config file
    #[arg(short, long, env = "BCAST_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Show a progress spinner on the origin
    #[arg(short = 'P', long)]
    pub progress: bool,

    /// Verbose output (repeat for more)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only report errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

/// Parse a byte count with an optional binary suffix (K, M, G, T).
pub fn parse_size(value: &str) -> Result<u64, ConfigError> {
    let trimmed = value.trim();
    let unparsable = || ConfigError::UnparsableSize(value.to_string());

    let upper = trimmed.to_ascii_uppercase();
    let digits = upper
        .strip_suffix("IB")
        .or_else(|| upper.strip_suffix('B'))
        .unwrap_or(upper.as_str());
    let (number, shift) = match digits.chars().last() {
        Some('K') => (&digits[..digits.len() - 1], 10),
        Some('M') => (&digits[..digits.len() - 1], 20),
        Some('G') => (&digits[..digits.len() - 1], 30),
        Some('T') => (&digits[..digits.len() - 1], 40),
        Some(_) => (digits, 0),
        None => return Err(unparsable()),
    };

    let base: u64 = number.trim().parse().map_err(|_| unparsable())?;
    base.checked_mul(1u64 << shift).ok_or_else(unparsable)
}

// =============================================================================
// Config file
// =============================================================================

/// A size written either as a plain integer or as a string with a suffix
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SizeValue {
    Bytes(u64),
    Text(String),
}

impl SizeValue {
    pub fn to_bytes(&self) -> Result<u64, ConfigError> {
        match self {
            SizeValue::Bytes(n) => Ok(*n),
            SizeValue::Text(s) => parse_size(s),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub transfer: TransferSection,
    pub group: GroupSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferSection {
    /// Chunk buffer size
    pub chunk_size: Option<SizeValue>,
    /// Whether the origin also unpacks locally
    pub origin_writes_locally: Option<bool>,
    /// tar program
    pub tar_program: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GroupSection {
    /// Origin address peers connect to
    pub origin: Option<String>,
    /// Address the origin listens on
    pub bind: Option<SocketAddr>,
    /// Seconds allowed for the group to assemble
    pub connect_timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&text).map_err(|reason| ConfigError::ConfigFile {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }
}

// =============================================================================
// Validated configuration
// =============================================================================

/// Where this process sits in the group and how to reach the others
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    pub rank: Rank,
    pub size: usize,
    /// Origin address; always present for peers of groups larger than one
    pub origin: Option<String>,
    /// Listen address used when this process is the origin
    pub bind: SocketAddr,
    pub connect_timeout: Duration,
}

impl GroupConfig {
    pub fn is_origin(&self) -> bool {
        self.rank == ORIGIN
    }
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub chunk_capacity: usize,
    pub origin_writes_locally: bool,
    pub tar_program: String,
    pub show_progress: bool,
    pub group: GroupConfig,
}

impl BroadcastConfig {
    /// Build from CLI args, reading the config file and launcher environment.
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(args, file, |key| std::env::var(key).ok())
    }

    /// Merge CLI args over `file`, with `env` supplying launcher variables.
    pub fn resolve<F>(args: CliArgs, file: FileConfig, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let chunk_size = match (args.chunk_size, &file.transfer.chunk_size) {
            (Some(n), _) => n,
            (None, Some(value)) => value.to_bytes()?,
            (None, None) => DEFAULT_CHUNK_CAPACITY as u64,
        };
        if chunk_size == 0 || chunk_size > MAX_CHUNK_CAPACITY as u64 {
            return Err(ConfigError::InvalidChunkSize {
                value: chunk_size,
                max: MAX_CHUNK_CAPACITY,
            });
        }

        let (rank, size) = match (args.rank, args.size) {
            (Some(rank), Some(size)) => (rank, size),
            (rank, size) => {
                let detected = detect_launcher_group(&env);
                (
                    rank.or(detected.map(|(r, _)| r)).unwrap_or(ORIGIN),
                    size.or(detected.map(|(_, s)| s)).unwrap_or(1),
                )
            }
        };
        if size == 0 {
            return Err(ConfigError::EmptyGroup);
        }
        if rank >= size {
            return Err(ConfigError::RankOutOfRange { rank, size });
        }

        let origin = args.origin.or(file.group.origin);
        if rank != ORIGIN && size > 1 && origin.is_none() {
            return Err(ConfigError::MissingOrigin { rank });
        }

        let bind = match args.bind.or(file.group.bind) {
            Some(bind) => bind,
            None => {
                let port = match &origin {
                    Some(addr) => origin_port(addr)?,
                    None => DEFAULT_PORT,
                };
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
            }
        };

        let connect_timeout = Duration::from_secs(
            args.connect_timeout
                .or(file.group.connect_timeout_secs)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        );

        let origin_writes_locally =
            !args.no_root_write && file.transfer.origin_writes_locally.unwrap_or(true);

        Ok(Self {
            source: args.source,
            dest: args.dest,
            chunk_capacity: chunk_size as usize,
            origin_writes_locally,
            tar_program: args
                .tar
                .or(file.transfer.tar_program)
                .unwrap_or_else(|| "tar".to_string()),
            show_progress: args.progress,
            group: GroupConfig {
                rank,
                size,
                origin,
                bind,
                connect_timeout,
            },
        })
    }
}

/// Rank and size as set by an MPI or Slurm launcher, if any.
pub fn detect_launcher_group<F>(env: F) -> Option<(Rank, usize)>
where
    F: Fn(&str) -> Option<String>,
{
    LAUNCHER_ENV.iter().find_map(|&(rank_key, size_key)| {
        let rank = env(rank_key)?.trim().parse().ok()?;
        let size = env(size_key)?.trim().parse().ok()?;
        Some((rank, size))
    })
}

fn origin_port(addr: &str) -> Result<u16, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidAddress {
        value: addr.to_string(),
        reason: reason.to_string(),
    };
    let (_, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    port.parse().map_err(|_| invalid("port is not a number"))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["bcast"];
        argv.extend_from_slice(extra);
        CliArgs::try_parse_from(argv).unwrap()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("65536").unwrap(), 65536);
        assert_eq!(parse_size("512K").unwrap(), 512 * 1024);
        assert_eq!(parse_size("64m").unwrap(), 64 << 20);
        assert_eq!(parse_size("1G").unwrap(), 1 << 30);
        assert_eq!(parse_size("1GiB").unwrap(), 1 << 30);
        assert_eq!(parse_size("2GB").unwrap(), 2 << 30);
        assert!(parse_size("").is_err());
        assert!(parse_size("fast").is_err());
        assert!(parse_size("99999999999T").is_err());
    }

    #[test]
    fn test_defaults_single_node() {
        let config = BroadcastConfig::resolve(args(&["./src"]), FileConfig::default(), no_env)
            .unwrap();

        assert_eq!(config.dest, PathBuf::from("/tmp"));
        assert_eq!(config.chunk_capacity, DEFAULT_CHUNK_CAPACITY);
        assert!(config.origin_writes_locally);
        assert_eq!(config.tar_program, "tar");
        assert_eq!(config.group.rank, 0);
        assert_eq!(config.group.size, 1);
        assert_eq!(config.group.bind.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_no_root_write_flag() {
        let config = BroadcastConfig::resolve(
            args(&["--no-root-write", "./src", "/scratch"]),
            FileConfig::default(),
            no_env,
        )
        .unwrap();
        assert!(!config.origin_writes_locally);
        assert_eq!(config.dest, PathBuf::from("/scratch"));
    }

    #[test]
    fn test_launcher_env_supplies_rank_and_size() {
        let env: HashMap<&str, &str> = [("PMI_RANK", "3"), ("PMI_SIZE", "8")].into();
        let lookup = |k: &str| env.get(k).map(|v| v.to_string());

        let config = BroadcastConfig::resolve(
            args(&["--origin", "node0:5000", "./src"]),
            FileConfig::default(),
            lookup,
        )
        .unwrap();

        assert_eq!(config.group.rank, 3);
        assert_eq!(config.group.size, 8);
        assert_eq!(config.group.bind.port(), 5000);
        assert!(!config.group.is_origin());
    }

    #[test]
    fn test_detect_launcher_group_order() {
        let env: HashMap<&str, &str> = [
            ("OMPI_COMM_WORLD_RANK", "1"),
            ("OMPI_COMM_WORLD_SIZE", "2"),
            ("SLURM_PROCID", "5"),
            ("SLURM_NTASKS", "6"),
        ]
        .into();
        let found = detect_launcher_group(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(found, Some((1, 2)));
        assert_eq!(detect_launcher_group(no_env), None);
    }

    #[test]
    fn test_peer_requires_origin() {
        let err = BroadcastConfig::resolve(
            args(&["--rank", "1", "--size", "4", "./src"]),
            FileConfig::default(),
            no_env,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingOrigin { rank: 1 }));
    }

    #[test]
    fn test_rank_out_of_range() {
        let err = BroadcastConfig::resolve(
            args(&["--rank", "4", "--size", "4", "./src"]),
            FileConfig::default(),
            no_env,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::RankOutOfRange { rank: 4, size: 4 }));
    }

    #[test]
    fn test_chunk_size_bounds() {
        let err = BroadcastConfig::resolve(
            args(&["--chunk-size", "3G", "./src"]),
            FileConfig::default(),
            no_env,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidChunkSize { .. }));

        let err = BroadcastConfig::resolve(
            args(&["--chunk-size", "0", "./src"]),
            FileConfig::default(),
            no_env,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidChunkSize { value: 0, .. }));
    }

    #[test]
    fn test_file_config_is_overridden_by_cli() {
        let file = FileConfig::parse(
            r#"
            [transfer]
            chunk_size = "64M"
            origin_writes_locally = false
            tar_program = "gtar"

            [group]
            origin = "head:6000"
            connect_timeout_secs = 5
            "#,
        )
        .unwrap();

        let config = BroadcastConfig::resolve(
            args(&["--chunk-size", "1M", "--rank", "2", "--size", "3", "./src"]),
            file,
            no_env,
        )
        .unwrap();

        assert_eq!(config.chunk_capacity, 1 << 20);
        assert!(!config.origin_writes_locally);
        assert_eq!(config.tar_program, "gtar");
        assert_eq!(config.group.origin.as_deref(), Some("head:6000"));
        assert_eq!(config.group.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.group.bind.port(), 6000);
    }

    #[test]
    fn test_file_config_numeric_chunk_size() {
        let file = FileConfig::parse("[transfer]\nchunk_size = 4096\n").unwrap();
        assert_eq!(file.transfer.chunk_size, Some(SizeValue::Bytes(4096)));
    }

    #[test]
    fn test_file_config_rejects_unknown_keys() {
        assert!(FileConfig::parse("[transfer]\nchunk = 1\n").is_err());
    }

    #[test]
    fn test_origin_without_port_is_invalid() {
        let err = BroadcastConfig::resolve(
            args(&["--rank", "1", "--size", "2", "--origin", "head", "./src"]),
            FileConfig::default(),
            no_env,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress { .. }));
    }
}
