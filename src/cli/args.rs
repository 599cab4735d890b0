//! CLI argument definitions using clap
//!
//! ```text
//! regionvault backup --comment "before upgrade"
//! regionvault restore 12 --world overworld --from -4,-4 --to 4,4
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::partition::ChunkPos;

/// regionvault: deduplicated live backups of a region-partitioned dataset
#[derive(Parser, Debug)]
#[command(name = "regionvault")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./regionvault.json")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the blob store and an empty catalog
    Init,

    /// Take a backup of the current dataset
    Backup {
        #[arg(long)]
        comment: Option<String>,
    },

    /// List backups, newest first
    List {
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one backup
    Info { id: u64 },

    /// Verify every blob a backup references
    Check { id: u64 },

    /// Restore a backup into the dataset
    Restore {
        id: u64,

        /// Restore even if verification fails
        #[arg(long)]
        force: bool,

        /// Limit the restore to a chunk box in one world
        #[arg(long, requires_all = ["from", "to"])]
        world: Option<String>,

        /// First corner, `x,z`
        #[arg(long, requires = "world", allow_hyphen_values = true)]
        from: Option<ChunkPos>,

        /// Opposite corner, `x,z`
        #[arg(long, requires = "world", allow_hyphen_values = true)]
        to: Option<ChunkPos>,

        /// Skip the automatic safety backup
        #[arg(long)]
        no_safety_backup: bool,
    },

    /// Delete a backup and release its blobs
    Delete { id: u64 },

    /// Write a backup as a tar archive
    Export {
        id: u64,
        #[arg(long)]
        output: PathBuf,
    },

    /// Add a backup from a tar archive
    Import { file: PathBuf },

    /// Remove blobs no backup references
    Gc,

    /// Store usage, latest backup and counters
    Status,

    /// Run scheduled backups until interrupted
    Watch {
        /// Seconds between schedule checks
        #[arg(long, default_value_t = 60)]
        tick_secs: u64,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_area_restore() {
        let cli = Cli::try_parse_from([
            "regionvault", "restore", "7", "--world", "overworld", "--from", "-4,-4", "--to", "4,4",
        ])
        .unwrap();
        match cli.command {
            Command::Restore { id, world, from, to, force, .. } => {
                assert_eq!(id, 7);
                assert_eq!(world.as_deref(), Some("overworld"));
                assert_eq!(from, Some(ChunkPos::new(-4, -4)));
                assert_eq!(to, Some(ChunkPos::new(4, 4)));
                assert!(!force);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.config, PathBuf::from("./regionvault.json"));
    }

    #[test]
    fn test_world_requires_corners() {
        assert!(Cli::try_parse_from(["regionvault", "restore", "7", "--world", "overworld"]).is_err());
    }
}
