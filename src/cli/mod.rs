//! Command-line interface
//!
//! - init: create the blob store and catalog
//! - backup / list / info / check / delete: catalog operations
//! - restore: restore into the live dataset, optionally one area
//! - export / import: tar archives
//! - gc / status: store maintenance
//! - watch: scheduled backups

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{run, run_command};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::write_response;
