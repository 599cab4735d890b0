//! regionvault CLI entry point
//!
//! Parses arguments, dispatches to `cli::run`, prints errors to stderr
//! and exits non-zero on failure. Everything else lives in the library.

use regionvault::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
