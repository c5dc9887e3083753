//! Command implementations for the CLI.
//!
//! Each command is implemented in its own module.

pub mod errors;
pub mod extract;
pub mod init;
pub mod watch;
