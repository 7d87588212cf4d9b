//! Error type for pipeline construction and execution.

use std::io;
use std::os::fd::RawFd;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while planning or running a command tree.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The OS refused to create a child process.
    #[error("failed to spawn `{argv}`: {source}")]
    Spawn {
        argv: String,
        #[source]
        source: io::Error,
    },

    /// A pipe, redirect file, or feeder operation failed unexpectedly.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A captured command exited non-zero.
    ///
    /// Only [`out`](crate::out) and [`out_bytes`](crate::out_bytes) raise
    /// this; [`run`](crate::run) reports non-zero exits as plain codes.
    #[error("`{argv}` exited with status {code}")]
    NonZeroExit {
        argv: String,
        code: i32,
        stdout: Vec<u8>,
    },

    /// A redirect used a descriptor that is not open in the child.
    #[error("fd {fd} is not open in the child")]
    BadRedirect { fd: RawFd },

    /// A command resolved to an empty argv.
    #[error("command has no program to run")]
    EmptyCommand,

    /// A planner invariant was violated.
    #[error("internal error: {0}")]
    Internal(&'static str),
}
