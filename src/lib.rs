//! Shell-style command pipelines without a shell.
//!
//! Build an immutable description of a command tree (single commands,
//! pipelines, per-fd redirections, process substitutions), then execute
//! it. All stages run concurrently, wired through anonymous pipes the way
//! a POSIX shell with `set -o pipefail` would wire them, and no descriptor
//! or child process outlives the execution on any exit path.
//!
//! ```no_run
//! use pipework::{cmd, out};
//!
//! # async fn demo() -> pipework::Result<()> {
//! let text = out(cmd(["echo", "hello"]).pipe(cmd(["tr", "a-z", "A-Z"]))).await?;
//! assert_eq!(text, "HELLO\n");
//! # Ok(())
//! # }
//! ```
//!
//! There is no shell interpreter here: no globbing, word splitting,
//! variable expansion, or `&&`/`||` sequencing. Host-language control
//! flow covers those.

mod aio;
mod error;
mod exec;
pub mod fdops;
mod ir;

pub use error::{Error, Result};
pub use exec::{out, out_bytes, prepare, run, ExecResult, Execution};
pub use ir::{
    cmd, pipeline, Arg, Cmd, Pipeline, Redirect, Runnable, SubIn, SubOut, STDERR, STDIN, STDOUT,
};
