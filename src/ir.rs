//! Immutable command and pipeline descriptions.
//!
//! [`Cmd`] describes one process: argv atoms, per-fd operations,
//! environment overrides, working directory. [`Pipeline`] is an ordered
//! list of at least two stages connected stdout-to-stdin. Every builder
//! consumes the value and returns an updated copy, so a partially built
//! command can be cloned and extended in several directions without
//! interference.

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Standard input.
pub const STDIN: RawFd = 0;
/// Standard output.
pub const STDOUT: RawFd = 1;
/// Standard error.
pub const STDERR: RawFd = 2;

/// Input process substitution, like `<(body)`.
///
/// The body's stdout becomes readable by the consumer, either as a
/// `/dev/fd/N` argument or dup2'd onto a redirect target.
#[derive(Debug, Clone, PartialEq)]
pub struct SubIn(pub(crate) Box<Runnable>);

/// Output process substitution, like `>(body)`.
///
/// The consumer's writes become the body's stdin.
#[derive(Debug, Clone, PartialEq)]
pub struct SubOut(pub(crate) Box<Runnable>);

impl SubIn {
    /// Wrap a command or pipeline as an input substitution.
    pub fn new(body: impl Into<Runnable>) -> Self {
        SubIn(Box::new(body.into()))
    }
}

impl SubOut {
    /// Wrap a command or pipeline as an output substitution.
    pub fn new(body: impl Into<Runnable>) -> Self {
        SubOut(Box::new(body.into()))
    }
}

/// One argv atom: a literal, or a substitution reference that the planner
/// resolves to a `/dev/fd/N` path at spawn time.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Str(String),
    SubIn(SubIn),
    SubOut(SubOut),
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Str(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Str(s)
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Arg::Str(s.clone())
    }
}

impl From<&Path> for Arg {
    fn from(p: &Path) -> Self {
        Arg::Str(p.to_string_lossy().into_owned())
    }
}

impl From<PathBuf> for Arg {
    fn from(p: PathBuf) -> Self {
        Arg::Str(p.to_string_lossy().into_owned())
    }
}

impl From<SubIn> for Arg {
    fn from(sub: SubIn) -> Self {
        Arg::SubIn(sub)
    }
}

impl From<SubOut> for Arg {
    fn from(sub: SubOut) -> Self {
        Arg::SubOut(sub)
    }
}

/// One fd operation applied to the child's descriptor table.
///
/// Operations apply left-to-right; a later operation on the same target
/// fd overrides an earlier one.
#[derive(Debug, Clone, PartialEq)]
pub enum Redirect {
    /// Open `path` for writing and direct `fd` at it (`>`, `>>`, `2>`).
    ToFile {
        fd: RawFd,
        path: PathBuf,
        append: bool,
    },
    /// Open `path` for reading and direct `fd` from it (`<`).
    FromFile { fd: RawFd, path: PathBuf },
    /// Feed literal bytes into `fd` through a pipe (`<<<`).
    FromData { fd: RawFd, data: Vec<u8> },
    /// Make `dst` an alias of what `src` currently names (`2>&1` is
    /// `src: 1, dst: 2`).
    ToFd { src: RawFd, dst: RawFd },
    /// Close `fd` in the child (`3>&-`).
    Close { fd: RawFd },
    /// Read `fd` from a process substitution (`< <(body)`).
    FromSub { fd: RawFd, sub: SubIn },
    /// Write `fd` into a process substitution (`> >(body)`).
    ToSub { fd: RawFd, sub: SubOut },
}

/// An immutable description of one command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Cmd {
    pub(crate) args: Vec<Arg>,
    pub(crate) redirects: Vec<Redirect>,
    pub(crate) env_vars: Vec<(String, Option<String>)>,
    pub(crate) working_dir: Option<PathBuf>,
}

impl Cmd {
    /// Start a command from its program name.
    pub fn new(program: impl Into<Arg>) -> Self {
        Cmd {
            args: vec![program.into()],
            ..Cmd::default()
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Pipe this command into another stage.
    pub fn pipe(self, next: impl Into<Runnable>) -> Pipeline {
        Runnable::Cmd(self).pipe(next)
    }

    fn redirect(mut self, r: Redirect) -> Self {
        self.redirects.push(r);
        self
    }

    /// Read stdin from a file.
    pub fn read(self, path: impl Into<PathBuf>) -> Self {
        self.read_fd(STDIN, path)
    }

    /// Read an arbitrary fd from a file.
    pub fn read_fd(self, fd: RawFd, path: impl Into<PathBuf>) -> Self {
        self.redirect(Redirect::FromFile {
            fd,
            path: path.into(),
        })
    }

    /// Write stdout to a file, truncating it.
    pub fn write(self, path: impl Into<PathBuf>) -> Self {
        self.write_fd(STDOUT, path, false)
    }

    /// Append stdout to a file.
    pub fn append(self, path: impl Into<PathBuf>) -> Self {
        self.write_fd(STDOUT, path, true)
    }

    /// Write an arbitrary fd to a file.
    pub fn write_fd(self, fd: RawFd, path: impl Into<PathBuf>, append: bool) -> Self {
        self.redirect(Redirect::ToFile {
            fd,
            path: path.into(),
            append,
        })
    }

    /// Feed literal bytes to stdin.
    pub fn feed(self, data: impl Into<Vec<u8>>) -> Self {
        self.feed_fd(STDIN, data)
    }

    /// Feed literal bytes to an arbitrary fd.
    pub fn feed_fd(self, fd: RawFd, data: impl Into<Vec<u8>>) -> Self {
        self.redirect(Redirect::FromData {
            fd,
            data: data.into(),
        })
    }

    /// Make `dst` an alias of `src`; `2>&1` is `dup_fd(1, 2)`.
    pub fn dup_fd(self, src: RawFd, dst: RawFd) -> Self {
        self.redirect(Redirect::ToFd { src, dst })
    }

    /// Close an fd in the child.
    pub fn close_fd(self, fd: RawFd) -> Self {
        self.redirect(Redirect::Close { fd })
    }

    /// Read stdin from a process substitution.
    pub fn read_sub(self, sub: SubIn) -> Self {
        self.read_sub_fd(STDIN, sub)
    }

    /// Read an arbitrary fd from a process substitution.
    pub fn read_sub_fd(self, fd: RawFd, sub: SubIn) -> Self {
        self.redirect(Redirect::FromSub { fd, sub })
    }

    /// Write stdout into a process substitution.
    pub fn write_sub(self, sub: SubOut) -> Self {
        self.write_sub_fd(STDOUT, sub)
    }

    /// Write an arbitrary fd into a process substitution.
    pub fn write_sub_fd(self, fd: RawFd, sub: SubOut) -> Self {
        self.redirect(Redirect::ToSub { fd, sub })
    }

    /// Override one environment variable in the child.
    ///
    /// The child keeps the parent environment with these overrides
    /// applied on top.
    pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), Some(val.into())));
        self
    }

    /// Remove a variable from the child environment.
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), None));
        self
    }

    /// Run the child in this directory. `PWD` follows.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Execute and return the exit code.
    pub async fn run(self) -> Result<i32> {
        crate::exec::run(self).await
    }

    /// Execute and return captured stdout as UTF-8.
    pub async fn out(self) -> Result<String> {
        crate::exec::out(self).await
    }

    /// Execute and return captured stdout bytes.
    pub async fn out_bytes(self) -> Result<Vec<u8>> {
        crate::exec::out_bytes(self).await
    }

    pub(crate) fn describe(&self) -> String {
        let words: Vec<String> = self
            .args
            .iter()
            .map(|arg| match arg {
                Arg::Str(s) => s.clone(),
                Arg::SubIn(_) => "<(...)".to_string(),
                Arg::SubOut(_) => ">(...)".to_string(),
            })
            .collect();
        words.join(" ")
    }
}

/// An immutable pipeline of at least two commands.
///
/// Construction flattens nested pipelines, so `a | (b | c)` and
/// `(a | b) | c` store the same stage list.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub(crate) stages: Vec<Cmd>,
}

impl Pipeline {
    /// The flattened stages, left to right.
    pub fn stages(&self) -> &[Cmd] {
        &self.stages
    }

    /// Append another stage.
    pub fn pipe(self, next: impl Into<Runnable>) -> Pipeline {
        Runnable::Pipeline(self).pipe(next)
    }

    fn map_first(mut self, f: impl FnOnce(Cmd) -> Cmd) -> Self {
        if !self.stages.is_empty() {
            let first = self.stages.remove(0);
            self.stages.insert(0, f(first));
        }
        self
    }

    fn map_last(mut self, f: impl FnOnce(Cmd) -> Cmd) -> Self {
        if let Some(last) = self.stages.pop() {
            self.stages.push(f(last));
        }
        self
    }

    /// Read the first stage's stdin from a file.
    pub fn read(self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.map_first(|c| c.read(path))
    }

    /// Read an arbitrary fd of the first stage from a file.
    pub fn read_fd(self, fd: RawFd, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.map_first(|c| c.read_fd(fd, path))
    }

    /// Write the last stage's stdout to a file, truncating it.
    pub fn write(self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.map_last(|c| c.write(path))
    }

    /// Append the last stage's stdout to a file.
    pub fn append(self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.map_last(|c| c.append(path))
    }

    /// Write an arbitrary fd of the last stage to a file.
    pub fn write_fd(self, fd: RawFd, path: impl Into<PathBuf>, append: bool) -> Self {
        let path = path.into();
        self.map_last(|c| c.write_fd(fd, path, append))
    }

    /// Feed literal bytes to the first stage's stdin.
    pub fn feed(self, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        self.map_first(|c| c.feed(data))
    }

    /// Feed literal bytes to an arbitrary fd of the first stage.
    pub fn feed_fd(self, fd: RawFd, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        self.map_first(|c| c.feed_fd(fd, data))
    }

    /// Close an fd in the last stage.
    pub fn close_fd(self, fd: RawFd) -> Self {
        self.map_last(|c| c.close_fd(fd))
    }

    /// Execute and return the pipefail exit code.
    pub async fn run(self) -> Result<i32> {
        crate::exec::run(self).await
    }

    /// Execute and return captured stdout as UTF-8.
    pub async fn out(self) -> Result<String> {
        crate::exec::out(self).await
    }

    /// Execute and return captured stdout bytes.
    pub async fn out_bytes(self) -> Result<Vec<u8>> {
        crate::exec::out_bytes(self).await
    }

    pub(crate) fn describe(&self) -> String {
        let stages: Vec<String> = self.stages.iter().map(Cmd::describe).collect();
        stages.join(" | ")
    }
}

/// Anything the engine can execute: a single command or a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Runnable {
    Cmd(Cmd),
    Pipeline(Pipeline),
}

impl Runnable {
    /// Pipe into another stage, flattening nested pipelines on both sides.
    pub fn pipe(self, next: impl Into<Runnable>) -> Pipeline {
        let mut stages = self.into_stages();
        stages.extend(next.into().into_stages());
        Pipeline { stages }
    }

    fn into_stages(self) -> Vec<Cmd> {
        match self {
            Runnable::Cmd(c) => vec![c],
            Runnable::Pipeline(p) => p.stages,
        }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Runnable::Cmd(c) => c.describe(),
            Runnable::Pipeline(p) => p.describe(),
        }
    }
}

impl From<Cmd> for Runnable {
    fn from(c: Cmd) -> Self {
        Runnable::Cmd(c)
    }
}

impl From<Pipeline> for Runnable {
    fn from(p: Pipeline) -> Self {
        Runnable::Pipeline(p)
    }
}

/// Build a command from argv atoms.
pub fn cmd<I, A>(argv: I) -> Cmd
where
    I: IntoIterator<Item = A>,
    A: Into<Arg>,
{
    Cmd {
        args: argv.into_iter().map(Into::into).collect(),
        ..Cmd::default()
    }
}

/// Join stages into one pipeline, flattening nested pipelines.
pub fn pipeline<I, R>(stages: I) -> Pipeline
where
    I: IntoIterator<Item = R>,
    R: Into<Runnable>,
{
    let mut flat = Vec::new();
    for stage in stages {
        flat.extend(stage.into().into_stages());
    }
    Pipeline { stages: flat }
}
