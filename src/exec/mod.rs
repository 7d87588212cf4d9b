//! Process-tree planning and execution.
//!
//! [`prepare`] walks the IR, allocates pipes, and spawns every process in
//! dependency order, yielding an [`Execution`]; [`Execution::wait`] drives
//! the spawned tree to completion and applies pipefail. The descriptor
//! choreography follows two layers, like a shell: pipeline pipes are wired
//! to stdin/stdout by the spawn facility itself, then the command's own fd
//! operations replay in the child between fork and exec, so an explicit
//! redirect naturally overrides the pipe connection.
//!
//! Parent-side descriptor hygiene is ownership: each pipe end lives in an
//! `OwnedFd` with exactly one holder, crossing into a child by move and
//! closing in the parent the moment the spawn that inherits it returns.

mod tree;


use std::collections::BTreeSet;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use futures::future::join_all;
use tokio::process::Command;

use crate::aio;
use crate::error::{Error, Result};
use crate::fdops::{ChildOp, FdTable};
use crate::ir::{Arg, Cmd, Pipeline, Redirect, Runnable};
use tree::{CmdNode, Feeder, Node};

/// Child-side fd numbers for renumbered pipe ends start here, clear of
/// stdio and of the small fds redirects usually target.
const SLOT_BASE: RawFd = 10;

/// A spawned, still-running command tree.
///
/// Returned by [`prepare`]. Await [`wait`](Execution::wait) to drive it to
/// completion. Dropping an `Execution` without waiting kills every live
/// child (the runtime reaps them) and closes every held descriptor, so an
/// abandoned execution leaks nothing.
#[derive(Debug)]
pub struct Execution {
    tree: Node,
    cmd: Runnable,
}

/// Outcome of a completed execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecResult {
    /// Pipefail exit code: the rightmost non-zero root process, or zero
    /// if every root process succeeded. Signal deaths count as
    /// `128 + signum`.
    pub code: i32,
    /// The IR that was executed, for reporting.
    pub cmd: Runnable,
}

/// Spawn a command tree without waiting for it.
///
/// Must be called from within a Tokio runtime. On failure, every process
/// already spawned is killed and every descriptor allocated so far is
/// closed before the error surfaces.
pub fn prepare(node: impl Into<Runnable>) -> Result<Execution> {
    let cmd = node.into();
    let tree = spawn_node(&cmd, None, None)?;
    Ok(Execution { tree, cmd })
}

/// Execute and return the pipefail exit code.
///
/// Non-zero exits are ordinary results here, not errors.
pub async fn run(node: impl Into<Runnable>) -> Result<i32> {
    Ok(prepare(node)?.wait().await?.code)
}

/// Execute, capture stdout, and decode it as UTF-8.
///
/// A non-zero exit becomes [`Error::NonZeroExit`] carrying the command's
/// argv and whatever output was captured before it died.
pub async fn out(node: impl Into<Runnable>) -> Result<String> {
    let bytes = out_bytes(node).await?;
    String::from_utf8(bytes)
        .map_err(|err| Error::Io(io::Error::new(io::ErrorKind::InvalidData, err)))
}

/// Execute and capture raw stdout bytes.
pub async fn out_bytes(node: impl Into<Runnable>) -> Result<Vec<u8>> {
    let node = node.into();
    let (rd, wr) = aio::pipe()?;
    let execution = Execution {
        tree: spawn_node(&node, None, Some(wr))?,
        cmd: node.clone(),
    };
    // Read while waiting: a child filling the pipe must not deadlock
    // against a parent that only starts reading afterwards.
    let (result, stdout) = tokio::join!(execution.wait(), aio::read_all(rd));
    let result = result?;
    let stdout = stdout?;
    if result.code != 0 {
        return Err(Error::NonZeroExit {
            argv: node.describe(),
            code: result.code,
            stdout,
        });
    }
    Ok(stdout)
}

impl Execution {
    /// Wait for every process in the tree (substitution helpers included)
    /// and for every pending stdin feed, then apply pipefail over the
    /// root processes.
    ///
    /// All children are reaped before this returns, on the error paths
    /// too. If the future is dropped instead, the tree's ownership takes
    /// over: live children are killed and descriptors closed.
    pub async fn wait(mut self) -> Result<ExecResult> {
        let feeders = self.tree.take_feeders();
        let feeds = join_all(
            feeders
                .into_iter()
                .map(|feeder| aio::write_all(feeder.fd, feeder.data)),
        );
        let waits = join_all(
            self.tree
                .procs()
                .into_iter()
                .map(|(child, root)| async move { (child.wait().await, root) }),
        );
        let (statuses, feed_results) = tokio::join!(waits, feeds);

        // Every child has been reaped by now; surfacing an error below
        // leaks neither processes nor descriptors.
        let mut code = 0;
        for (status, root) in statuses {
            let status = status?;
            if root {
                let stage_code = status_code(&status);
                if stage_code != 0 {
                    code = stage_code;
                }
            }
        }
        for result in feed_results {
            result?;
        }
        Ok(ExecResult {
            code,
            cmd: self.cmd,
        })
    }
}

/// Shell-convention exit code: `128 + signum` for signal deaths.
fn status_code(status: &ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

fn spawn_node(node: &Runnable, stdin: Option<OwnedFd>, stdout: Option<OwnedFd>) -> Result<Node> {
    match node {
        Runnable::Cmd(cmd) => spawn_cmd(cmd, stdin, stdout),
        Runnable::Pipeline(pipeline) => spawn_pipeline(pipeline, stdin, stdout),
    }
}

fn spawn_pipeline(
    pipeline: &Pipeline,
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
) -> Result<Node> {
    let stages = pipeline.stages();
    if stages.len() < 2 {
        return Err(Error::Internal("pipeline requires at least two stages"));
    }

    // Spawn left to right. Each stage takes ownership of its pipe ends and
    // the parent's copies die inside spawn_cmd, so once the last stage is
    // up no pipe end remains open here and EOF can propagate.
    let mut nodes = Vec::with_capacity(stages.len());
    let mut carry = stdin;
    let mut stdout = stdout;
    let last = stages.len() - 1;
    for (index, stage) in stages.iter().enumerate() {
        let stage_stdin = carry.take();
        let stage_stdout = if index == last {
            stdout.take()
        } else {
            let (rd, wr) = aio::pipe()?;
            carry = Some(rd);
            Some(wr)
        };
        nodes.push(spawn_cmd(stage, stage_stdin, stage_stdout)?);
    }
    Ok(Node::Pipeline(nodes))
}

/// A planned child-side operation, recorded before child fd numbers for
/// renumbered pipe ends are known.
enum PlanOp {
    Open {
        fd: RawFd,
        path: CString,
        flags: libc::c_int,
    },
    Dup {
        src: RawFd,
        dst: RawFd,
    },
    CloseFd {
        fd: RawFd,
    },
    /// dup2 a renumbered pipe end onto its target at this point in the
    /// op sequence.
    Wire {
        pipe: usize,
        target: RawFd,
    },
}

enum PlanArg {
    Str(String),
    /// Becomes `/dev/fd/N` once the pipe end's child number is assigned.
    Sub {
        pipe: usize,
    },
}

fn spawn_cmd(cmd: &Cmd, stdin: Option<OwnedFd>, stdout: Option<OwnedFd>) -> Result<Node> {
    let mut subs: Vec<Node> = Vec::new();
    let mut feeders: Vec<Feeder> = Vec::new();
    // Pipe ends the child must reference between fork and exec. The
    // parent's copies close when this function returns (the child holds
    // its own by then), success or not.
    let mut pipes: Vec<OwnedFd> = Vec::new();
    let mut ops: Vec<PlanOp> = Vec::new();

    for redirect in &cmd.redirects {
        match redirect {
            Redirect::ToFile { fd, path, append } => {
                let flag = if *append { libc::O_APPEND } else { libc::O_TRUNC };
                ops.push(PlanOp::Open {
                    fd: *fd,
                    path: cstring_path(path)?,
                    flags: libc::O_WRONLY | libc::O_CREAT | flag,
                });
            }
            Redirect::FromFile { fd, path } => {
                ops.push(PlanOp::Open {
                    fd: *fd,
                    path: cstring_path(path)?,
                    flags: libc::O_RDONLY,
                });
            }
            Redirect::FromData { fd, data } => {
                let (rd, wr) = aio::pipe()?;
                feeders.push(Feeder {
                    fd: wr,
                    data: data.clone(),
                });
                ops.push(PlanOp::Wire {
                    pipe: pipes.len(),
                    target: *fd,
                });
                pipes.push(rd);
            }
            Redirect::ToFd { src, dst } => {
                ops.push(PlanOp::Dup {
                    src: *src,
                    dst: *dst,
                });
            }
            Redirect::Close { fd } => {
                ops.push(PlanOp::CloseFd { fd: *fd });
            }
            Redirect::FromSub { fd, sub } => {
                let (rd, wr) = aio::pipe()?;
                subs.push(spawn_node(&sub.0, None, Some(wr))?);
                ops.push(PlanOp::Wire {
                    pipe: pipes.len(),
                    target: *fd,
                });
                pipes.push(rd);
            }
            Redirect::ToSub { fd, sub } => {
                let (rd, wr) = aio::pipe()?;
                subs.push(spawn_node(&sub.0, Some(rd), None)?);
                ops.push(PlanOp::Wire {
                    pipe: pipes.len(),
                    target: *fd,
                });
                pipes.push(wr);
            }
        }
    }

    let mut plan_args: Vec<PlanArg> = Vec::with_capacity(cmd.args.len());
    for arg in &cmd.args {
        match arg {
            Arg::Str(s) => plan_args.push(PlanArg::Str(s.clone())),
            Arg::SubIn(sub) => {
                let (rd, wr) = aio::pipe()?;
                subs.push(spawn_node(&sub.0, None, Some(wr))?);
                plan_args.push(PlanArg::Sub { pipe: pipes.len() });
                pipes.push(rd);
            }
            Arg::SubOut(sub) => {
                let (rd, wr) = aio::pipe()?;
                subs.push(spawn_node(&sub.0, Some(rd), None)?);
                plan_args.push(PlanArg::Sub { pipe: pipes.len() });
                pipes.push(wr);
            }
        }
    }

    // Pick child-side numbers for the pipe ends. A parent pipe fd could
    // collide with a redirect target or with another pipe's number, so
    // each end is renumbered first thing in the child, to a slot no other
    // operation touches.
    let mut reserved: BTreeSet<RawFd> = [0, 1, 2].into();
    for op in &ops {
        match op {
            PlanOp::Open { fd, .. } | PlanOp::CloseFd { fd } | PlanOp::Wire { target: fd, .. } => {
                reserved.insert(*fd);
            }
            PlanOp::Dup { src, dst } => {
                reserved.insert(*src);
                reserved.insert(*dst);
            }
        }
    }
    for pipe in &pipes {
        reserved.insert(pipe.as_raw_fd());
    }
    let mut slots = Vec::with_capacity(pipes.len());
    let mut next = SLOT_BASE;
    for _ in &pipes {
        while reserved.contains(&next) {
            next += 1;
        }
        reserved.insert(next);
        slots.push(next);
    }

    // Simulate the child table: renumber prologue first, then the user's
    // operations in order, layered over stdio wired by the spawn itself.
    let mut table = FdTable::with_stdio();
    for (pipe, slot) in pipes.iter().zip(&slots) {
        table.inherit(pipe.as_raw_fd());
        table.move_to(pipe.as_raw_fd(), *slot)?;
    }
    for op in ops {
        match op {
            PlanOp::Open { fd, path, flags } => table.open(fd, path, flags),
            PlanOp::Dup { src, dst } => table.dup2(src, dst)?,
            PlanOp::CloseFd { fd } => table.close(fd),
            PlanOp::Wire { pipe, target } => table.move_to(slots[pipe], target)?,
        }
    }

    let mut argv: Vec<String> = Vec::with_capacity(plan_args.len());
    for arg in plan_args {
        match arg {
            PlanArg::Str(s) => argv.push(s),
            PlanArg::Sub { pipe } => {
                let slot = slots[pipe];
                table.pass_through(slot);
                argv.push(format!("/dev/fd/{slot}"));
            }
        }
    }
    if argv.first().map_or(true, |program| program.is_empty()) {
        return Err(Error::EmptyCommand);
    }

    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]).kill_on_drop(true);
    command.stdin(match stdin {
        Some(fd) => Stdio::from(fd),
        None => Stdio::inherit(),
    });
    command.stdout(match stdout {
        Some(fd) => Stdio::from(fd),
        None => Stdio::inherit(),
    });
    for (key, value) in &cmd.env_vars {
        match value {
            Some(value) => {
                command.env(key, value);
            }
            None => {
                command.env_remove(key);
            }
        }
    }
    if let Some(dir) = &cmd.working_dir {
        command.current_dir(dir).env("PWD", dir);
    }

    let child_ops = table.ops().to_vec();
    if !child_ops.is_empty() {
        // SAFETY: the closure runs between fork and exec and performs only
        // async-signal-safe syscalls (open, dup2, close) on plain captured
        // data; nothing allocates or locks.
        unsafe {
            command.pre_exec(move || apply_child_ops(&child_ops));
        }
    }

    let child = command.spawn().map_err(|source| Error::Spawn {
        argv: argv.join(" "),
        source,
    })?;

    // The child owns its copies now; release the parent's. The dropped
    // Command also releases the stdio pipe ends it consumed, which is the
    // only way downstream readers ever observe EOF.
    drop(command);
    drop(pipes);

    Ok(Node::Cmd(Box::new(CmdNode {
        child,
        held: feeders,
        subs,
    })))
}

fn cstring_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "redirect path contains a NUL byte",
        ))
    })
}

/// Replay the planned fd table in the child, between fork and exec.
///
/// dup2 targets lose close-on-exec, so renumbered pipe ends survive into
/// the program; everything else the child inherited closes at exec.
fn apply_child_ops(ops: &[ChildOp]) -> io::Result<()> {
    for op in ops {
        match op {
            ChildOp::Open { fd, path, flags } => {
                let src = unsafe { libc::open(path.as_ptr(), *flags, 0o644 as libc::c_uint) };
                if src < 0 {
                    return Err(io::Error::last_os_error());
                }
                if src != *fd {
                    if unsafe { libc::dup2(src, *fd) } < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if unsafe { libc::close(src) } < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
            }
            ChildOp::Dup2 { src, dst } => {
                if unsafe { libc::dup2(*src, *dst) } < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            ChildOp::Close { fd } => {
                if unsafe { libc::close(*fd) } < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
        }
    }
    Ok(())
}
