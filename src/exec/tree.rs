//! Runtime process tree built while spawning.
//!
//! Mirrors the IR shape: one node per command or pipeline. A command node
//! owns its child handle, the substitution helpers spawned on its behalf,
//! and the pipe ends the parent still holds for pending stdin feeds.
//! Every child is spawned with `kill_on_drop`, and every held descriptor
//! is an `OwnedFd`, so dropping a tree, half-built or abandoned, kills
//! all live children and closes all descriptors.

use std::os::fd::OwnedFd;

use tokio::process::Child;

/// A pending stdin feed: write `data` into `fd`, then close it.
#[derive(Debug)]
pub(crate) struct Feeder {
    pub fd: OwnedFd,
    pub data: Vec<u8>,
}

/// One spawned command plus everything spawned or held on its behalf.
#[derive(Debug)]
pub(crate) struct CmdNode {
    pub child: Child,
    pub held: Vec<Feeder>,
    pub subs: Vec<Node>,
}

/// Tree node for a spawned command or pipeline.
#[derive(Debug)]
pub(crate) enum Node {
    Cmd(Box<CmdNode>),
    Pipeline(Vec<Node>),
}

impl Node {
    /// Every child in the tree, paired with whether it is a root process.
    ///
    /// Substitution helpers are not roots; their exit codes stay out of
    /// the pipefail result. Order is left-to-right over pipeline stages,
    /// so "rightmost non-zero" is a scan keeping the last hit.
    pub fn procs(&mut self) -> Vec<(&mut Child, bool)> {
        let mut out = Vec::new();
        self.collect_procs(&mut out, true);
        out
    }

    fn collect_procs<'a>(&'a mut self, out: &mut Vec<(&'a mut Child, bool)>, root: bool) {
        match self {
            Node::Cmd(node) => {
                out.push((&mut node.child, root));
                for sub in &mut node.subs {
                    sub.collect_procs(out, false);
                }
            }
            Node::Pipeline(stages) => {
                for stage in stages {
                    stage.collect_procs(out, root);
                }
            }
        }
    }

    /// Detach every pending stdin feed from the tree.
    pub fn take_feeders(&mut self) -> Vec<Feeder> {
        let mut out = Vec::new();
        self.drain_feeders(&mut out);
        out
    }

    fn drain_feeders(&mut self, out: &mut Vec<Feeder>) {
        match self {
            Node::Cmd(node) => {
                out.append(&mut node.held);
                for sub in &mut node.subs {
                    sub.drain_feeders(out);
                }
            }
            Node::Pipeline(stages) => {
                for stage in stages {
                    stage.drain_feeders(out);
                }
            }
        }
    }
}
