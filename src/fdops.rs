//! Pure simulation of a child's descriptor table.
//!
//! The planner records what a child's fd table must look like after
//! setup; the spawn step replays the recorded operations between fork and
//! exec. Nothing in this module touches the OS, which is what makes the
//! planner's descriptor arithmetic testable without spawning anything.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::fd::RawFd;

use crate::error::{Error, Result};
use crate::ir::{STDERR, STDIN, STDOUT};

/// Where a child descriptor's bytes come from once setup has run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FdSource {
    /// A descriptor inherited from the parent (pipe end or stdio).
    Inherited(RawFd),
    /// A file the child opens itself before exec.
    File { path: CString, flags: libc::c_int },
}

/// One operation replayed in the child between fork and exec.
///
/// Restricted to async-signal-safe syscalls: open, dup2, close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildOp {
    Open {
        fd: RawFd,
        path: CString,
        flags: libc::c_int,
    },
    Dup2 {
        src: RawFd,
        dst: RawFd,
    },
    Close {
        fd: RawFd,
    },
}

/// Simulated child fd table.
///
/// Tracks the logical table (destination fd to source), the ordered op
/// list that produces it, and the descriptors that must survive exec at
/// their own numbers.
#[derive(Debug, Default)]
pub struct FdTable {
    table: BTreeMap<RawFd, FdSource>,
    ops: Vec<ChildOp>,
    pass: Vec<RawFd>,
}

impl FdTable {
    /// Table with stdin, stdout, and stderr inherited.
    pub fn with_stdio() -> Self {
        let mut table = FdTable::default();
        for fd in [STDIN, STDOUT, STDERR] {
            table.inherit(fd);
        }
        table
    }

    /// Register a parent-provided descriptor as open in the child at its
    /// own number, with no op emitted.
    pub fn inherit(&mut self, fd: RawFd) {
        self.table.insert(fd, FdSource::Inherited(fd));
    }

    /// Open `path` at `fd`.
    pub fn open(&mut self, fd: RawFd, path: CString, flags: libc::c_int) {
        self.ops.push(ChildOp::Open {
            fd,
            path: path.clone(),
            flags,
        });
        self.table.insert(fd, FdSource::File { path, flags });
    }

    /// Make `dst` an alias of whatever `src` *currently* names.
    ///
    /// This is why `2>&1 >file` mirrors the original stdout rather than
    /// the file: the alias binds the source at the moment of the op, not
    /// the fd number.
    pub fn dup2(&mut self, src: RawFd, dst: RawFd) -> Result<()> {
        let source = self
            .table
            .get(&src)
            .cloned()
            .ok_or(Error::BadRedirect { fd: src })?;
        self.ops.push(ChildOp::Dup2 { src, dst });
        self.table.insert(dst, source);
        Ok(())
    }

    /// dup2 then close the source; moves a pipe end onto its target.
    pub fn move_to(&mut self, src: RawFd, dst: RawFd) -> Result<()> {
        self.dup2(src, dst)?;
        self.close(src);
        Ok(())
    }

    /// Close `fd` in the child.
    pub fn close(&mut self, fd: RawFd) {
        self.ops.push(ChildOp::Close { fd });
        self.table.remove(&fd);
    }

    /// Mark `fd` as needing to survive exec at its own number
    /// (argument-position substitutions resolved to `/dev/fd/N`).
    pub fn pass_through(&mut self, fd: RawFd) {
        self.pass.push(fd);
    }

    /// Ordered operations for the spawn step.
    pub fn ops(&self) -> &[ChildOp] {
        &self.ops
    }

    /// Descriptors that must outlive exec at their own numbers.
    pub fn pass_fds(&self) -> &[RawFd] {
        &self.pass
    }

    /// What `fd` names after all ops, if anything.
    pub fn entry(&self, fd: RawFd) -> Option<&FdSource> {
        self.table.get(&fd)
    }

    /// Descriptors open in the child after all ops, ascending.
    pub fn open_fds(&self) -> Vec<RawFd> {
        self.table.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    #[test]
    fn empty_table() {
        let table = FdTable::default();
        assert!(table.ops().is_empty());
        assert!(table.open_fds().is_empty());
        assert!(table.pass_fds().is_empty());
    }

    #[test]
    fn stdio_table_starts_with_three_fds() {
        let table = FdTable::with_stdio();
        assert_eq!(table.open_fds(), vec![0, 1, 2]);
        assert!(table.ops().is_empty());
    }

    #[test]
    fn open_records_op_and_entry() {
        let mut table = FdTable::default();
        table.open(3, path("/tmp/f"), libc::O_RDONLY);
        assert_eq!(
            table.ops(),
            &[ChildOp::Open {
                fd: 3,
                path: path("/tmp/f"),
                flags: libc::O_RDONLY,
            }]
        );
        assert_eq!(
            table.entry(3),
            Some(&FdSource::File {
                path: path("/tmp/f"),
                flags: libc::O_RDONLY,
            })
        );
    }

    #[test]
    fn open_preserves_order() {
        let mut table = FdTable::default();
        table.open(3, path("a"), libc::O_RDONLY);
        table.open(4, path("b"), libc::O_RDONLY);
        let fds: Vec<RawFd> = table
            .ops()
            .iter()
            .map(|op| match op {
                ChildOp::Open { fd, .. } => *fd,
                _ => panic!("expected open"),
            })
            .collect();
        assert_eq!(fds, vec![3, 4]);
        assert_eq!(table.open_fds(), vec![3, 4]);
    }

    #[test]
    fn dup2_aliases_current_source() {
        let mut table = FdTable::with_stdio();
        table.dup2(1, 2).unwrap();
        assert_eq!(table.ops(), &[ChildOp::Dup2 { src: 1, dst: 2 }]);
        assert_eq!(table.entry(2), Some(&FdSource::Inherited(1)));
        // src stays open
        assert_eq!(table.entry(1), Some(&FdSource::Inherited(1)));
    }

    #[test]
    fn dup2_then_open_keeps_alias_on_original() {
        // 2>&1 >file: stderr mirrors the original stdout, stdout moves to
        // the file.
        let mut table = FdTable::with_stdio();
        table.dup2(1, 2).unwrap();
        table.open(1, path("/tmp/out"), libc::O_WRONLY);
        assert_eq!(table.entry(2), Some(&FdSource::Inherited(1)));
        assert_eq!(
            table.entry(1),
            Some(&FdSource::File {
                path: path("/tmp/out"),
                flags: libc::O_WRONLY,
            })
        );
    }

    #[test]
    fn open_then_dup2_aliases_the_file() {
        // >file 2>&1: both fds end on the file.
        let mut table = FdTable::with_stdio();
        table.open(1, path("/tmp/out"), libc::O_WRONLY);
        table.dup2(1, 2).unwrap();
        assert_eq!(table.entry(1), table.entry(2));
        assert!(matches!(table.entry(2), Some(FdSource::File { .. })));
    }

    #[test]
    fn dup2_rejects_closed_source() {
        let mut table = FdTable::with_stdio();
        let err = table.dup2(7, 0).unwrap_err();
        assert!(matches!(err, Error::BadRedirect { fd: 7 }));
    }

    #[test]
    fn move_to_renames_and_closes_source() {
        let mut table = FdTable::with_stdio();
        table.inherit(9);
        table.move_to(9, 0).unwrap();
        assert_eq!(
            table.ops(),
            &[ChildOp::Dup2 { src: 9, dst: 0 }, ChildOp::Close { fd: 9 }]
        );
        assert_eq!(table.entry(0), Some(&FdSource::Inherited(9)));
        assert_eq!(table.entry(9), None);
    }

    #[test]
    fn close_removes_entry() {
        let mut table = FdTable::with_stdio();
        table.close(0);
        assert_eq!(table.ops(), &[ChildOp::Close { fd: 0 }]);
        assert_eq!(table.open_fds(), vec![1, 2]);
    }

    #[test]
    fn later_op_overrides_earlier_target() {
        let mut table = FdTable::with_stdio();
        table.open(1, path("/tmp/a"), libc::O_WRONLY);
        table.open(1, path("/tmp/b"), libc::O_WRONLY);
        assert_eq!(table.ops().len(), 2);
        assert_eq!(
            table.entry(1),
            Some(&FdSource::File {
                path: path("/tmp/b"),
                flags: libc::O_WRONLY,
            })
        );
    }

    #[test]
    fn pass_through_is_tracked() {
        let mut table = FdTable::with_stdio();
        table.inherit(11);
        table.pass_through(11);
        assert_eq!(table.pass_fds(), &[11]);
        assert_eq!(table.entry(11), Some(&FdSource::Inherited(11)));
    }
}
