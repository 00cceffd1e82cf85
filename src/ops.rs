//! Operation identifiers, filter callbacks and merged operation tables
//!
//! A filter hooks individual operations by supplying a pre and/or post
//! callback per [`OpId`]. A chain of filters folds into an [`OpTable`]:
//! per operation, the ordered list of filters that hook it. Pre-callbacks run
//! in ascending priority order and post-callbacks unwind in reverse.

use crate::error::Result;
use crate::filter::FilterHandle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Hookable filesystem operations
///
/// Dentry operations exist per object class (none/regular/directory), inode
/// and file operations per regular/directory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpId {
    NoneDopDRevalidate,
    NoneDopDHash,
    NoneDopDCompare,
    NoneDopDDelete,
    NoneDopDRelease,
    NoneDopDIput,

    RegDopDRevalidate,
    RegDopDHash,
    RegDopDCompare,
    RegDopDDelete,
    RegDopDRelease,
    RegDopDIput,

    DirDopDRevalidate,
    DirDopDHash,
    DirDopDCompare,
    DirDopDDelete,
    DirDopDRelease,
    DirDopDIput,

    RegIopCreate,
    RegIopLookup,
    RegIopMkdir,
    RegIopPermission,

    DirIopCreate,
    DirIopLookup,
    DirIopMkdir,
    DirIopPermission,

    RegFopOpen,
    RegFopRelease,

    DirFopOpen,
    DirFopRelease,

    /// Terminates an operation list
    End,
}

impl OpId {
    /// Number of hookable operations (excludes `End`)
    pub const COUNT: usize = OpId::End as usize;

    /// Every hookable operation, in table order
    pub const ALL: [OpId; OpId::COUNT] = [
        OpId::NoneDopDRevalidate,
        OpId::NoneDopDHash,
        OpId::NoneDopDCompare,
        OpId::NoneDopDDelete,
        OpId::NoneDopDRelease,
        OpId::NoneDopDIput,
        OpId::RegDopDRevalidate,
        OpId::RegDopDHash,
        OpId::RegDopDCompare,
        OpId::RegDopDDelete,
        OpId::RegDopDRelease,
        OpId::RegDopDIput,
        OpId::DirDopDRevalidate,
        OpId::DirDopDHash,
        OpId::DirDopDCompare,
        OpId::DirDopDDelete,
        OpId::DirDopDRelease,
        OpId::DirDopDIput,
        OpId::RegIopCreate,
        OpId::RegIopLookup,
        OpId::RegIopMkdir,
        OpId::RegIopPermission,
        OpId::DirIopCreate,
        OpId::DirIopLookup,
        OpId::DirIopMkdir,
        OpId::DirIopPermission,
        OpId::RegFopOpen,
        OpId::RegFopRelease,
        OpId::DirFopOpen,
        OpId::DirFopRelease,
    ];

    /// Slot of this operation in a callback table
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_end(self) -> bool {
        self == OpId::End
    }
}

/// Verdict of a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpRetv {
    /// Skip remaining pre-callbacks and the native operation
    Stop,
    /// Proceed with the next callback
    Continue,
}

/// Per-invocation context handed to callbacks
#[derive(Debug, Clone)]
pub struct OpContext {
    /// Path of the object the operation runs on
    pub path: PathBuf,
    /// Operation being performed
    pub op: OpId,
}

impl OpContext {
    pub fn new(path: impl Into<PathBuf>, op: OpId) -> Self {
        Self {
            path: path.into(),
            op,
        }
    }
}

/// Operation arguments shared by callbacks and the native operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpArgs {
    /// Open flags or permission mask, depending on the operation
    pub flags: i32,
    /// Result of the operation; a stopping filter sets it for the caller
    pub retv: i32,
}

/// Pre or post callback
pub type OpCallback = Arc<dyn Fn(&mut OpContext, &mut OpArgs) -> OpRetv + Send + Sync>;

/// One entry of a filter's operation list
#[derive(Clone)]
pub struct OpInfo {
    pub op_id: OpId,
    pub pre_cb: Option<OpCallback>,
    pub post_cb: Option<OpCallback>,
}

impl OpInfo {
    pub fn new(op_id: OpId) -> Self {
        Self {
            op_id,
            pre_cb: None,
            post_cb: None,
        }
    }

    /// Terminator entry, equivalent to the end of the slice
    pub fn end() -> Self {
        Self::new(OpId::End)
    }

    pub fn pre<F>(mut self, cb: F) -> Self
    where
        F: Fn(&mut OpContext, &mut OpArgs) -> OpRetv + Send + Sync + 'static,
    {
        self.pre_cb = Some(Arc::new(cb));
        self
    }

    pub fn post<F>(mut self, cb: F) -> Self
    where
        F: Fn(&mut OpContext, &mut OpArgs) -> OpRetv + Send + Sync + 'static,
    {
        self.post_cb = Some(Arc::new(cb));
        self
    }
}

impl fmt::Debug for OpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpInfo")
            .field("op_id", &self.op_id)
            .field("pre_cb", &self.pre_cb.is_some())
            .field("post_cb", &self.post_cb.is_some())
            .finish()
    }
}

/// A filter's callbacks for one operation, captured at derive time
#[derive(Clone)]
struct OpEntry {
    filter: FilterHandle,
    pre: Option<OpCallback>,
    post: Option<OpCallback>,
}

/// Merged operation table derived from a chain
pub struct OpTable {
    /// Filters the table was derived from, ascending priority
    members: Vec<FilterHandle>,
    /// Per operation, the hooking filters in chain order
    entries: Vec<Vec<OpEntry>>,
}

impl OpTable {
    /// Fold filters (already in priority order) into a merged table
    pub(crate) fn from_filters(filters: &[FilterHandle]) -> Result<Self> {
        let mut members = Vec::new();
        members.try_reserve_exact(filters.len())?;
        members.extend(filters.iter().cloned());

        let mut entries: Vec<Vec<OpEntry>> = Vec::new();
        entries.try_reserve_exact(OpId::COUNT)?;
        entries.resize_with(OpId::COUNT, Vec::new);

        for filter in filters {
            let callbacks = filter.callbacks();
            for op in OpId::ALL {
                let (pre, post) = callbacks.get(op);
                if pre.is_none() && post.is_none() {
                    continue;
                }
                let slot = &mut entries[op.index()];
                slot.try_reserve(1)?;
                slot.push(OpEntry {
                    filter: filter.clone(),
                    pre,
                    post,
                });
            }
        }

        Ok(Self { members, entries })
    }

    /// Names of the filters this table merges, in call order
    pub fn filter_names(&self) -> Vec<String> {
        self.members.iter().map(|f| f.name().to_string()).collect()
    }

    /// Priorities of the filters this table merges
    pub fn priorities(&self) -> Vec<i32> {
        self.members.iter().map(|f| f.priority()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether any filter hooks `op`
    pub fn hooks(&self, op: OpId) -> bool {
        !op.is_end() && !self.entries[op.index()].is_empty()
    }

    /// Number of pre-callbacks registered for `op`
    pub fn pre_count(&self, op: OpId) -> usize {
        if op.is_end() {
            return 0;
        }
        self.entries[op.index()]
            .iter()
            .filter(|e| e.pre.is_some())
            .count()
    }

    /// Number of post-callbacks registered for `op`
    pub fn post_count(&self, op: OpId) -> usize {
        if op.is_end() {
            return 0;
        }
        self.entries[op.index()]
            .iter()
            .filter(|e| e.post.is_some())
            .count()
    }

    /// Run `op` through the table.
    ///
    /// Pre-callbacks run in chain order until one returns [`OpRetv::Stop`],
    /// in which case the native operation is skipped. Post-callbacks then run
    /// in reverse order for every filter whose pre phase was reached.
    /// Inactive filters are passed over in both phases.
    pub fn invoke<F>(&self, ctx: &mut OpContext, args: &mut OpArgs, native: F) -> OpRetv
    where
        F: FnOnce(&mut OpContext, &mut OpArgs),
    {
        if ctx.op.is_end() {
            return OpRetv::Continue;
        }

        let entries = &self.entries[ctx.op.index()];
        let mut reached = 0;
        let mut retv = OpRetv::Continue;

        for entry in entries {
            reached += 1;
            if !entry.filter.is_active() {
                continue;
            }
            if let Some(pre) = &entry.pre {
                if pre(ctx, args) == OpRetv::Stop {
                    retv = OpRetv::Stop;
                    break;
                }
            }
        }

        if retv == OpRetv::Continue {
            native(ctx, args);
        }

        for entry in entries[..reached].iter().rev() {
            if !entry.filter.is_active() {
                continue;
            }
            if let Some(post) = &entry.post {
                post(ctx, args);
            }
        }

        retv
    }
}

impl fmt::Debug for OpTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpTable")
            .field("filters", &self.filter_names())
            .finish()
    }
}

/// Operation table currently installed on a host object
#[derive(Debug, Clone)]
pub enum InstalledOps {
    /// The filesystem's own, unfiltered operations
    Native,
    /// A merged filter table
    Filtered(Arc<OpTable>),
}

impl InstalledOps {
    pub fn is_native(&self) -> bool {
        matches!(self, InstalledOps::Native)
    }

    /// Filter names in call order; empty for native
    pub fn filter_names(&self) -> Vec<String> {
        match self {
            InstalledOps::Native => Vec::new(),
            InstalledOps::Filtered(table) => table.filter_names(),
        }
    }

    /// Dispatch an operation, falling straight through to `native` when unfiltered
    pub fn invoke<F>(&self, ctx: &mut OpContext, args: &mut OpArgs, native: F) -> OpRetv
    where
        F: FnOnce(&mut OpContext, &mut OpArgs),
    {
        match self {
            InstalledOps::Native => {
                native(ctx, args);
                OpRetv::Continue
            }
            InstalledOps::Filtered(table) => table.invoke(ctx, args, native),
        }
    }
}
