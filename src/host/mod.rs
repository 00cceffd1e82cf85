//! Host filesystem collaborator
//!
//! The engine never touches filesystem objects directly. It resolves paths,
//! enumerates children and swaps operation tables through [`HostFs`]; the
//! host is responsible for its own object-level locking when a table is
//! replaced.

mod memory;

pub use memory::{DentryKind, MemoryHost};

use crate::error::{Error, Result};
use crate::ops::OpTable;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Identifier of a host directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DentryId(pub u64);

/// Visitor verdict during a subtree walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    /// Descend into the entry's children
    Continue,
    /// Do not visit the entry's children
    SkipChildren,
    /// End the walk
    Stop,
}

/// Operations the engine needs from the underlying filesystem
pub trait HostFs: Send + Sync {
    /// Resolve an absolute, normalized path
    fn lookup(&self, path: &Path) -> Result<DentryId>;

    /// Path of a known entry
    fn path_of(&self, dentry: DentryId) -> Option<PathBuf>;

    /// Direct children of an entry, in a stable order
    fn children(&self, dentry: DentryId) -> Vec<DentryId>;

    /// Replace the operation table of an entry
    fn install_operations(&self, dentry: DentryId, table: Arc<OpTable>) -> Result<()>;

    /// Put the filesystem's own operations back on an entry
    fn restore_native_operations(&self, dentry: DentryId) -> Result<()>;

    /// Depth-first pre-order walk of the subtree at `root`.
    ///
    /// The visitor receives each entry with its depth below `root` (0 for
    /// `root` itself). Errors from the visitor end the walk and are returned.
    fn walk(
        &self,
        root: DentryId,
        visitor: &mut dyn FnMut(DentryId, usize) -> Result<WalkControl>,
    ) -> Result<()> {
        let mut stack = vec![(root, 0usize)];

        while let Some((dentry, depth)) = stack.pop() {
            match visitor(dentry, depth)? {
                WalkControl::Stop => break,
                WalkControl::SkipChildren => {}
                WalkControl::Continue => {
                    let children = self.children(dentry);
                    stack.extend(children.into_iter().rev().map(|c| (c, depth + 1)));
                }
            }
        }

        Ok(())
    }
}

/// Canonical form of an administrative path: absolute, no `.`/`..`, no
/// trailing separator
pub fn normalize_path(path: &Path) -> Result<PathBuf> {
    if !path.is_absolute() {
        return Err(Error::Invalid(format!("path {:?} is not absolute", path)));
    }

    let mut normalized = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(name) => normalized.push(name),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(Error::Invalid(format!(
                    "path {:?} contains an unsupported component",
                    path
                )));
            }
        }
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("/")).unwrap(), PathBuf::from("/"));
        assert_eq!(
            normalize_path(Path::new("/a//b/./c/")).unwrap(),
            PathBuf::from("/a/b/c")
        );
    }

    #[test]
    fn test_normalize_rejects_relative_and_parent() {
        assert!(matches!(
            normalize_path(Path::new("a/b")),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            normalize_path(Path::new("/a/../b")),
            Err(Error::Invalid(_))
        ));
    }
}
