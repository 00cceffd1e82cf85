//! Registration tree of filtered paths
//!
//! Every path that carries filter definitions of its own gets a [`PathNode`]
//! in an arena. Nodes point at their nearest registered ancestor by index, so
//! the tree mirrors only the registration boundaries of the directory
//! hierarchy, not every directory.
//!
//! A node keeps deltas against what it inherits:
//! - `inchain`/`exchain` apply to the node and its descendants (SUBTREE)
//! - `inchain_local`/`exchain_local` apply to the node alone (SINGLE)
//!
//! Nodes whose definitions become redundant are marked for removal and
//! dropped from the arena by [`PathTree::flush_removals`].

use crate::chain::Chain;
use crate::error::{Error, Result};
use crate::filter::FilterHandle;
use crate::host::DentryId;
use bitflags::bitflags;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

bitflags! {
    /// Scope and direction of a path definition
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PathFlags: u32 {
        /// Applies to the path only
        const SINGLE = 1;
        /// Applies to the path and everything below it
        const SUBTREE = 2;
        /// Attach the filter
        const INCLUDE = 4;
        /// Detach or suppress the filter
        const EXCLUDE = 8;
    }
}

impl PathFlags {
    /// Scope bits only
    pub fn scope(self) -> PathFlags {
        self & (PathFlags::SINGLE | PathFlags::SUBTREE)
    }
}

/// Arena index of a path node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathNodeId(usize);

/// One registration boundary
#[derive(Debug)]
pub struct PathNode {
    pub(crate) path: PathBuf,
    pub(crate) dentry: DentryId,
    pub(crate) parent: Option<PathNodeId>,
    pub(crate) flags: PathFlags,
    pub(crate) inchain: Chain,
    pub(crate) exchain: Chain,
    pub(crate) inchain_local: Chain,
    pub(crate) exchain_local: Chain,
    pub(crate) pending_removal: bool,
}

impl PathNode {
    fn new(path: PathBuf, dentry: DentryId, parent: Option<PathNodeId>) -> Self {
        Self {
            path,
            dentry,
            parent,
            flags: PathFlags::empty(),
            inchain: Chain::empty(),
            exchain: Chain::empty(),
            inchain_local: Chain::empty(),
            exchain_local: Chain::empty(),
            pending_removal: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dentry(&self) -> DentryId {
        self.dentry
    }

    pub fn parent(&self) -> Option<PathNodeId> {
        self.parent
    }

    pub fn flags(&self) -> PathFlags {
        self.flags
    }

    pub fn inchain(&self) -> &Chain {
        &self.inchain
    }

    pub fn exchain(&self) -> &Chain {
        &self.exchain
    }

    pub fn inchain_local(&self) -> &Chain {
        &self.inchain_local
    }

    pub fn exchain_local(&self) -> &Chain {
        &self.exchain_local
    }

    pub fn is_pending_removal(&self) -> bool {
        self.pending_removal
    }

    /// Defines a subtree baseline for its descendants
    pub(crate) fn is_defining(&self) -> bool {
        self.flags.contains(PathFlags::SUBTREE) && !self.pending_removal
    }

    /// Drop subtree definitions
    pub(crate) fn clear_subtree(&mut self) {
        self.inchain = Chain::empty();
        self.exchain = Chain::empty();
        self.flags.remove(PathFlags::SUBTREE);
    }

    /// Drop single-path definitions
    pub(crate) fn clear_local(&mut self) {
        self.inchain_local = Chain::empty();
        self.exchain_local = Chain::empty();
        self.flags.remove(PathFlags::SINGLE);
    }

    /// `inherited` minus exclusions plus inclusions, for the subtree scope
    pub(crate) fn apply_subtree(&self, inherited: &Chain) -> Result<Chain> {
        if !self.is_defining() {
            return Ok(inherited.clone());
        }
        inherited.difference(&self.exchain)?.union(&self.inchain)
    }

    /// Chain in effect on the node itself given its subtree chain
    pub(crate) fn apply_local(&self, subtree: &Chain) -> Result<Chain> {
        if !self.flags.contains(PathFlags::SINGLE) || self.pending_removal {
            return Ok(subtree.clone());
        }
        subtree
            .difference(&self.exchain_local)?
            .union(&self.inchain_local)
    }
}

/// Serializable view of a node
#[derive(Debug, Clone, Serialize)]
pub struct PathStatus {
    pub path: PathBuf,
    pub single: bool,
    pub subtree: bool,
    pub inchain: Vec<String>,
    pub exchain: Vec<String>,
    pub inchain_local: Vec<String>,
    pub exchain_local: Vec<String>,
    /// Filters in effect on the path itself, in call order
    pub effective: Vec<String>,
}

/// Arena of path nodes plus lookup indexes
#[derive(Debug, Default)]
pub struct PathTree {
    nodes: Vec<Option<PathNode>>,
    free: Vec<usize>,
    by_path: HashMap<PathBuf, PathNodeId>,
    by_dentry: HashMap<DentryId, PathNodeId>,
    /// Nodes to drop at the end of the current operation
    pending: Vec<PathNodeId>,
}

impl PathTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node at `id`; ids handed out by this tree stay valid until flushed
    pub fn get(&self, id: PathNodeId) -> Result<&PathNode> {
        self.nodes
            .get(id.0)
            .and_then(|n| n.as_ref())
            .ok_or_else(|| Error::NotFound(format!("path node {}", id.0)))
    }

    pub(crate) fn get_mut(&mut self, id: PathNodeId) -> Result<&mut PathNode> {
        self.nodes
            .get_mut(id.0)
            .and_then(|n| n.as_mut())
            .ok_or_else(|| Error::NotFound(format!("path node {}", id.0)))
    }

    pub fn find(&self, path: &Path) -> Option<PathNodeId> {
        self.by_path.get(path).copied()
    }

    /// Live (not pending) node decorating `dentry`
    pub fn find_active_by_dentry(&self, dentry: DentryId) -> Option<PathNodeId> {
        let id = self.by_dentry.get(&dentry).copied()?;
        match self.get(id) {
            Ok(node) if !node.pending_removal => Some(id),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    /// Ids of all nodes, ordered by path so parents come first
    pub fn ids(&self) -> Vec<PathNodeId> {
        let mut ids: Vec<(&PathBuf, PathNodeId)> =
            self.by_path.iter().map(|(p, id)| (p, *id)).collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Nearest registered strict ancestor of `path`
    fn nearest_ancestor(&self, path: &Path) -> Option<PathNodeId> {
        path.ancestors().skip(1).find_map(|p| self.find(p))
    }

    /// Nearest strict ancestor that is neither pending removal nor lacking
    /// SUBTREE; it supplies the baseline a node would inherit
    pub fn defining_ancestor(&self, id: PathNodeId) -> Result<Option<PathNodeId>> {
        let mut current = self.get(id)?.parent;
        while let Some(pid) = current {
            let node = self.get(pid)?;
            if node.is_defining() {
                return Ok(Some(pid));
            }
            current = node.parent;
        }
        Ok(None)
    }

    /// Register `path`, adopting existing nodes below it.
    ///
    /// A fresh node has no definitions, so it starts out marked for removal
    /// until a flag is set on it.
    pub fn insert(&mut self, path: PathBuf, dentry: DentryId) -> Result<PathNodeId> {
        if self.by_path.contains_key(&path) {
            return Err(Error::Invalid(format!("{:?} already registered", path)));
        }

        let parent = self.nearest_ancestor(&path);
        let node = PathNode::new(path.clone(), dentry, parent);

        let id = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                PathNodeId(slot)
            }
            None => {
                self.nodes.try_reserve(1)?;
                self.nodes.push(Some(node));
                PathNodeId(self.nodes.len() - 1)
            }
        };

        for slot in self.nodes.iter_mut().flatten() {
            if slot.parent == parent && slot.path != path && slot.path.starts_with(&path) {
                slot.parent = Some(id);
            }
        }

        self.by_path.insert(path, id);
        self.by_dentry.insert(dentry, id);
        self.update_removal(id)?;

        Ok(id)
    }

    /// Queue the node for removal when it no longer has any flag, unqueue it
    /// when it regained one
    pub(crate) fn update_removal(&mut self, id: PathNodeId) -> Result<()> {
        let node = self.get_mut(id)?;
        let remove = node.flags.scope().is_empty();

        if remove && !node.pending_removal {
            node.pending_removal = true;
            self.pending.push(id);
        } else if !remove && node.pending_removal {
            node.pending_removal = false;
            self.pending.retain(|p| *p != id);
        }

        Ok(())
    }

    /// Drop every node queued for removal, handing its children to its parent.
    /// Returns the removed paths.
    pub fn flush_removals(&mut self) -> Vec<PathBuf> {
        let mut removed = Vec::new();

        for id in std::mem::take(&mut self.pending) {
            let Some(node) = self.nodes.get_mut(id.0).and_then(|n| n.take()) else {
                continue;
            };

            for child in self.nodes.iter_mut().flatten() {
                if child.parent == Some(id) {
                    child.parent = node.parent;
                }
            }

            self.by_path.remove(&node.path);
            self.by_dentry.remove(&node.dentry);
            self.free.push(id.0);
            removed.push(node.path);
        }

        removed
    }

    /// Baseline inherited from the defining ancestor (empty at the top)
    pub fn inherited_chain(&self, id: PathNodeId) -> Result<Chain> {
        match self.defining_ancestor(id)? {
            Some(anc) => self.subtree_chain(anc),
            None => Ok(Chain::empty()),
        }
    }

    /// Chain the node passes on to its descendants
    pub fn subtree_chain(&self, id: PathNodeId) -> Result<Chain> {
        // Collect defining nodes from `id` upward, then fold from the top.
        let mut lineage = Vec::new();
        let mut current = Some(id);
        while let Some(nid) = current {
            let node = self.get(nid)?;
            if node.is_defining() {
                lineage.push(nid);
            }
            current = node.parent;
        }

        let mut chain = Chain::empty();
        for nid in lineage.into_iter().rev() {
            chain = self.get(nid)?.apply_subtree(&chain)?;
        }
        Ok(chain)
    }

    /// Chain in effect on the node itself
    pub fn local_chain(&self, id: PathNodeId) -> Result<Chain> {
        let subtree = self.subtree_chain(id)?;
        self.get(id)?.apply_local(&subtree)
    }

    /// Live node at `path`, or else the nearest live ancestor node
    pub fn governing(&self, path: &Path) -> Option<PathNodeId> {
        path.ancestors().find_map(|p| {
            let id = self.find(p)?;
            match self.get(id) {
                Ok(node) if !node.pending_removal => Some(id),
                _ => None,
            }
        })
    }

    /// Paths whose chains mention `filter` in either scope
    pub fn paths_with(&self, filter: &FilterHandle) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .nodes
            .iter()
            .flatten()
            .filter(|n| {
                n.inchain.contains(filter)
                    || n.exchain.contains(filter)
                    || n.inchain_local.contains(filter)
                    || n.exchain_local.contains(filter)
            })
            .map(|n| n.path.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Snapshot of every node, parents first
    pub fn status(&self) -> Result<Vec<PathStatus>> {
        let mut out = Vec::with_capacity(self.len());
        for id in self.ids() {
            let node = self.get(id)?;
            out.push(PathStatus {
                path: node.path.clone(),
                single: node.flags.contains(PathFlags::SINGLE),
                subtree: node.flags.contains(PathFlags::SUBTREE),
                inchain: node.inchain.names(),
                exchain: node.exchain.names(),
                inchain_local: node.inchain_local.names(),
                exchain_local: node.exchain_local.names(),
                effective: self.local_chain(id)?.names(),
            });
        }
        Ok(out)
    }
}
