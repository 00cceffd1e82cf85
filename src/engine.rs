//! Filter engine: administrative surface and propagation
//!
//! [`Redirfs`] owns the filter registry and the path tree. Attaching or
//! detaching a filter updates the chains of one path node, collapses the node
//! back into plain inheritance when its definitions became redundant, and
//! then walks the affected part of the host tree installing the merged
//! operation table every entry should now carry.
//!
//! All chain mutation, ancestor lookup and propagation for one call happens
//! under a single acquisition of the path-tree lock. Readers on the host side
//! never take that lock; they only see tables as the host swaps them.

use crate::chain::Chain;
use crate::error::{Error, Result};
use crate::filter::{FilterHandle, FilterInfo, FilterRegistry};
use crate::host::{normalize_path, DentryId, HostFs, WalkControl};
use crate::ops::{OpInfo, OpTable};
use crate::path::{PathFlags, PathNodeId, PathStatus, PathTree};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Target of an attach/detach request
#[derive(Debug, Clone)]
pub struct PathInfo {
    pub path: PathBuf,
    pub flags: PathFlags,
}

impl PathInfo {
    pub fn new(path: impl Into<PathBuf>, flags: PathFlags) -> Self {
        Self {
            path: path.into(),
            flags,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.flags.scope().is_empty() {
            return Err(Error::Invalid(
                "path flags need SINGLE and/or SUBTREE".to_string(),
            ));
        }
        let include = self.flags.contains(PathFlags::INCLUDE);
        let exclude = self.flags.contains(PathFlags::EXCLUDE);
        if include == exclude {
            return Err(Error::Invalid(
                "path flags need exactly one of INCLUDE or EXCLUDE".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Local,
    Subtree,
}

impl Scope {
    fn flag(self) -> PathFlags {
        match self {
            Scope::Local => PathFlags::SINGLE,
            Scope::Subtree => PathFlags::SUBTREE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Attach,
    Detach,
}

/// Derived table for a chain; `None` stands for the native operations
fn table_for(chain: &Chain) -> Result<Option<Arc<OpTable>>> {
    if chain.is_empty() {
        return Ok(None);
    }
    Ok(Some(Arc::new(chain.derive_ops()?)))
}

fn install<H: HostFs + ?Sized>(host: &H, dentry: DentryId, table: &Option<Arc<OpTable>>) -> Result<()> {
    match table {
        Some(table) => host.install_operations(dentry, table.clone()),
        None => host.restore_native_operations(dentry),
    }
}

/// Chain in effect on a normalized path: the node's own chain when it is
/// registered, else what its nearest live ancestor passes down
fn chain_at(tree: &PathTree, path: &Path) -> Result<Chain> {
    match tree.governing(path) {
        Some(id) if tree.get(id)?.path() == path => tree.local_chain(id),
        Some(id) => tree.subtree_chain(id),
        None => Ok(Chain::empty()),
    }
}

/// The filter engine
pub struct Redirfs<H: HostFs> {
    host: Arc<H>,
    registry: FilterRegistry,
    tree: Mutex<PathTree>,
}

impl<H: HostFs> Redirfs<H> {
    /// Engine with an empty registry and path tree over `host`
    pub fn init(host: Arc<H>) -> Self {
        info!("redirfs engine initialized");
        Self {
            host,
            registry: FilterRegistry::new(),
            tree: Mutex::new(PathTree::new()),
        }
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    /// Restore native operations everywhere a filter table was installed and
    /// drop every node and registry reference
    pub fn teardown(self) -> Result<()> {
        let mut tree = self.tree.lock();

        for id in tree.ids() {
            let node = tree.get(id)?;
            // Subtrees of nested nodes are covered by their top-most node.
            if node.parent().is_some() {
                continue;
            }
            self.host.walk(node.dentry(), &mut |dentry, _| {
                self.host.restore_native_operations(dentry)?;
                Ok(WalkControl::Continue)
            })?;
        }

        *tree = PathTree::new();
        drop(tree);

        let released = self.registry.drain();
        info!("redirfs engine torn down ({} filters released)", released.len());
        Ok(())
    }

    /// Register a filter under a unique priority
    pub fn register_filter(&self, info: FilterInfo) -> Result<FilterHandle> {
        self.registry.register(info)
    }

    /// Release the registry's reference; attached paths keep the filter alive
    pub fn unregister_filter(&self, filter: &FilterHandle) -> Result<()> {
        self.registry.unregister(filter)?;

        let attached = self.tree.lock().paths_with(filter);
        if !attached.is_empty() {
            warn!(
                "Filter {} unregistered while still attached to {:?}",
                filter.name(),
                attached
            );
        }
        Ok(())
    }

    /// Toggle whether a filter's callbacks run; installed tables stay as they are
    pub fn set_active(&self, filter: &FilterHandle, active: bool) -> Result<()> {
        if !self.registry.contains(filter) {
            return Err(Error::Invalid(format!(
                "filter {} is not registered",
                filter.name()
            )));
        }
        filter.set_active(active);
        info!("Filter {} active={}", filter.name(), active);
        Ok(())
    }

    /// Store a filter's callbacks and re-install every table that includes it
    pub fn set_operations(&self, filter: &FilterHandle, ops: &[OpInfo]) -> Result<()> {
        if !self.registry.contains(filter) {
            return Err(Error::Invalid(format!(
                "filter {} is not registered",
                filter.name()
            )));
        }
        filter.store_operations(ops);

        let mut tree = self.tree.lock();

        let subtree: Vec<PathNodeId> = tree
            .ids()
            .into_iter()
            .filter(|id| {
                tree.get(*id)
                    .map(|n| n.is_defining() && n.inchain().contains(filter))
                    .unwrap_or(false)
            })
            .collect();

        for id in tree.ids() {
            let node = tree.get(id)?;
            let covered = subtree.iter().any(|s| {
                *s != id
                    && tree
                        .get(*s)
                        .map(|other| node.path().starts_with(other.path()))
                        .unwrap_or(false)
            });
            let local = node.inchain_local().contains(filter);

            if covered {
                continue;
            }
            if subtree.contains(&id) {
                self.propagate(&tree, id)?;
            } else if local {
                self.install_node(&tree, id)?;
            }
        }

        debug!("Re-synchronized tables for filter {}", filter.name());
        Ok(())
    }

    /// Attach (`INCLUDE`) or detach (`EXCLUDE`) a filter at a path, for the
    /// path alone (`SINGLE`), for its subtree (`SUBTREE`) or both
    pub fn set_path(&self, filter: &FilterHandle, info: &PathInfo) -> Result<()> {
        info.validate()?;
        if !self.registry.contains(filter) {
            return Err(Error::Invalid(format!(
                "filter {} is not registered",
                filter.name()
            )));
        }

        let path = normalize_path(&info.path)?;
        let dentry = self.host.lookup(&path)?;
        let direction = if info.flags.contains(PathFlags::INCLUDE) {
            Direction::Attach
        } else {
            Direction::Detach
        };

        let mut tree = self.tree.lock();

        let result = (|| -> Result<()> {
            let id = match tree.find(&path) {
                Some(id) => id,
                None => tree.insert(path.clone(), dentry)?,
            };
            if info.flags.contains(PathFlags::SUBTREE) {
                self.update(&mut tree, id, filter, Scope::Subtree, direction)?;
            }
            if info.flags.contains(PathFlags::SINGLE) {
                self.update(&mut tree, id, filter, Scope::Local, direction)?;
            }
            Ok(())
        })();

        for removed in tree.flush_removals() {
            debug!("Path {:?} collapsed into its ancestor", removed);
        }

        if result.is_ok() {
            info!(
                "{} filter {} {} {:?}",
                match direction {
                    Direction::Attach => "Attached",
                    Direction::Detach => "Detached",
                },
                filter.name(),
                match direction {
                    Direction::Attach => "to",
                    Direction::Detach => "from",
                },
                path
            );
        }
        result
    }

    /// Change one scope of one node, collapse it if redundant, and push the
    /// result to the host
    fn update(
        &self,
        tree: &mut PathTree,
        id: PathNodeId,
        filter: &FilterHandle,
        scope: Scope,
        direction: Direction,
    ) -> Result<()> {
        let before = {
            let node = tree.get(id)?;
            (
                node.flags(),
                node.inchain().clone(),
                node.exchain().clone(),
                node.inchain_local().clone(),
                node.exchain_local().clone(),
            )
        };

        // Baseline the scope is compared against.
        let baseline = match scope {
            Scope::Subtree => tree.inherited_chain(id)?,
            Scope::Local => tree.subtree_chain(id)?,
        };

        self.edit_chains(tree, id, filter, scope, direction, &baseline)?;

        // A subtree change carries over to the node's own local definitions.
        if scope == Scope::Subtree && tree.get(id)?.flags().contains(PathFlags::SINGLE) {
            let subtree = tree.subtree_chain(id)?;
            self.edit_chains(tree, id, filter, Scope::Local, direction, &subtree)?;
        }

        self.collapse(tree, id)?;

        let node = tree.get(id)?;
        let subtree_changed = node.flags().contains(PathFlags::SUBTREE)
            != before.0.contains(PathFlags::SUBTREE)
            || *node.inchain() != before.1
            || *node.exchain() != before.2;
        let local_changed = node.flags().contains(PathFlags::SINGLE)
            != before.0.contains(PathFlags::SINGLE)
            || *node.inchain_local() != before.3
            || *node.exchain_local() != before.4;

        if subtree_changed {
            self.propagate(tree, id)
        } else if local_changed {
            self.install_node(tree, id)
        } else {
            Ok(())
        }
    }

    /// Add/remove `filter` in the inclusion and exclusion chains of `scope`
    fn edit_chains(
        &self,
        tree: &mut PathTree,
        id: PathNodeId,
        filter: &FilterHandle,
        scope: Scope,
        direction: Direction,
        baseline: &Chain,
    ) -> Result<()> {
        let node = tree.get_mut(id)?;
        let (inchain, exchain) = match scope {
            Scope::Subtree => (&mut node.inchain, &mut node.exchain),
            Scope::Local => (&mut node.inchain_local, &mut node.exchain_local),
        };

        match direction {
            Direction::Attach => {
                if !inchain.contains(filter) {
                    *inchain = inchain.add(filter)?;
                }
                if exchain.contains(filter) {
                    *exchain = exchain.remove(filter)?;
                }
            }
            Direction::Detach => {
                if inchain.contains(filter) {
                    *inchain = inchain.remove(filter)?;
                }
                // Still inherited: suppress it explicitly. Otherwise an old
                // exclusion has nothing left to suppress.
                let inherited = baseline.contains(filter);
                if inherited && !exchain.contains(filter) {
                    *exchain = exchain.add(filter)?;
                } else if !inherited && exchain.contains(filter) {
                    *exchain = exchain.remove(filter)?;
                }
            }
        }

        node.flags.insert(scope.flag());
        tree.update_removal(id)
    }

    /// Drop definitions that equal what the node would inherit anyway
    fn collapse(&self, tree: &mut PathTree, id: PathNodeId) -> Result<()> {
        if tree.get(id)?.flags().contains(PathFlags::SUBTREE) {
            let inherited = tree.inherited_chain(id)?;
            let own = tree.subtree_chain(id)?;
            if own == inherited {
                tree.get_mut(id)?.clear_subtree();
            }
        }

        if tree.get(id)?.flags().contains(PathFlags::SINGLE) {
            let subtree = tree.subtree_chain(id)?;
            let local = tree.local_chain(id)?;
            if local == subtree {
                tree.get_mut(id)?.clear_local();
            }
        }

        tree.update_removal(id)
    }

    /// Re-install the table of a node's own entry, leaving descendants alone
    fn install_node(&self, tree: &PathTree, id: PathNodeId) -> Result<()> {
        let subtree = tree.subtree_chain(id)?;
        let node = tree.get(id)?;
        let own = node.apply_local(&subtree)?;
        debug!("Installing {:?} on {:?}", own, node.path());
        install(self.host.as_ref(), node.dentry(), &table_for(&own)?)
    }

    /// Walk the host subtree under a node and give every entry the table of
    /// its governing node.
    ///
    /// Nested nodes keep their own chains but re-derive their tables from
    /// the new baseline; entries whose effective chain is empty get the
    /// native operations back.
    fn propagate(&self, tree: &PathTree, id: PathNodeId) -> Result<()> {
        let root = tree.get(id)?.dentry();
        let base = tree.inherited_chain(id)?;
        let base_table = table_for(&base)?;

        // (depth, chain, table) of the governing node at each open level
        let mut stack: Vec<(usize, Chain, Option<Arc<OpTable>>)> = Vec::new();
        let host = self.host.as_ref();

        host.walk(root, &mut |dentry, depth| {
            while stack.last().map_or(false, |(d, _, _)| *d >= depth) {
                stack.pop();
            }
            let (chain, table) = match stack.last() {
                Some((_, chain, table)) => (chain.clone(), table.clone()),
                None => (base.clone(), base_table.clone()),
            };

            let Some(nid) = tree.find_active_by_dentry(dentry) else {
                return install(host, dentry, &table).map(|_| WalkControl::Continue);
            };

            let node = tree.get(nid)?;
            let subtree = node.apply_subtree(&chain)?;
            let subtree_table = if subtree == chain {
                table
            } else {
                table_for(&subtree)?
            };

            let single = node.flags().contains(PathFlags::SINGLE);
            let own_table = if single {
                let local = node.apply_local(&subtree)?;
                if local == subtree {
                    subtree_table.clone()
                } else {
                    table_for(&local)?
                }
            } else {
                subtree_table.clone()
            };

            debug!("Propagating {:?} to {:?}", subtree, node.path());

            install(host, dentry, &own_table)?;
            stack.push((depth, subtree, subtree_table));
            Ok(WalkControl::Continue)
        })
    }

    /// Install the right table on an entry created after filters were set up
    pub fn revalidate(&self, path: &Path) -> Result<()> {
        let path = normalize_path(path)?;
        let dentry = self.host.lookup(&path)?;

        // Chain lookup and install under one tree lock, like a walk.
        let tree = self.tree.lock();
        let chain = chain_at(&tree, &path)?;
        debug!("Revalidating {:?} with {:?}", path, chain);
        install(self.host.as_ref(), dentry, &table_for(&chain)?)
    }

    /// Filters in effect on `path` itself, in call order
    pub fn effective_chain(&self, path: &Path) -> Result<Chain> {
        let path = normalize_path(path)?;
        let tree = self.tree.lock();
        chain_at(&tree, &path)
    }

    /// Filters `path` passes on to its descendants
    pub fn subtree_chain(&self, path: &Path) -> Result<Chain> {
        let path = normalize_path(path)?;
        let tree = self.tree.lock();
        match tree.governing(&path) {
            Some(id) => tree.subtree_chain(id),
            None => Ok(Chain::empty()),
        }
    }

    /// Whether `path` is a registration boundary
    pub fn is_registered_path(&self, path: &Path) -> bool {
        let Ok(path) = normalize_path(path) else {
            return false;
        };
        self.tree.lock().find(&path).is_some()
    }

    /// Flags of the node at `path`, if registered
    pub fn path_flags(&self, path: &Path) -> Option<PathFlags> {
        let path = normalize_path(path).ok()?;
        let tree = self.tree.lock();
        let id = tree.find(&path)?;
        tree.get(id).ok().map(|n| n.flags())
    }

    /// Snapshot of every registered path
    pub fn path_status(&self) -> Result<Vec<PathStatus>> {
        self.tree.lock().status()
    }
}
