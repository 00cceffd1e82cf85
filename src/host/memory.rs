//! In-memory host filesystem
//!
//! A dentry tree with per-entry operation tables. Tables live in a `DashMap`
//! so swapping one entry's table only locks that entry's shard, which is the
//! object-level locking the engine relies on.

use super::{normalize_path, DentryId, HostFs};
use crate::error::{Error, Result};
use crate::ops::{InstalledOps, OpArgs, OpContext, OpId, OpRetv, OpTable};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Dentry id of the root directory
pub const ROOT_DENTRY: DentryId = DentryId(1);

/// Kind of object behind a dentry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DentryKind {
    Directory,
    RegularFile,
}

#[derive(Debug, Clone)]
struct MemDentry {
    parent: Option<DentryId>,
    path: PathBuf,
    kind: DentryKind,
    children: Vec<DentryId>,
}

/// Host filesystem kept entirely in memory
pub struct MemoryHost {
    /// Next dentry number
    next_id: AtomicU64,
    /// Dentry id -> entry
    dentries: RwLock<HashMap<DentryId, MemDentry>>,
    /// Path -> dentry id
    path_to_dentry: RwLock<HashMap<PathBuf, DentryId>>,
    /// Installed filter tables; absent means native operations
    installed: DashMap<DentryId, Arc<OpTable>>,
}

impl MemoryHost {
    /// Empty filesystem holding only `/`
    pub fn new() -> Self {
        let host = Self {
            next_id: AtomicU64::new(ROOT_DENTRY.0 + 1),
            dentries: RwLock::new(HashMap::new()),
            path_to_dentry: RwLock::new(HashMap::new()),
            installed: DashMap::new(),
        };

        host.dentries.write().insert(
            ROOT_DENTRY,
            MemDentry {
                parent: None,
                path: PathBuf::from("/"),
                kind: DentryKind::Directory,
                children: Vec::new(),
            },
        );
        host.path_to_dentry
            .write()
            .insert(PathBuf::from("/"), ROOT_DENTRY);

        host
    }

    /// Mirror the directory tree under `root` (symlinks are not followed)
    pub fn scan(root: &Path) -> Result<Self> {
        let host = Self::new();
        host.scan_dir(root, Path::new("/"))?;
        debug!("Scanned {:?}: {} entries", root, host.len());
        Ok(host)
    }

    fn scan_dir(&self, real: &Path, virt: &Path) -> Result<()> {
        let mut entries = fs::read_dir(real)?.collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let file_type = entry.file_type()?;
            let child = virt.join(entry.file_name());
            if file_type.is_dir() {
                self.mkdir(&child)?;
                self.scan_dir(&entry.path(), &child)?;
            } else {
                self.create(&child)?;
            }
        }

        Ok(())
    }

    fn alloc_id(&self) -> DentryId {
        DentryId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn add(&self, path: &Path, kind: DentryKind) -> Result<DentryId> {
        let path = normalize_path(path)?;
        let parent_path = path
            .parent()
            .ok_or_else(|| Error::Invalid("cannot create the root".to_string()))?;
        let parent = self.lookup(parent_path)?;

        let mut dentries = self.dentries.write();
        let mut by_path = self.path_to_dentry.write();

        if by_path.contains_key(&path) {
            return Err(Error::Invalid(format!("{:?} already exists", path)));
        }
        match dentries.get(&parent) {
            Some(p) if p.kind == DentryKind::Directory => {}
            _ => {
                return Err(Error::Invalid(format!(
                    "{:?} is not a directory",
                    parent_path
                )))
            }
        }

        let id = self.alloc_id();
        dentries.insert(
            id,
            MemDentry {
                parent: Some(parent),
                path: path.clone(),
                kind,
                children: Vec::new(),
            },
        );
        if let Some(p) = dentries.get_mut(&parent) {
            p.children.push(id);
        }
        by_path.insert(path, id);

        Ok(id)
    }

    /// Create a directory; its parent must exist
    pub fn mkdir(&self, path: &Path) -> Result<DentryId> {
        self.add(path, DentryKind::Directory)
    }

    /// Create every missing directory along `path`
    pub fn mkdir_all(&self, path: &Path) -> Result<DentryId> {
        let path = normalize_path(path)?;
        let mut current = PathBuf::from("/");
        let mut id = ROOT_DENTRY;
        for component in path.components().skip(1) {
            current.push(component);
            id = match self.lookup(&current) {
                Ok(existing) => existing,
                Err(_) => self.mkdir(&current)?,
            };
        }
        Ok(id)
    }

    /// Create a regular file; its parent must exist
    pub fn create(&self, path: &Path) -> Result<DentryId> {
        self.add(path, DentryKind::RegularFile)
    }

    pub fn kind(&self, dentry: DentryId) -> Option<DentryKind> {
        self.dentries.read().get(&dentry).map(|d| d.kind)
    }

    pub fn parent(&self, dentry: DentryId) -> Option<DentryId> {
        self.dentries.read().get(&dentry).and_then(|d| d.parent)
    }

    /// Number of entries including the root
    pub fn len(&self) -> usize {
        self.dentries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Operation table installed on the entry at `path`
    pub fn installed(&self, path: &Path) -> Result<InstalledOps> {
        let dentry = self.lookup(&normalize_path(path)?)?;
        Ok(self.installed_on(dentry))
    }

    pub fn installed_on(&self, dentry: DentryId) -> InstalledOps {
        match self.installed.get(&dentry) {
            Some(table) => InstalledOps::Filtered(table.value().clone()),
            None => InstalledOps::Native,
        }
    }

    /// Number of entries currently carrying a filter table
    pub fn filtered_count(&self) -> usize {
        self.installed.len()
    }

    /// Dispatch `op` on `path` through whatever table is installed
    pub fn invoke<F>(&self, path: &Path, op: OpId, args: &mut OpArgs, native: F) -> Result<OpRetv>
    where
        F: FnOnce(&mut OpContext, &mut OpArgs),
    {
        let path = normalize_path(path)?;
        let installed = self.installed_on(self.lookup(&path)?);
        let mut ctx = OpContext::new(path, op);
        Ok(installed.invoke(&mut ctx, args, native))
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostFs for MemoryHost {
    fn lookup(&self, path: &Path) -> Result<DentryId> {
        self.path_to_dentry
            .read()
            .get(path)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("{:?}", path)))
    }

    fn path_of(&self, dentry: DentryId) -> Option<PathBuf> {
        self.dentries.read().get(&dentry).map(|d| d.path.clone())
    }

    fn children(&self, dentry: DentryId) -> Vec<DentryId> {
        self.dentries
            .read()
            .get(&dentry)
            .map(|d| d.children.clone())
            .unwrap_or_default()
    }

    fn install_operations(&self, dentry: DentryId, table: Arc<OpTable>) -> Result<()> {
        if !self.dentries.read().contains_key(&dentry) {
            return Err(Error::NotFound(format!("dentry {}", dentry.0)));
        }
        self.installed.insert(dentry, table);
        Ok(())
    }

    fn restore_native_operations(&self, dentry: DentryId) -> Result<()> {
        if !self.dentries.read().contains_key(&dentry) {
            return Err(Error::NotFound(format!("dentry {}", dentry.0)));
        }
        self.installed.remove(&dentry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::WalkControl;
    use tempfile::tempdir;

    #[test]
    fn test_mkdir_create_lookup() {
        let host = MemoryHost::new();
        let a = host.mkdir(Path::new("/a")).unwrap();
        let f = host.create(Path::new("/a/f")).unwrap();

        assert_eq!(host.lookup(Path::new("/a")).unwrap(), a);
        assert_eq!(host.lookup(Path::new("/a/f")).unwrap(), f);
        assert_eq!(host.kind(f), Some(DentryKind::RegularFile));
        assert_eq!(host.parent(f), Some(a));
        assert_eq!(host.children(a), vec![f]);
        assert!(matches!(
            host.lookup(Path::new("/missing")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_create_requires_directory_parent() {
        let host = MemoryHost::new();
        host.create(Path::new("/f")).unwrap();
        assert!(host.create(Path::new("/f/g")).is_err());
        assert!(host.create(Path::new("/f")).is_err());
        assert!(host.mkdir(Path::new("/x/y")).is_err());
    }

    #[test]
    fn test_mkdir_all() {
        let host = MemoryHost::new();
        let c = host.mkdir_all(Path::new("/a/b/c")).unwrap();
        assert_eq!(host.lookup(Path::new("/a/b/c")).unwrap(), c);
        assert_eq!(host.mkdir_all(Path::new("/a/b/c")).unwrap(), c);
        assert_eq!(host.len(), 4);
    }

    #[test]
    fn test_walk_is_preorder_with_depth() {
        let host = MemoryHost::new();
        host.mkdir_all(Path::new("/a/b")).unwrap();
        host.create(Path::new("/a/b/f")).unwrap();
        host.mkdir(Path::new("/c")).unwrap();

        let mut seen = Vec::new();
        host.walk(ROOT_DENTRY, &mut |dentry, depth| {
            seen.push((host.path_of(dentry).unwrap(), depth));
            Ok(WalkControl::Continue)
        })
        .unwrap();

        let expected: Vec<(PathBuf, usize)> = vec![
            ("/".into(), 0),
            ("/a".into(), 1),
            ("/a/b".into(), 2),
            ("/a/b/f".into(), 3),
            ("/c".into(), 1),
        ];
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_walk_skip_and_stop() {
        let host = MemoryHost::new();
        host.mkdir_all(Path::new("/a/b")).unwrap();
        host.mkdir(Path::new("/c")).unwrap();
        let a = host.lookup(Path::new("/a")).unwrap();

        let mut seen = Vec::new();
        host.walk(ROOT_DENTRY, &mut |dentry, _| {
            seen.push(dentry);
            Ok(if dentry == a {
                WalkControl::SkipChildren
            } else {
                WalkControl::Continue
            })
        })
        .unwrap();
        assert_eq!(seen.len(), 3);

        let mut count = 0;
        host.walk(ROOT_DENTRY, &mut |_, _| {
            count += 1;
            Ok(WalkControl::Stop)
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_install_and_restore() {
        let host = MemoryHost::new();
        let a = host.mkdir(Path::new("/a")).unwrap();
        let table = Arc::new(crate::chain::Chain::empty().derive_ops().unwrap());

        host.install_operations(a, table).unwrap();
        assert!(!host.installed(Path::new("/a")).unwrap().is_native());
        assert_eq!(host.filtered_count(), 1);

        host.restore_native_operations(a).unwrap();
        assert!(host.installed(Path::new("/a")).unwrap().is_native());
        assert!(host
            .install_operations(DentryId(999), Arc::new(crate::chain::Chain::empty().derive_ops().unwrap()))
            .is_err());
    }

    #[test]
    fn test_scan_mirrors_directory() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc/conf.d")).unwrap();
        fs::write(dir.path().join("etc/passwd"), b"root").unwrap();
        fs::write(dir.path().join("etc/conf.d/net"), b"").unwrap();

        let host = MemoryHost::scan(dir.path()).unwrap();
        assert_eq!(host.len(), 5);
        let conf = host.lookup(Path::new("/etc/conf.d")).unwrap();
        assert_eq!(host.kind(conf), Some(DentryKind::Directory));
        let passwd = host.lookup(Path::new("/etc/passwd")).unwrap();
        assert_eq!(host.kind(passwd), Some(DentryKind::RegularFile));
    }

    #[test]
    fn test_invoke_native_when_unfiltered() {
        let host = MemoryHost::new();
        host.create(Path::new("/f")).unwrap();
        let mut args = OpArgs::default();
        let retv = host
            .invoke(Path::new("/f"), OpId::RegFopOpen, &mut args, |_, args| args.retv = 3)
            .unwrap();
        assert_eq!(retv, OpRetv::Continue);
        assert_eq!(args.retv, 3);
    }
}
