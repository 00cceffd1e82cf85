//! Filter registry
//!
//! Filters are shared through [`FilterHandle`] (`Arc<Filter>`): the registry
//! holds one reference and every chain containing the filter holds another.
//! The filter's storage goes away when the last of them is released.

use crate::error::{Error, Result};
use crate::ops::{OpCallback, OpId, OpInfo};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Longest accepted filter name
pub const MAX_FILTER_NAME: usize = 255;

/// Shared reference to a registered filter
pub type FilterHandle = Arc<Filter>;

/// Registration parameters
#[derive(Debug, Clone)]
pub struct FilterInfo {
    pub name: String,
    /// Unique across the registry; lower runs first
    pub priority: i32,
    pub active: bool,
}

impl FilterInfo {
    /// Active filter with the given name and priority
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            active: true,
        }
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Invalid("filter name is empty".to_string()));
        }
        if self.name.len() > MAX_FILTER_NAME {
            return Err(Error::Invalid(format!(
                "filter name longer than {} bytes",
                MAX_FILTER_NAME
            )));
        }
        Ok(())
    }
}

/// Pre/post callbacks indexed by operation
pub struct Callbacks {
    pre: Vec<Option<OpCallback>>,
    post: Vec<Option<OpCallback>>,
}

impl Callbacks {
    fn new() -> Self {
        Self {
            pre: vec![None; OpId::COUNT],
            post: vec![None; OpId::COUNT],
        }
    }

    /// Callbacks registered for `op`
    pub fn get(&self, op: OpId) -> (Option<OpCallback>, Option<OpCallback>) {
        if op.is_end() {
            return (None, None);
        }
        (self.pre[op.index()].clone(), self.post[op.index()].clone())
    }

    /// Operations with at least one callback
    pub fn hooked(&self) -> Vec<OpId> {
        OpId::ALL
            .into_iter()
            .filter(|op| self.pre[op.index()].is_some() || self.post[op.index()].is_some())
            .collect()
    }
}

/// A registered filter
pub struct Filter {
    name: String,
    priority: i32,
    active: AtomicBool,
    callbacks: RwLock<Callbacks>,
}

impl Filter {
    fn new(info: &FilterInfo) -> Self {
        Filter {
            name: info.name.clone(),
            priority: info.priority,
            active: AtomicBool::new(info.active),
            callbacks: RwLock::new(Callbacks::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Current callback table
    pub fn callbacks(&self) -> RwLockReadGuard<'_, Callbacks> {
        self.callbacks.read()
    }

    /// Store callbacks entry by entry until the list ends or an `End` entry
    pub(crate) fn store_operations(&self, ops: &[OpInfo]) {
        let mut callbacks = self.callbacks.write();
        for op in ops.iter().take_while(|op| !op.op_id.is_end()) {
            callbacks.pre[op.op_id.index()] = op.pre_cb.clone();
            callbacks.post[op.op_id.index()] = op.post_cb.clone();
        }
    }

    /// Number of live references (registry plus chains plus callers)
    pub fn ref_count(this: &FilterHandle) -> usize {
        Arc::strong_count(this)
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Set of registered filters keyed by priority
pub struct FilterRegistry {
    filters: Mutex<Vec<FilterHandle>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self {
            filters: Mutex::new(Vec::new()),
        }
    }

    /// Register a filter; fails if its priority is taken
    pub fn register(&self, info: FilterInfo) -> Result<FilterHandle> {
        info.validate()?;

        // Allocate outside the lock, the scan below only compares priorities.
        let filter = Arc::new(Filter::new(&info));

        let mut filters = self.filters.lock();
        if filters.iter().any(|f| f.priority == filter.priority) {
            return Err(Error::AlreadyExists {
                priority: filter.priority,
            });
        }
        filters.try_reserve(1)?;
        filters.push(filter.clone());
        drop(filters);

        info!("Registered filter {} (priority {})", filter.name, filter.priority);
        Ok(filter)
    }

    /// Release the registry's reference.
    ///
    /// Paths the filter is still attached to keep it alive through their
    /// chains; detaching them is up to the caller.
    pub fn unregister(&self, filter: &FilterHandle) -> Result<()> {
        let mut filters = self.filters.lock();
        let pos = filters
            .iter()
            .position(|f| Arc::ptr_eq(f, filter))
            .ok_or_else(|| Error::NotFound(format!("filter {}", filter.name)))?;
        filters.remove(pos);
        drop(filters);

        info!(
            "Unregistered filter {} ({} references remain)",
            filter.name,
            Filter::ref_count(filter)
        );
        Ok(())
    }

    pub fn contains(&self, filter: &FilterHandle) -> bool {
        self.filters.lock().iter().any(|f| Arc::ptr_eq(f, filter))
    }

    pub fn find_by_priority(&self, priority: i32) -> Option<FilterHandle> {
        self.filters
            .lock()
            .iter()
            .find(|f| f.priority == priority)
            .cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<FilterHandle> {
        self.filters.lock().iter().find(|f| f.name == name).cloned()
    }

    /// Snapshot of registered filters in registration order
    pub fn filters(&self) -> Vec<FilterHandle> {
        self.filters.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.filters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.lock().is_empty()
    }

    /// Drop every registry reference, returning them to the caller
    pub(crate) fn drain(&self) -> Vec<FilterHandle> {
        std::mem::take(&mut *self.filters.lock())
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OpRetv;

    #[test]
    fn test_register_and_lookup() {
        let registry = FilterRegistry::new();
        let av = registry.register(FilterInfo::new("avflt", 10)).unwrap();

        assert_eq!(av.name(), "avflt");
        assert_eq!(av.priority(), 10);
        assert!(av.is_active());
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&av));
        assert!(Arc::ptr_eq(&registry.find_by_priority(10).unwrap(), &av));
        assert!(Arc::ptr_eq(&registry.find_by_name("avflt").unwrap(), &av));
    }

    #[test]
    fn test_duplicate_priority_rejected() {
        let registry = FilterRegistry::new();
        let first = registry.register(FilterInfo::new("first", 7)).unwrap();

        let err = registry.register(FilterInfo::new("second", 7)).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { priority: 7 }));

        let filters = registry.filters();
        assert_eq!(filters.len(), 1);
        assert!(Arc::ptr_eq(&filters[0], &first));
    }

    #[test]
    fn test_same_name_different_priority_allowed() {
        let registry = FilterRegistry::new();
        registry.register(FilterInfo::new("dup", 1)).unwrap();
        registry.register(FilterInfo::new("dup", 2)).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_empty_name_invalid() {
        let registry = FilterRegistry::new();
        let err = registry.register(FilterInfo::new("", 1)).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_inactive_registration() {
        let registry = FilterRegistry::new();
        let f = registry
            .register(FilterInfo::new("quiet", 3).with_active(false))
            .unwrap();
        assert!(!f.is_active());
        f.set_active(true);
        assert!(f.is_active());
    }

    #[test]
    fn test_ref_counting_and_unregister() {
        let registry = FilterRegistry::new();
        let f = registry.register(FilterInfo::new("f", 1)).unwrap();
        assert_eq!(Filter::ref_count(&f), 2);

        let weak = Arc::downgrade(&f);
        registry.unregister(&f).unwrap();
        assert_eq!(Filter::ref_count(&f), 1);
        assert!(registry.find_by_priority(1).is_none());

        // Priority is free again
        registry.register(FilterInfo::new("g", 1)).unwrap();

        drop(f);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_unregister_unknown() {
        let registry = FilterRegistry::new();
        let other = FilterRegistry::new();
        let f = other.register(FilterInfo::new("f", 1)).unwrap();
        assert!(matches!(registry.unregister(&f), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_store_operations_stops_at_end() {
        let registry = FilterRegistry::new();
        let f = registry.register(FilterInfo::new("f", 1)).unwrap();

        f.store_operations(&[
            OpInfo::new(OpId::RegFopOpen).pre(|_, _| OpRetv::Continue),
            OpInfo::end(),
            OpInfo::new(OpId::DirIopLookup).pre(|_, _| OpRetv::Continue),
        ]);

        assert_eq!(f.callbacks().hooked(), vec![OpId::RegFopOpen]);
    }
}
