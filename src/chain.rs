//! Immutable priority-ordered filter chains
//!
//! A chain never changes after construction: [`Chain::add`] and
//! [`Chain::remove`] build a new chain, so a path node can keep serving its
//! current chain while the next one is computed. Cloning a chain shares the
//! underlying storage; the last clone to drop releases the filter references.

use crate::error::{Error, Result};
use crate::filter::FilterHandle;
use crate::ops::OpTable;
use std::fmt;
use std::sync::Arc;

/// Ordered set of filters, ascending by priority
#[derive(Clone, Default)]
pub struct Chain {
    filters: Arc<Vec<FilterHandle>>,
}

impl Chain {
    /// The empty chain
    pub fn empty() -> Self {
        Self::default()
    }

    fn from_vec(filters: Vec<FilterHandle>) -> Self {
        Self {
            filters: Arc::new(filters),
        }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FilterHandle> {
        self.filters.iter()
    }

    /// Position of `filter` in the chain
    pub fn find(&self, filter: &FilterHandle) -> Option<usize> {
        self.filters.iter().position(|f| Arc::ptr_eq(f, filter))
    }

    pub fn contains(&self, filter: &FilterHandle) -> bool {
        self.find(filter).is_some()
    }

    /// New chain with `filter` inserted at its priority position.
    ///
    /// Adding a filter that is already present returns an equal chain.
    pub fn add(&self, filter: &FilterHandle) -> Result<Chain> {
        if self.contains(filter) {
            return Ok(self.clone());
        }

        let mut filters = Vec::new();
        filters.try_reserve_exact(self.filters.len() + 1)?;

        let at = self
            .filters
            .iter()
            .position(|f| f.priority() > filter.priority())
            .unwrap_or(self.filters.len());
        filters.extend_from_slice(&self.filters[..at]);
        filters.push(filter.clone());
        filters.extend_from_slice(&self.filters[at..]);

        Ok(Chain::from_vec(filters))
    }

    /// New chain without `filter`; `NotFound` if it is not a member
    pub fn remove(&self, filter: &FilterHandle) -> Result<Chain> {
        let at = self
            .find(filter)
            .ok_or_else(|| Error::NotFound(format!("filter {} not in chain", filter.name())))?;

        let mut filters = Vec::new();
        filters.try_reserve_exact(self.filters.len() - 1)?;
        filters.extend_from_slice(&self.filters[..at]);
        filters.extend_from_slice(&self.filters[at + 1..]);

        Ok(Chain::from_vec(filters))
    }

    /// Members of either chain
    pub fn union(&self, other: &Chain) -> Result<Chain> {
        if other.is_empty() {
            return Ok(self.clone());
        }
        let mut merged = self.clone();
        for filter in other.iter() {
            merged = merged.add(filter)?;
        }
        Ok(merged)
    }

    /// Members of `self` not in `other`
    pub fn difference(&self, other: &Chain) -> Result<Chain> {
        if other.is_empty() || self.is_empty() {
            return Ok(self.clone());
        }
        let mut filters = Vec::new();
        filters.try_reserve_exact(self.filters.len())?;
        filters.extend(self.filters.iter().filter(|f| !other.contains(f)).cloned());
        Ok(Chain::from_vec(filters))
    }

    /// Fold the chain into a merged operation table
    pub fn derive_ops(&self) -> Result<OpTable> {
        OpTable::from_filters(&self.filters)
    }

    pub fn names(&self) -> Vec<String> {
        self.filters.iter().map(|f| f.name().to_string()).collect()
    }

    /// Number of holders of this chain version
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.filters)
    }
}

impl PartialEq for Chain {
    fn eq(&self, other: &Self) -> bool {
        self.filters.len() == other.filters.len()
            && self
                .filters
                .iter()
                .zip(other.filters.iter())
                .all(|(a, b)| Arc::ptr_eq(a, b))
    }
}

impl Eq for Chain {}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.filters.iter().map(|flt| (flt.name(), flt.priority())))
            .finish()
    }
}
