//! redirfs - Filter chains over filesystem operation tables
//!
//! Independent filters register with a unique priority and attach to paths,
//! either for a single path or for a whole subtree. The engine keeps, for
//! every object of the host filesystem, the merged operation table of the
//! filters that apply to it, and swaps tables across subtrees as filters come
//! and go.

pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod host;
pub mod ops;
pub mod path;

pub use config::Config;
pub use engine::{PathInfo, Redirfs};
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::chain::Chain;
    pub use crate::engine::{PathInfo, Redirfs};
    pub use crate::error::{Error, Result};
    pub use crate::filter::{FilterHandle, FilterInfo};
    pub use crate::host::{HostFs, MemoryHost};
    pub use crate::ops::{OpArgs, OpContext, OpId, OpInfo, OpRetv};
    pub use crate::path::PathFlags;
}
