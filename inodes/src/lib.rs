//! In-memory inode tree for a source-control-aware virtual filesystem.
//!
//! A [mount::Mount] exposes the tree of a commit as a live, mutable
//! directory hierarchy. Directories are [tree::TreeInode]s, files are
//! [file::FileInode]s; both start out as lazy references into the backing
//! [store::ObjectStore] and are *materialized* into the durable overlay
//! (provided by `scmfs-overlay`) the moment they are modified.
//!
//! The interesting machinery lives in:
//!
//!  - [inode_map::InodeMap]: the registry guaranteeing at most one load per
//!    inode number, with waiter coalescing,
//!  - [file::FileInode]: the per-file three-state machine (not loading,
//!    loading, materialized),
//!  - [checkout::CheckoutContext] + [tree::TreeInode::checkout]: the
//!    two-tree reconciliation engine with conflict detection,
//!  - [diff::DiffContext] + [tree::TreeInode::diff]: the differential walk
//!    against one or more commits, with gitignore handling.

pub mod channel;
pub mod checkout;
pub mod coverage;
pub mod diff;
pub mod file;
pub mod fixtures;
pub mod gitignore;
pub mod inode_map;
pub mod journal;
pub mod mount;
pub mod store;
pub mod tree;

mod errors;
mod inode;

#[cfg(test)]
mod tests;

pub use errors::FsError;
pub use inode::{InodeHandle, InodeMetadata, SetAttr, Stat, VirtualInode};
pub use mount::{CaseSensitivity, Mount, MountConfig};
