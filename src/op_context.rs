//! Explicit per-operation context.
//!
//! Every cache operation receives an [`OpContext`] naming the export the
//! request arrived through and the caller's credentials. Passing it
//! explicitly keeps reentrancy local; there is no thread-local current
//! operation.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::export::Export;

/// Caller identity for access checks and sub-FSAL delegation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Creds {
    /// Effective user id.
    pub uid: u32,
    /// Effective primary group id.
    pub gid: u32,
    /// Supplementary group ids.
    pub groups: SmallVec<[u32; 8]>,
}

impl Creds {
    /// Credentials with no supplementary groups.
    pub fn new(uid: u32, gid: u32) -> Self {
        Creds {
            uid,
            gid,
            groups: SmallVec::new(),
        }
    }

    /// True when `gid` matches the primary or any supplementary group.
    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

/// Context threaded through every cache operation.
#[derive(Debug, Clone)]
pub struct OpContext {
    /// The export the current request arrived through.
    pub export: Arc<Export>,
    /// The caller's credentials.
    pub creds: Creds,
}

impl OpContext {
    /// Build a context for one request.
    pub fn new(export: Arc<Export>, creds: Creds) -> Self {
        OpContext { export, creds }
    }
}
