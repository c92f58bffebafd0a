//! Distributed (XA) transaction support
//!
//! - [`Xid`] and the start/end flags identify branches and protocol calls
//! - [`TxContext`] is the per-branch state machine
//! - [`XaBackendSession`] keeps one backend session bound across branches
//! - [`XaRegistry`] validates protocol calls per target and drives the backend

mod context;
mod lifecycle;
mod registry;
mod xid;

pub use context::{TxContext, TxState};
pub use lifecycle::{XaBackendSession, XaLifecycleState};
pub use registry::XaRegistry;
pub use xid::{EndFlag, StartFlag, XaVote, Xid};
