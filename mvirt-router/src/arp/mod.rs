//! ARP handling: the fast-path ARP cache and on-demand address resolution.

pub mod cache;
pub mod pending;

pub use cache::{ArpCache, ArpEntry};
pub use pending::{ArpResolver, PENDING_CAPACITY, ReplyOutcome};
