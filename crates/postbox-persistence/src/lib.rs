//! In-memory stores for Postbox.
//!
//! [`InMemoryOutbox`] and [`InMemoryInbox`] implement both the blocking and
//! the async store traits over a [`dashmap::DashMap`], so one instance can
//! back both execution models of a processor.
//!
//! They are meant for tests, demos and single-process deployments that can
//! afford to lose the outbox on restart. Both stores bound their size:
//!
//! - **Expiry**: a write scans for expired entries at most once per
//!   `expiration_scan_interval`
//! - **Compaction**: a write that finds `entry_limit` entries removes the
//!   oldest evictable ones, keeping about `compaction_percentage` of the box
//!
//! The outbox only ever evicts dispatched entries.
//!
//! # Example
//!
//! ```ignore
//! use postbox_persistence::{InMemoryBoxConfig, InMemoryInbox, InMemoryOutbox};
//!
//! let config = InMemoryBoxConfig::default().with_entry_limit(10_000);
//! let outbox = Arc::new(InMemoryOutbox::new(config.clone()));
//! let inbox = Arc::new(InMemoryInbox::new(config));
//! ```

mod housekeeping;
mod inbox;
mod outbox;

pub use housekeeping::InMemoryBoxConfig;
pub use inbox::InMemoryInbox;
pub use outbox::{InMemoryOutbox, InMemoryOutboxTransaction};
