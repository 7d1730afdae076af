//! Background sweepers for Postbox.
//!
//! # Overview
//!
//! ```text
//! OutboxSweeper (every interval)
//!     │
//!     ├─► outstanding entries older than min_age, up to batch_size
//!     ├─► same dispatch path as clear_outbox (breaker, retry, conditional mark)
//!     └─► optional purge of dispatched entries past their retention
//!
//! InboxExpirySweeper (every interval)
//!     └─► purge inbox entries whose time-to-live elapsed
//! ```
//!
//! Both run on a tokio task started with `start()` and stop through the
//! returned [`TaskHandle`](postbox_core::TaskHandle).

mod inbox_sweeper;
mod sweeper;

pub use inbox_sweeper::InboxExpirySweeper;
pub use sweeper::OutboxSweeper;

#[cfg(test)]
mod tests;
