//! Built-in decorator nodes.
//!
//! | link type | node | models |
//! |---|---|---|
//! | `postbox.inbox` | [`UseInbox`] / [`UseInboxAsync`] | both |
//! | `postbox.logging` | [`RequestLogging`] | both |
//! | `postbox.policy` | [`UsePolicy`] | both |
//! | `postbox.timeout` | [`TimeoutLink`] | async |

mod inbox;
mod logging;
mod policy;
mod timeout;

pub use inbox::{InboxLinkConfig, UseInbox, UseInboxAsync};
pub use logging::RequestLogging;
pub use policy::UsePolicy;
pub use timeout::TimeoutLink;
