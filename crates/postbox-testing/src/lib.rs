//! Test doubles for Postbox.
//!
//! - [`RecordingProducer`]: accepts and remembers every message
//! - [`FailingProducer`]: fails according to a script, for retry and breaker tests
//! - [`CountingHandler`]: a core handler with a shared invocation counter
//! - [`StepRecorder`]: records the order in which chain nodes ran
//!
//! Counters and recorders are owned by the test and shared through `Arc`s;
//! nothing here keeps global state, so tests can run in parallel.

mod handlers;
mod producers;

pub use handlers::{CountingHandler, RecordStep, StepRecorder, RECORD_STEP};
pub use producers::{FailingProducer, RecordingProducer};
