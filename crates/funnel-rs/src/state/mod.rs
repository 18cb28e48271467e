//! Run-scoped state: the artifact store and the sinks its snapshots go to.
//!
//! - [`store`]: [`StateStore`], a key/value map of artifacts owned by one
//!   run. Every mutation queues a full snapshot for persistence.
//! - [`sink`]: [`RecordSink`] destinations (JSONL files, memory) and the
//!   [`BackgroundWriter`] that feeds them without blocking the caller.

pub mod sink;
pub mod store;

pub use sink::{
    BackgroundWriter, JsonlSink, MemorySink, RecordSink, SinkDiagnostics, SinkFailureReport,
};
pub use store::{Artifact, StateRecord, StateStore};
