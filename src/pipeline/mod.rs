//! Export pipeline: host-side agent callbacks and downstream sinks

mod agent;
pub mod sink;

pub use agent::{ExportAgent, StreamSummary};
pub use sink::{read_export, DoneMarker, ExportLine, JsonlSink, MemorySink, RecordSink};
