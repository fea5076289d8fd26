//! Test modules for the stream engine
//!
//! Suites are organized by component. Time-sensitive suites run on tokio's
//! paused clock so pauses, probes and idle thresholds are exact.

pub(super) mod support;

mod retry;
