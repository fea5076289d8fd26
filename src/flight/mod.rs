//! Single-flight coordination
//!
//! Keeps at most one background task per key in flight. Used for periodic
//! work that must not pile up when a run overlaps the next trigger.

pub mod coordinator;
pub mod keyed;

pub use coordinator::SingleFlight;
pub use keyed::{KeyedGuard, KeyedMutex};

#[cfg(test)]
mod tests;
