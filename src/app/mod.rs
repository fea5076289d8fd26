//! Daemon application: command line, taps, heartbeat and startup

pub mod cli;
pub mod heartbeat;
pub mod startup;
pub mod tap;
