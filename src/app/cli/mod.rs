//! Command-line handling for the daemon

pub mod args;

pub use args::Args;

#[cfg(test)]
mod tests;
