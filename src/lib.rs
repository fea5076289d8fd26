pub mod app;
pub mod core;
pub mod flight;
pub mod streams;
