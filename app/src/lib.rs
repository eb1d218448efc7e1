mod app;
mod metrics;
mod registry;

// for main.rs
pub use app::run;
