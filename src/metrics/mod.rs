//! Per-minute aggregation of probe outcomes.

mod history;
mod window;

pub use history::*;
pub use window::*;
