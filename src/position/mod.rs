//! Open-position bookkeeping and exit management.

mod manager;

pub use manager::PositionManager;
