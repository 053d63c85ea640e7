//! Statistics module
//!
//! Lock-free fleet-wide statistics tracking using atomic operations.

mod atomic;

pub use atomic::{FleetStats, FleetStatsSnapshot};
