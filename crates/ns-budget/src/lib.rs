//! Budget inference and allocation: usage snapshots, weekly-budget
//! calibration, and the per-run allowance engine.

pub mod calibrator;
pub mod engine;
pub mod snapshots;

pub use calibrator::{Calibration, Calibrator, Confidence};
pub use engine::{Allowance, BudgetError, BudgetSource, Manager};
pub use snapshots::{start_of_week, Collector, UsageScraper};
