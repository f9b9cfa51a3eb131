//! Matrix expansion, job scheduling and the deploy gate for Trellis.

pub mod gate;
pub mod matrix;
pub mod scheduler;

pub use gate::{DeployGate, GateDecision};
pub use matrix::{JobSpecs, MatrixExpander, select_job};
pub use scheduler::{CancelHandle, Scheduler, SchedulerConfig};
