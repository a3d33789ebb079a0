//! Inference engine supervision: context sizing, output fault detection,
//! the process supervisor and the metrics relay.

pub mod context;
pub mod faults;
pub mod metrics_relay;
pub mod supervisor;

pub use faults::{detect_fault, FaultAction, FaultCategory, FaultMatch, INFERENCE_FAULTS, SERVICE_FAULTS};
pub use supervisor::{StartRequest, StopOutcome, Supervisor, SupervisorError, SupervisorSettings};
