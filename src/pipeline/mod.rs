//! Transaction pipeline: turns a due policy into signed, broadcast transactions.

pub mod cosign;
pub mod worker;

pub use cosign::{CosignAccepted, CosignClient, CosignOutcome, CosignService};
pub use worker::{PipelineSettings, WorkerService};
