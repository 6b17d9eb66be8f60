//! Deployment module

pub mod agent;
pub mod artifact;
pub mod backup;
pub mod docker;
pub mod fsm;
pub mod model;
pub mod orchestrator;
pub mod plan;

pub use model::{DeploymentResponse, DeploymentResult, DeploymentStep, StepStatus};
pub use orchestrator::{Orchestrator, OrchestratorOptions};
