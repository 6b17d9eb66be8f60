//! Per-target step state machine and recorder

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::deploy::model::{DeploymentResult, DeploymentStep, StepStatus};

/// Target progression state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    /// No step started yet
    Pending,

    /// A step is executing remotely
    StepRunning,

    /// The last step succeeded; the next may start
    StepDone,

    /// Every step succeeded
    Succeeded,

    /// A step failed; terminal
    Failed,
}

/// Step event
#[derive(Debug, Clone)]
pub enum StepEvent {
    /// Start the named step
    Begin(String),

    /// Current step succeeded
    Succeed,

    /// Current step failed
    Fail(String),

    /// No more steps
    Finish,
}

/// Step FSM
#[derive(Debug, Clone)]
pub struct StepFsm {
    state: TargetState,
    current: Option<String>,
    completed: usize,
    error: Option<String>,
}

impl StepFsm {
    pub fn new() -> Self {
        Self {
            state: TargetState::Pending,
            current: None,
            completed: 0,
            error: None,
        }
    }

    pub fn state(&self) -> &TargetState {
        &self.state
    }

    pub fn current_step(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn completed_steps(&self) -> usize {
        self.completed
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: StepEvent) -> Result<(), String> {
        let new_state = match (&self.state, &event) {
            (TargetState::Pending, StepEvent::Begin(name))
            | (TargetState::StepDone, StepEvent::Begin(name)) => {
                self.current = Some(name.clone());
                TargetState::StepRunning
            }

            (TargetState::StepRunning, StepEvent::Succeed) => {
                self.completed += 1;
                TargetState::StepDone
            }
            (TargetState::StepRunning, StepEvent::Fail(err)) => {
                self.error = Some(err.clone());
                TargetState::Failed
            }

            (TargetState::StepDone, StepEvent::Finish) => {
                self.current = None;
                TargetState::Succeeded
            }

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for StepFsm {
    fn default() -> Self {
        Self::new()
    }
}

/// Records steps for one target in strict order
#[derive(Debug)]
pub struct StepRecorder {
    resource_id: String,
    target_label: String,
    fsm: StepFsm,
    steps: Vec<DeploymentStep>,
}

impl StepRecorder {
    pub fn new(resource_id: impl Into<String>, target_label: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            target_label: target_label.into(),
            fsm: StepFsm::new(),
            steps: Vec::new(),
        }
    }

    pub fn state(&self) -> &TargetState {
        self.fsm.state()
    }

    pub fn is_failed(&self) -> bool {
        self.fsm.state() == &TargetState::Failed
    }

    pub fn begin(&mut self, step_name: &str) -> Result<(), String> {
        self.fsm.process(StepEvent::Begin(step_name.to_string()))?;
        self.steps.push(DeploymentStep {
            target_label: self.target_label.clone(),
            step_name: step_name.to_string(),
            status: StepStatus::Running,
            message: String::new(),
        });
        Ok(())
    }

    pub fn succeed(&mut self, message: impl Into<String>) -> Result<(), String> {
        self.fsm.process(StepEvent::Succeed)?;
        let message = message.into();
        if let Some(step) = self.steps.last_mut() {
            info!(target = %self.target_label, step = %step.step_name, "{}", message);
            step.status = StepStatus::Success;
            step.message = message;
        }
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), String> {
        let message = message.into();
        self.fsm.process(StepEvent::Fail(message.clone()))?;
        if let Some(step) = self.steps.last_mut() {
            error!(target = %self.target_label, step = %step.step_name, "{}", message);
            step.status = StepStatus::Failed;
            step.message = message;
        }
        Ok(())
    }

    /// Close out the target. A target left mid-step is reported failed.
    pub fn finish(mut self) -> DeploymentResult {
        if self.fsm.state() == &TargetState::StepDone {
            let _ = self.fsm.process(StepEvent::Finish);
        }
        let success = self.fsm.state() == &TargetState::Succeeded;
        let error = match self.fsm.state() {
            TargetState::Succeeded => None,
            TargetState::Failed => self.fsm.error().map(|e| {
                let step = self.fsm.current_step().unwrap_or("unknown");
                format!("step '{}' failed: {}", step, e)
            }),
            other => Some(format!("deployment ended in state {:?}", other)),
        };
        DeploymentResult {
            target_label: self.target_label,
            resource_id: self.resource_id,
            success,
            steps: self.steps,
            error,
        }
    }
}
