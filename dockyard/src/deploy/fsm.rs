//! Finite state machine for the project lifecycle

use crate::errors::EngineError;
use crate::models::ProjectStatus;

/// Message recorded when a build was cut short by an engine restart
pub const INTERRUPTED_MESSAGE: &str = "interrupted by engine restart";

/// Something that happened to a project
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectEvent {
    /// A build was accepted
    BuildStarted,

    /// Fetch, install or build failed
    BuildFailed(String),

    /// Pipeline finished and the process (if any) survived its grace period
    Deployed,

    /// The unit could not be installed or started, or died right after start
    ServiceFailed(String),

    /// Service was started or restarted on request
    Started,

    /// Service was stopped on request
    Stopped,

    /// Rolled back to an earlier build and restarted
    RolledBack,

    /// The engine restarted while the build was in flight
    Interrupted,
}

/// Project lifecycle FSM
#[derive(Debug, Clone)]
pub struct ProjectFsm {
    state: ProjectStatus,
    error: Option<String>,
}

impl ProjectFsm {
    /// FSM for a project that was just created
    pub fn new() -> Self {
        Self {
            state: ProjectStatus::Pending,
            error: None,
        }
    }

    /// Resume from persisted status
    pub fn from_parts(state: ProjectStatus, error: Option<String>) -> Self {
        Self { state, error }
    }

    pub fn state(&self) -> ProjectStatus {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: ProjectEvent) -> Result<(), EngineError> {
        use ProjectStatus::*;

        let (new_state, error) = match (self.state, &event) {
            (Building, ProjectEvent::BuildStarted) => {
                return Err(EngineError::ValidationError(
                    "a build is already in progress".to_string(),
                ));
            }
            (_, ProjectEvent::BuildStarted) => (Building, None),

            (Building, ProjectEvent::BuildFailed(err)) => (Error, Some(err.clone())),
            (Building, ProjectEvent::Deployed) => (Running, None),
            (Building, ProjectEvent::Interrupted) => {
                (Error, Some(INTERRUPTED_MESSAGE.to_string()))
            }

            // Start, stop and rollback need a finished build and no build in flight.
            (Pending, ProjectEvent::Started | ProjectEvent::Stopped | ProjectEvent::RolledBack) => {
                return Err(EngineError::ValidationError(
                    "project has never been built".to_string(),
                ));
            }
            (Building, ProjectEvent::Started | ProjectEvent::Stopped | ProjectEvent::RolledBack) => {
                return Err(EngineError::ValidationError(
                    "project is building".to_string(),
                ));
            }
            (_, ProjectEvent::Started) => (Running, None),
            (_, ProjectEvent::Stopped) => (Stopped, None),
            (_, ProjectEvent::RolledBack) => (Running, None),

            (Pending, ProjectEvent::ServiceFailed(_)) => {
                return Err(EngineError::ValidationError(
                    "project has never been built".to_string(),
                ));
            }
            (_, ProjectEvent::ServiceFailed(err)) => (Error, Some(err.clone())),

            (state, event) => {
                return Err(EngineError::ValidationError(format!(
                    "Invalid transition: {:?} -> {:?}",
                    state, event
                )));
            }
        };

        self.state = new_state;
        self.error = error;
        Ok(())
    }
}

impl Default for ProjectFsm {
    fn default() -> Self {
        Self::new()
    }
}
