//! Data models

pub mod deployment;
pub mod project;

pub use deployment::{Deployment, DeploymentStatus};
pub use project::{EnvVar, NewProject, Project, ProjectStatus, ProjectUpdate};
