//! Project lifecycle FSM tests

use dockyard::deploy::fsm::{ProjectEvent, ProjectFsm, INTERRUPTED_MESSAGE};
use dockyard::errors::EngineError;
use dockyard::models::ProjectStatus;

#[test]
fn test_fsm_initial_state() {
    let fsm = ProjectFsm::new();
    assert_eq!(fsm.state(), ProjectStatus::Pending);
    assert!(fsm.error().is_none());
}

#[test]
fn test_fsm_build_success_flow() {
    let mut fsm = ProjectFsm::new();

    // Pending -> Building
    fsm.process(ProjectEvent::BuildStarted).unwrap();
    assert_eq!(fsm.state(), ProjectStatus::Building);

    // Building -> Running
    fsm.process(ProjectEvent::Deployed).unwrap();
    assert_eq!(fsm.state(), ProjectStatus::Running);
    assert!(fsm.error().is_none());
}

#[test]
fn test_fsm_build_failure_flow() {
    let mut fsm = ProjectFsm::new();

    fsm.process(ProjectEvent::BuildStarted).unwrap();
    fsm.process(ProjectEvent::BuildFailed("`npm ci` exited with status 1".to_string()))
        .unwrap();

    assert_eq!(fsm.state(), ProjectStatus::Error);
    assert_eq!(fsm.error(), Some("`npm ci` exited with status 1"));
}

#[test]
fn test_fsm_service_failure_after_build() {
    let mut fsm = ProjectFsm::new();

    fsm.process(ProjectEvent::BuildStarted).unwrap();
    fsm.process(ProjectEvent::ServiceFailed("process exited during start".to_string()))
        .unwrap();
    assert_eq!(fsm.state(), ProjectStatus::Error);

    // A failed project can still be started by hand
    fsm.process(ProjectEvent::Started).unwrap();
    assert_eq!(fsm.state(), ProjectStatus::Running);
    assert!(fsm.error().is_none());
}

#[test]
fn test_fsm_rejects_second_build() {
    let mut fsm = ProjectFsm::new();
    fsm.process(ProjectEvent::BuildStarted).unwrap();

    let result = fsm.process(ProjectEvent::BuildStarted);
    assert!(matches!(result, Err(EngineError::ValidationError(_))));
    assert_eq!(fsm.state(), ProjectStatus::Building);
}

#[test]
fn test_fsm_rejects_control_while_building() {
    for event in [
        ProjectEvent::Started,
        ProjectEvent::Stopped,
        ProjectEvent::RolledBack,
    ] {
        let mut fsm = ProjectFsm::from_parts(ProjectStatus::Building, None);
        assert!(fsm.process(event).is_err());
        assert_eq!(fsm.state(), ProjectStatus::Building);
    }
}

#[test]
fn test_fsm_rejects_control_before_first_build() {
    let mut fsm = ProjectFsm::new();
    assert!(fsm.process(ProjectEvent::Started).is_err());
    assert!(fsm.process(ProjectEvent::Stopped).is_err());
    assert!(fsm.process(ProjectEvent::RolledBack).is_err());
    assert!(fsm
        .process(ProjectEvent::ServiceFailed("boom".to_string()))
        .is_err());
    assert_eq!(fsm.state(), ProjectStatus::Pending);
}

#[test]
fn test_fsm_settled_events_need_a_build() {
    let mut fsm = ProjectFsm::from_parts(ProjectStatus::Running, None);
    assert!(fsm.process(ProjectEvent::Deployed).is_err());
    assert!(fsm
        .process(ProjectEvent::BuildFailed("late".to_string()))
        .is_err());
    assert!(fsm.process(ProjectEvent::Interrupted).is_err());
    assert_eq!(fsm.state(), ProjectStatus::Running);
}

#[test]
fn test_fsm_interrupted_build() {
    let mut fsm = ProjectFsm::from_parts(ProjectStatus::Building, None);
    fsm.process(ProjectEvent::Interrupted).unwrap();
    assert_eq!(fsm.state(), ProjectStatus::Error);
    assert_eq!(fsm.error(), Some(INTERRUPTED_MESSAGE));
}

#[test]
fn test_fsm_stop_start_rollback() {
    let mut fsm = ProjectFsm::from_parts(ProjectStatus::Running, None);

    fsm.process(ProjectEvent::Stopped).unwrap();
    assert_eq!(fsm.state(), ProjectStatus::Stopped);

    fsm.process(ProjectEvent::RolledBack).unwrap();
    assert_eq!(fsm.state(), ProjectStatus::Running);

    fsm.process(ProjectEvent::BuildStarted).unwrap();
    assert_eq!(fsm.state(), ProjectStatus::Building);
}
