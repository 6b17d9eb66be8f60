//! FSM unit tests

use tokio_test::{assert_err, assert_ok};

use opspro_engine::deploy::fsm::{StepEvent, StepFsm, StepRecorder, TargetState};
use opspro_engine::deploy::StepStatus;

#[test]
fn test_fsm_initial_state() {
    let fsm = StepFsm::new();
    assert_eq!(fsm.state(), &TargetState::Pending);
    assert!(fsm.error().is_none());
    assert!(fsm.current_step().is_none());
    assert_eq!(fsm.completed_steps(), 0);
}

#[test]
fn test_fsm_success_flow() {
    let mut fsm = StepFsm::new();

    // Pending -> StepRunning
    fsm.process(StepEvent::Begin("connect".to_string())).unwrap();
    assert_eq!(fsm.state(), &TargetState::StepRunning);

    // StepRunning -> StepDone
    fsm.process(StepEvent::Succeed).unwrap();
    assert_eq!(fsm.state(), &TargetState::StepDone);

    fsm.process(StepEvent::Begin("health-check".to_string())).unwrap();
    assert_eq!(fsm.current_step(), Some("health-check"));
    fsm.process(StepEvent::Succeed).unwrap();

    // StepDone -> Succeeded
    fsm.process(StepEvent::Finish).unwrap();
    assert_eq!(fsm.state(), &TargetState::Succeeded);
    assert_eq!(fsm.completed_steps(), 2);
    assert!(fsm.current_step().is_none());
}

#[test]
fn test_fsm_failure_flow() {
    let mut fsm = StepFsm::new();

    fsm.process(StepEvent::Begin("connect".to_string())).unwrap();
    fsm.process(StepEvent::Fail("test error".to_string())).unwrap();

    assert_eq!(fsm.state(), &TargetState::Failed);
    assert_eq!(fsm.error(), Some("test error"));
    assert_eq!(fsm.current_step(), Some("connect"));
    assert_eq!(fsm.completed_steps(), 0);
}

#[test]
fn test_fsm_no_step_after_failure() {
    let mut fsm = StepFsm::new();

    assert_ok!(fsm.process(StepEvent::Begin("upload-artifact".to_string())));
    assert_ok!(fsm.process(StepEvent::Fail("disk full".to_string())));

    assert_err!(fsm.process(StepEvent::Begin("extract-install".to_string())));
    assert_err!(fsm.process(StepEvent::Succeed));
    assert_err!(fsm.process(StepEvent::Finish));
    assert_eq!(fsm.state(), &TargetState::Failed);
}

#[test]
fn test_fsm_invalid_transitions() {
    let mut fsm = StepFsm::new();

    // Cannot finish before any step ran
    assert_err!(fsm.process(StepEvent::Finish));

    // Cannot succeed a step that never started
    assert_err!(fsm.process(StepEvent::Succeed));

    // Cannot overlap steps
    assert_ok!(fsm.process(StepEvent::Begin("connect".to_string())));
    assert_err!(fsm.process(StepEvent::Begin("backup-current".to_string())));
}

#[test]
fn test_recorder_keeps_step_order() {
    let mut recorder = StepRecorder::new("3", "db-1");
    for name in ["connect", "backup-current", "prune-backups"] {
        recorder.begin(name).unwrap();
        recorder.succeed("ok").unwrap();
    }
    recorder.begin("upload-artifact").unwrap();
    recorder.fail("connection reset").unwrap();
    assert!(recorder.is_failed());

    let result = recorder.finish();
    assert_eq!(
        result.step_names(),
        vec!["connect", "backup-current", "prune-backups", "upload-artifact"]
    );
    assert!(result.steps[..3].iter().all(|s| s.status == StepStatus::Success));
    assert_eq!(result.steps[3].status, StepStatus::Failed);
    assert!(result.steps.iter().all(|s| s.target_label == "db-1"));
}

#[test]
fn test_recorder_left_mid_step_is_failed() {
    let mut recorder = StepRecorder::new("3", "db-1");
    recorder.begin("connect").unwrap();

    let result = recorder.finish();
    assert!(!result.success);
    assert!(result.error.unwrap().contains("StepRunning"));
}
