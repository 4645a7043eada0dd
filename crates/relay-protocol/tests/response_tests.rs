use chrono::{TimeZone, Utc};
use relay_protocol::*;
use serde_json::json;

#[test]
fn test_status_forward_transitions() {
    use TaskStatus::*;
    assert!(Created.can_transition_to(Acknowledged));
    assert!(Created.can_transition_to(Failed));
    assert!(Acknowledged.can_transition_to(InProgress));
    assert!(Acknowledged.can_transition_to(Completed));
    assert!(InProgress.can_transition_to(InProgress));
    assert!(InProgress.can_transition_to(Completed));
    assert!(InProgress.can_transition_to(Failed));
}

#[test]
fn test_status_rejects_backward_and_terminal() {
    use TaskStatus::*;
    assert!(!Acknowledged.can_transition_to(Acknowledged));
    assert!(!InProgress.can_transition_to(Acknowledged));
    assert!(!Completed.can_transition_to(Acknowledged));
    assert!(!Completed.can_transition_to(Failed));
    assert!(!Failed.can_transition_to(Completed));
    assert!(!Acknowledged.can_transition_to(Created));
}

#[test]
fn test_status_parse() {
    assert_eq!("in_progress".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
    assert_eq!(
        "done".parse::<TaskStatus>().unwrap_err(),
        ProtocolError::UnknownStatus("done".into())
    );
}

#[test]
fn test_failed_response_lifts_retry_hints() {
    let retry_at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
    let response = TaskResponse::failed(
        "t1",
        "th1",
        "upstream down",
        TaskError::new("UPSTREAM", "503").retryable(Some(retry_at)),
    );
    assert_eq!(response.retry_possible, Some(true));
    assert_eq!(response.retry_after, Some(retry_at));
    assert_eq!(response.error_code(), Some("UPSTREAM"));
}

#[test]
fn test_response_fields_roundtrip_preserves_values() {
    let mut response = TaskResponse::completed(
        "t1",
        "th1",
        "done",
        Some(json!({"n": 1}).as_object().cloned().unwrap()),
    );
    response.timestamp = Utc.with_ymd_and_hms(2026, 5, 6, 7, 8, 9).unwrap();

    let decoded = TaskResponse::from_fields(&response.to_fields().unwrap()).unwrap();
    assert_eq!(decoded, response);
    assert_eq!(decoded.timestamp.timestamp(), response.timestamp.timestamp());
}

#[test]
fn test_progress_validation() {
    let response = TaskResponse::in_progress(
        "t1",
        "th1",
        "working",
        Some(TaskProgress::new("step 3", 3).with_total_steps(2)),
    );
    assert!(response.validate().is_err());

    let ok = TaskResponse::in_progress(
        "t1",
        "th1",
        "working",
        Some(TaskProgress::new("step 1", 1).with_total_steps(4)),
    );
    assert!(ok.validate().is_ok());
}

#[test]
fn test_retry_hints_only_on_failed() {
    let mut response = TaskResponse::acknowledged("t1", "th1", "ok");
    response.retry_possible = Some(true);
    assert!(response.to_fields().is_err());
}

#[test]
fn test_unknown_status_on_ingress() {
    let mut fields = TaskResponse::acknowledged("t1", "th1", "ok").to_fields().unwrap();
    fields.insert("status".into(), "\"paused\"".into());
    assert_eq!(
        TaskResponse::from_fields(&fields).unwrap_err(),
        ProtocolError::UnknownStatus("paused".into())
    );
}

#[test]
fn test_created_status_rejected_on_ingress() {
    let mut fields = TaskResponse::acknowledged("t1", "th1", "ok").to_fields().unwrap();
    fields.insert("status".into(), "created".into());
    assert!(matches!(
        TaskResponse::from_fields(&fields),
        Err(ProtocolError::Validation(_))
    ));
}

#[test]
fn test_missing_thread_id_on_ingress() {
    let mut fields = TaskResponse::acknowledged("t1", "th1", "ok").to_fields().unwrap();
    fields.remove("thread_id");
    assert_eq!(
        TaskResponse::from_fields(&fields).unwrap_err(),
        ProtocolError::Validation(ValidationError::MissingField("thread_id".into()))
    );
}

#[test]
fn test_foreign_numeric_task_id_decodes_as_text() {
    let mut fields = TaskResponse::acknowledged("t1", "th1", "ok").to_fields().unwrap();
    fields.insert("task_id".into(), "1001".into());
    fields.insert("message".into(), "null".into());
    let decoded = TaskResponse::from_fields(&fields).unwrap();
    assert_eq!(decoded.task_id, "1001");
    assert_eq!(decoded.message, "null");
}
