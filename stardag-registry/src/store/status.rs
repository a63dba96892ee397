//! Status derivation from event streams. Statuses are never stored; both
//! build and task status are folds over the build's ordered events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use stardag_types::{BuildStatus, EventType, TaskStatus};

use super::rows::EventRow;

#[derive(Debug, Clone, Default)]
pub struct TaskStatusInfo {
    pub status: Option<TaskStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl TaskStatusInfo {
    pub fn status(&self) -> TaskStatus {
        self.status.unwrap_or(TaskStatus::Pending)
    }
}

/// One pass over a build's events computing `task_pk -> status info`.
///
/// The status is the last task-scoped event in stream order; `started_at` is
/// the earliest TASK_STARTED; `completed_at` the latest terminal event.
pub fn fold_task_statuses(events: &[EventRow]) -> HashMap<u64, TaskStatusInfo> {
    let mut out: HashMap<u64, TaskStatusInfo> = HashMap::new();

    for event in events {
        let Some(pk) = event.task_pk else { continue };
        let info = out.entry(pk).or_default();
        match event.event_type {
            EventType::TaskPending => {
                info.status = Some(TaskStatus::Pending);
            }
            EventType::TaskStarted => {
                info.status = Some(TaskStatus::Running);
                if info.started_at.is_none() {
                    info.started_at = Some(event.created_at);
                }
            }
            EventType::TaskCompleted => {
                info.status = Some(TaskStatus::Completed);
                info.completed_at = Some(event.created_at);
            }
            EventType::TaskFailed => {
                info.status = Some(TaskStatus::Failed);
                info.completed_at = Some(event.created_at);
                if event.error_message.is_some() {
                    info.error_message = event.error_message.clone();
                }
            }
            _ => {}
        }
    }

    out
}

/// Build status from the same stream: failed beats completed beats running.
pub fn derive_build_status(
    events: &[EventRow],
) -> (BuildStatus, Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let mut started_at = None;
    let mut completed_at = None;
    let mut saw_started = false;
    let mut saw_completed = false;
    let mut saw_failed = false;

    for event in events {
        match event.event_type {
            EventType::BuildStarted => {
                saw_started = true;
                if started_at.is_none() {
                    started_at = Some(event.created_at);
                }
            }
            EventType::BuildCompleted => {
                saw_completed = true;
                completed_at = Some(event.created_at);
            }
            EventType::BuildFailed => {
                saw_failed = true;
                completed_at = Some(event.created_at);
            }
            _ => {}
        }
    }

    let status = if saw_failed {
        BuildStatus::Failed
    } else if saw_completed {
        BuildStatus::Completed
    } else if saw_started {
        BuildStatus::Running
    } else {
        BuildStatus::Pending
    };

    (status, started_at, completed_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::rows::EventRow;

    fn event(seq: u64, task_pk: Option<u64>, event_type: EventType) -> EventRow {
        EventRow {
            id: format!("evt-{seq}"),
            seq,
            build_id: "build-1".to_string(),
            task_pk,
            event_type,
            created_at: Utc::now() + chrono::Duration::milliseconds(seq as i64),
            error_message: None,
            metadata: None,
        }
    }

    #[test]
    fn task_status_follows_last_event() {
        let events = vec![
            event(1, Some(7), EventType::TaskPending),
            event(2, Some(7), EventType::TaskStarted),
            event(3, Some(7), EventType::TaskCompleted),
        ];
        let statuses = fold_task_statuses(&events);
        let info = &statuses[&7];
        assert_eq!(info.status(), TaskStatus::Completed);
        assert!(info.started_at.is_some());
        assert!(info.completed_at.is_some());
    }

    #[test]
    fn absent_events_mean_pending() {
        let statuses = fold_task_statuses(&[]);
        assert!(statuses.is_empty());
        assert_eq!(TaskStatusInfo::default().status(), TaskStatus::Pending);
    }

    #[test]
    fn failure_captures_error_message() {
        let mut failed = event(2, Some(3), EventType::TaskFailed);
        failed.error_message = Some("boom".to_string());
        let events = vec![event(1, Some(3), EventType::TaskStarted), failed];
        let statuses = fold_task_statuses(&events);
        assert_eq!(statuses[&3].status(), TaskStatus::Failed);
        assert_eq!(statuses[&3].error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn build_failed_wins_over_completed() {
        let events = vec![
            event(1, None, EventType::BuildStarted),
            event(2, None, EventType::BuildCompleted),
            event(3, None, EventType::BuildFailed),
        ];
        let (status, started, completed) = derive_build_status(&events);
        assert_eq!(status, BuildStatus::Failed);
        assert!(started.is_some());
        assert!(completed.is_some());
    }

    #[test]
    fn build_without_events_is_pending() {
        let (status, started, completed) = derive_build_status(&[]);
        assert_eq!(status, BuildStatus::Pending);
        assert!(started.is_none());
        assert!(completed.is_none());
    }
}
