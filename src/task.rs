//! Task-state classification.
//!
//! Proxmox exposes tasks through two list calls: the full history
//! (`/nodes/{node}/tasks`) and the filtered running list
//! (`/nodes/{node}/tasks?running=1`). Records on the filtered list carry no
//! `status`/`state` at all, so the only reliable signal is `endtime`: a task
//! without one is still running.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

/// Length of the failed-task window in seconds.
pub const FAILED_TASK_WINDOW_SECS: i64 = 24 * 3600;

/// Number of leading records inspected for status/state samples.
const SAMPLE_RECORDS: usize = 50;
/// Maximum number of distinct sample values reported.
const SAMPLE_VALUES: usize = 10;

/// A task as reported by PVE or PBS.
///
/// PVE calls the worker type `type` and the worker id `id`; PBS uses
/// `worker_type` and `worker_id`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TaskRecord {
    /// Unique process ID
    #[serde(default)]
    pub upid: Option<String>,
    /// Worker type (vzdump, qmstart, backup, verify, garbage_collection, ...)
    #[serde(default, alias = "type")]
    pub worker_type: Option<String>,
    /// Worker ID (VM id, datastore:type/id, ...)
    #[serde(default, alias = "id")]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    /// Start timestamp
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub starttime: Option<i64>,
    /// End timestamp, absent while the task is running
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub endtime: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub exitstatus: Option<String>,
}

impl TaskRecord {
    /// The first non-blank of `status`, `state` and `exitstatus`.
    pub fn result(&self) -> Option<&str> {
        [&self.status, &self.state, &self.exitstatus]
            .into_iter()
            .filter_map(|field| field.as_deref())
            .map(str::trim)
            .find(|value| !value.is_empty())
    }
}

/// Largest accepted Unix timestamp (9999-12-31T23:59:59Z).
const MAX_EPOCH_SECS: i64 = 253_402_300_799;

/// Accepts numbers and numeric strings; anything else (empty string, null,
/// garbage, values outside `0..=MAX_EPOCH_SECS`) is treated as missing.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let seconds = match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().and_then(epoch_from_f64)),
        Some(Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(epoch_from_f64))
        }
        _ => None,
    };
    Ok(seconds.filter(|t| (0..=MAX_EPOCH_SECS).contains(t)))
}

fn epoch_from_f64(value: f64) -> Option<i64> {
    (value.is_finite() && (0.0..=MAX_EPOCH_SECS as f64).contains(&value)).then(|| value as i64)
}

/// Classified state of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// No `endtime` yet.
    Running,
    /// Finished with an OK result; carries the raw result string.
    Succeeded(String),
    /// Finished with any other result; carries the raw result string.
    Failed(String),
    /// Finished but the record does not say how.
    Unknown,
}

impl TaskState {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskState::Failed(_))
    }
}

/// Classify a task record.
///
/// Absence of `endtime` always wins: such a task is running even if it
/// carries a failure status.
///
/// # Examples
///
/// ```
/// use proxmox_suite::task::{classify, TaskRecord, TaskState};
///
/// let running = TaskRecord { starttime: Some(1_700_000_000), ..TaskRecord::default() };
/// assert_eq!(classify(&running), TaskState::Running);
///
/// let done = TaskRecord {
///     endtime: Some(1_700_000_100),
///     status: Some("OK".to_string()),
///     ..TaskRecord::default()
/// };
/// assert_eq!(classify(&done), TaskState::Succeeded("OK".to_string()));
/// ```
pub fn classify(task: &TaskRecord) -> TaskState {
    if task.endtime.is_none() {
        return TaskState::Running;
    }

    match task.result() {
        None => TaskState::Unknown,
        Some(result) if is_ok(result) => TaskState::Succeeded(result.to_string()),
        Some(result) if is_in_progress(result) => TaskState::Unknown,
        Some(result) => TaskState::Failed(result.to_string()),
    }
}

fn is_ok(result: &str) -> bool {
    result.eq_ignore_ascii_case("ok") || result.eq_ignore_ascii_case("success")
}

fn is_in_progress(result: &str) -> bool {
    result.eq_ignore_ascii_case("running") || result.eq_ignore_ascii_case("active")
}

/// Whether a task that ended at `endtime` falls into the trailing 24h window.
/// The boundary is inclusive.
pub fn ended_within_window(endtime: i64, now: i64) -> bool {
    now.saturating_sub(endtime) <= FAILED_TASK_WINDOW_SECS
}

/// Whether a task failed and ended within the trailing 24h window.
pub fn failed_within_window(task: &TaskRecord, now: i64) -> bool {
    match task.endtime {
        Some(endtime) => classify(task).is_failed() && ended_within_window(endtime, now),
        None => false,
    }
}

/// Count running tasks, counting each UPID once.
pub fn count_running(tasks: &[TaskRecord]) -> usize {
    let mut seen = HashSet::new();
    tasks
        .iter()
        .filter(|task| classify(task).is_running())
        .filter(|task| match task.upid.as_deref() {
            Some(upid) => seen.insert(upid),
            None => true,
        })
        .count()
}

/// Count failed tasks in the trailing 24h window.
///
/// Tasks whose UPID is in `running` are skipped: the running list of the same
/// cycle is authoritative for them whatever the history says.
pub fn count_failed_last_24h(tasks: &[TaskRecord], running: &[TaskRecord], now: i64) -> usize {
    let running_upids: HashSet<&str> = running
        .iter()
        .filter_map(|task| task.upid.as_deref())
        .collect();

    tasks
        .iter()
        .filter(|task| {
            task.upid
                .as_deref()
                .is_none_or(|upid| !running_upids.contains(upid))
        })
        .filter(|task| failed_within_window(task, now))
        .count()
}

/// Diagnostic view of a task list, attached to the task sensors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskListDiagnostics {
    pub tasks_available: bool,
    pub tasks_count: usize,
    pub sample_status_values: Vec<String>,
    pub sample_state_values: Vec<String>,
}

impl TaskListDiagnostics {
    pub fn from_tasks(tasks: &[TaskRecord]) -> Self {
        let mut statuses = BTreeSet::new();
        let mut states = BTreeSet::new();
        for task in tasks.iter().take(SAMPLE_RECORDS) {
            if let Some(status) = &task.status {
                statuses.insert(status.clone());
            }
            if let Some(state) = &task.state {
                states.insert(state.clone());
            }
        }

        Self {
            tasks_available: !tasks.is_empty(),
            tasks_count: tasks.len(),
            sample_status_values: statuses.into_iter().take(SAMPLE_VALUES).collect(),
            sample_state_values: states.into_iter().take(SAMPLE_VALUES).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_750_000_000;

    fn task(upid: &str, endtime: Option<i64>, status: Option<&str>) -> TaskRecord {
        TaskRecord {
            upid: Some(upid.to_string()),
            worker_type: Some("backup".to_string()),
            starttime: Some(NOW - 7200),
            endtime,
            status: status.map(str::to_string),
            ..TaskRecord::default()
        }
    }

    #[test]
    fn test_missing_endtime_is_running_regardless_of_status() {
        assert_eq!(classify(&task("a", None, None)), TaskState::Running);
        assert_eq!(classify(&task("b", None, Some("OK"))), TaskState::Running);
        assert_eq!(
            classify(&task("c", None, Some("job errors"))),
            TaskState::Running
        );

        let with_state = TaskRecord {
            state: Some("error".to_string()),
            ..task("d", None, None)
        };
        assert_eq!(classify(&with_state), TaskState::Running);
    }

    #[test]
    fn test_terminal_tasks() {
        assert_eq!(
            classify(&task("a", Some(NOW), Some("OK"))),
            TaskState::Succeeded("OK".to_string())
        );
        assert_eq!(
            classify(&task("b", Some(NOW), Some("command 'vzdump' failed: exit code 1"))),
            TaskState::Failed("command 'vzdump' failed: exit code 1".to_string())
        );
        assert_eq!(
            classify(&task("c", Some(NOW), Some("WARNINGS: 2"))),
            TaskState::Failed("WARNINGS: 2".to_string())
        );
        assert_eq!(classify(&task("d", Some(NOW), None)), TaskState::Unknown);
        assert_eq!(classify(&task("e", Some(NOW), Some("  "))), TaskState::Unknown);
        assert_eq!(classify(&task("f", Some(NOW), Some("running"))), TaskState::Unknown);
    }

    #[test]
    fn test_result_falls_back_to_state_and_exitstatus() {
        let by_state = TaskRecord {
            state: Some("success".to_string()),
            ..task("a", Some(NOW), None)
        };
        assert!(matches!(classify(&by_state), TaskState::Succeeded(_)));

        let by_exitstatus = TaskRecord {
            exitstatus: Some("unexpected status".to_string()),
            ..task("b", Some(NOW), None)
        };
        assert!(classify(&by_exitstatus).is_failed());
    }

    #[test]
    fn test_failed_window_boundaries() {
        let just_outside = task("a", Some(NOW - FAILED_TASK_WINDOW_SECS - 1), Some("error"));
        let on_boundary = task("b", Some(NOW - FAILED_TASK_WINDOW_SECS), Some("error"));
        let just_inside = task("c", Some(NOW - FAILED_TASK_WINDOW_SECS + 1), Some("error"));

        assert!(!failed_within_window(&just_outside, NOW));
        assert!(failed_within_window(&on_boundary, NOW));
        assert!(failed_within_window(&just_inside, NOW));
    }

    #[test]
    fn test_count_failed_skips_success_running_and_old() {
        let tasks = vec![
            task("ok", Some(NOW - 60), Some("OK")),
            task("fail", Some(NOW - 60), Some("error")),
            task("old", Some(NOW - 2 * FAILED_TASK_WINDOW_SECS), Some("error")),
            task("run", None, Some("error")),
            task("unknown", Some(NOW - 60), None),
        ];
        assert_eq!(count_failed_last_24h(&tasks, &[], NOW), 1);
    }

    #[test]
    fn test_count_failed_excludes_tasks_in_running_set() {
        let history = vec![task("x", Some(NOW - 60), Some("error"))];
        let running = vec![task("x", None, None)];
        assert_eq!(count_failed_last_24h(&history, &running, NOW), 0);
        assert_eq!(count_failed_last_24h(&history, &[], NOW), 1);
    }

    #[test]
    fn test_count_running_dedupes_by_upid() {
        let mut anonymous = task("", None, None);
        anonymous.upid = None;
        let tasks = vec![
            task("a", None, None),
            task("a", None, None),
            task("b", None, None),
            task("c", Some(NOW), Some("OK")),
            anonymous.clone(),
            anonymous,
        ];
        assert_eq!(count_running(&tasks), 4);
    }

    #[test]
    fn test_lenient_endtime_parsing() {
        let numeric: TaskRecord =
            serde_json::from_str(r#"{"upid": "u1", "endtime": 1700000000, "status": "OK"}"#)
                .unwrap();
        assert_eq!(numeric.endtime, Some(1_700_000_000));

        let string: TaskRecord =
            serde_json::from_str(r#"{"upid": "u2", "endtime": "1700000000"}"#).unwrap();
        assert_eq!(string.endtime, Some(1_700_000_000));

        let empty: TaskRecord = serde_json::from_str(r#"{"upid": "u3", "endtime": ""}"#).unwrap();
        assert_eq!(empty.endtime, None);
        assert!(classify(&empty).is_running());

        let missing: TaskRecord = serde_json::from_str(r#"{"upid": "u4"}"#).unwrap();
        assert!(classify(&missing).is_running());
    }

    #[test]
    fn test_out_of_range_endtime_is_ignored() {
        let garbage: TaskRecord = serde_json::from_str(
            r#"{"upid": "g1", "endtime": "-1e30", "status": "error"}"#,
        )
        .unwrap();
        assert_eq!(garbage.endtime, None);

        let huge: TaskRecord =
            serde_json::from_str(r#"{"upid": "g2", "endtime": 1e300, "status": "error"}"#)
                .unwrap();
        assert_eq!(huge.endtime, None);

        let negative: TaskRecord =
            serde_json::from_str(r#"{"upid": "g3", "endtime": -5, "status": "error"}"#).unwrap();
        assert_eq!(negative.endtime, None);

        let tasks = vec![garbage, huge, negative, task("fail", Some(NOW - 60), Some("error"))];
        assert_eq!(count_failed_last_24h(&tasks, &[], NOW), 1);
    }

    #[test]
    fn test_window_check_saturates() {
        assert!(!ended_within_window(i64::MIN, NOW));
        assert!(ended_within_window(i64::MAX, NOW));
    }

    #[test]
    fn test_pve_field_names() {
        let record: TaskRecord = serde_json::from_str(
            r#"{"upid": "UPID:pve1:0001", "type": "vzdump", "id": "100", "node": "pve1", "starttime": 1700000000}"#,
        )
        .unwrap();
        assert_eq!(record.worker_type.as_deref(), Some("vzdump"));
        assert_eq!(record.worker_id.as_deref(), Some("100"));
    }

    #[test]
    fn test_diagnostics() {
        let mut tasks = vec![
            task("a", Some(NOW), Some("OK")),
            task("b", Some(NOW), Some("OK")),
            task("c", Some(NOW), Some("error")),
        ];
        tasks[0].state = Some("stopped".to_string());

        let diagnostics = TaskListDiagnostics::from_tasks(&tasks);
        assert!(diagnostics.tasks_available);
        assert_eq!(diagnostics.tasks_count, 3);
        assert_eq!(diagnostics.sample_status_values, vec!["OK", "error"]);
        assert_eq!(diagnostics.sample_state_values, vec!["stopped"]);

        let empty = TaskListDiagnostics::from_tasks(&[]);
        assert!(!empty.tasks_available);
        assert_eq!(empty.tasks_count, 0);
    }
}
