use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its fire_at time.
    Pending,
    /// Claimed by the engine and forwarded for execution.
    Running,
    /// Executed; kept until the id is re-armed or removed.
    Fired,
}

impl TaskStatus {
    /// A live task will still fire (or is firing right now).
    pub fn is_live(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Fired => "fired",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "fired" => Ok(TaskStatus::Fired),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A persisted single-fire task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Caller-chosen key; at most one row per id.
    pub id: String,
    /// Instant at which the task becomes due.
    pub fire_at: DateTime<Utc>,
    /// Arbitrary JSON payload forwarded to the fired-task router.
    pub payload: String,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// RFC 3339 timestamp of the first arm.
    pub created_at: String,
    /// RFC 3339 timestamp of the last state change.
    pub updated_at: String,
}

impl Task {
    /// Decode the JSON payload into a caller-defined type.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.payload)
    }
}
