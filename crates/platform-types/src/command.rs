use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle of a single accepted command (spec §3 "Command").
///
/// Status is monotonic across terminal states: once `Succeeded`, `Failed`
/// or `TimedOut`, a command never transitions again. `Running` is the only
/// status a terminal row can be reached from more than once (redelivery
/// re-enters `Running` under a fresh lease).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Succeeded | CommandStatus::Failed | CommandStatus::TimedOut
        )
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Running => "RUNNING",
            CommandStatus::Succeeded => "SUCCEEDED",
            CommandStatus::Failed => "FAILED",
            CommandStatus::TimedOut => "TIMED_OUT",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CommandStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(CommandStatus::Pending),
            "RUNNING" => Ok(CommandStatus::Running),
            "SUCCEEDED" => Ok(CommandStatus::Succeeded),
            "FAILED" => Ok(CommandStatus::Failed),
            "TIMED_OUT" => Ok(CommandStatus::TimedOut),
            other => Err(format!("unknown command status: {other}")),
        }
    }
}

/// A durable command row (spec §3 "Command").
///
/// `idempotency_key` is unique across the whole table; `accept()` (C4)
/// resolves a duplicate key to the existing `id` rather than raising.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub name: String,
    pub business_key: Option<String>,
    pub idempotency_key: String,
    pub payload: Value,
    pub status: CommandStatus,
    pub retries: i32,
    pub lease_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to insert a new `PENDING` command row.
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub id: Uuid,
    pub name: String,
    pub business_key: Option<String>,
    pub idempotency_key: String,
    pub payload: Value,
}
