use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Process instance status (spec §3/§4.8 state machine).
///
/// Terminal states are `Succeeded`, `Failed`, `Compensated`. `Paused` is an
/// operator-only state reachable only from `Running`; `resume` is the only
/// transition out of it back to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    New,
    Running,
    Succeeded,
    Failed,
    Compensating,
    Compensated,
    Paused,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessStatus::Succeeded | ProcessStatus::Failed | ProcessStatus::Compensated
        )
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessStatus::New => "NEW",
            ProcessStatus::Running => "RUNNING",
            ProcessStatus::Succeeded => "SUCCEEDED",
            ProcessStatus::Failed => "FAILED",
            ProcessStatus::Compensating => "COMPENSATING",
            ProcessStatus::Compensated => "COMPENSATED",
            ProcessStatus::Paused => "PAUSED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ProcessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(ProcessStatus::New),
            "RUNNING" => Ok(ProcessStatus::Running),
            "SUCCEEDED" => Ok(ProcessStatus::Succeeded),
            "FAILED" => Ok(ProcessStatus::Failed),
            "COMPENSATING" => Ok(ProcessStatus::Compensating),
            "COMPENSATED" => Ok(ProcessStatus::Compensated),
            "PAUSED" => Ok(ProcessStatus::Paused),
            other => Err(format!("unknown process status: {other}")),
        }
    }
}

/// The distinguished marker stored in `current_step` once a process has
/// left its graph (terminal / compensation-only states). Not a step name
/// the graph defines — `ProcessGraph::next_step` never returns it.
pub const TERMINAL_STEP: &str = "__terminal__";

/// Key under which the process manager tracks in-flight parallel branches
/// inside `ProcessInstance::data`. Handlers must never write this key
/// (spec §5): it is owned exclusively by the process manager.
pub const PARALLEL_BRANCHES_KEY: &str = "__parallel__";

/// Key under which the process manager tracks in-flight compensation
/// commands fired from [`ProcessStatus::Compensating`], mirroring
/// `PARALLEL_BRANCHES_KEY`'s bookkeeping shape.
pub const COMPENSATING_STEPS_KEY: &str = "__compensating__";

/// A durable process instance (spec §3 "Process instance").
///
/// `data` is copy-on-write: every mutation (from `executeStep` rendering a
/// payload, or `handleReply` merging a completion) replaces the whole map
/// rather than mutating in place, so the value written alongside a
/// `process_log` entry is always a complete, self-contained snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub process_id: Uuid,
    pub process_type: String,
    pub business_key: String,
    pub status: ProcessStatus,
    pub current_step: String,
    pub data: Value,
    pub retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only process log row (spec §3 "Process log entry").
///
/// `seq` is strictly increasing per `process_id`; `platform-db::process::update`
/// writes the instance row and exactly one log entry atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessLogEntry {
    pub process_id: Uuid,
    pub seq: i64,
    pub at: DateTime<Utc>,
    pub event: ProcessEvent,
}

/// Process event sum type (spec §3 "Process event"), encoded/decoded as a
/// single `{"type": "...", ...}` tagged union rather than as a sealed
/// interface hierarchy (§9 redesign flag).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProcessEvent {
    ProcessStarted {
        initial_step: String,
    },
    StepStarted {
        step: String,
        command_id: Option<Uuid>,
    },
    StepCompleted {
        step: String,
        command_id: Uuid,
    },
    StepFailed {
        step: String,
        command_id: Uuid,
        retryable: bool,
        error: String,
    },
    StepTimedOut {
        step: String,
        command_id: Uuid,
    },
    CompensationStarted {
        step: String,
        command_id: Uuid,
    },
    CompensationCompleted {
        step: String,
        command_id: Uuid,
    },
    CompensationFailed {
        step: String,
        command_id: Uuid,
        error: String,
    },
    CompensationTriggered {
        reason: String,
    },
    ProcessCompleted,
    ProcessCompensated,
    ProcessFailed {
        error: String,
    },
    ProcessPaused,
    ProcessResumed,
}

impl ProcessEvent {
    /// The step this event pertains to, if any — used by compensation
    /// (spec §4.8) to enumerate completed forward steps in reverse order.
    pub fn step(&self) -> Option<&str> {
        match self {
            ProcessEvent::StepStarted { step, .. }
            | ProcessEvent::StepCompleted { step, .. }
            | ProcessEvent::StepFailed { step, .. }
            | ProcessEvent::StepTimedOut { step, .. }
            | ProcessEvent::CompensationStarted { step, .. }
            | ProcessEvent::CompensationCompleted { step, .. }
            | ProcessEvent::CompensationFailed { step, .. } => Some(step),
            ProcessEvent::ProcessStarted { .. }
            | ProcessEvent::CompensationTriggered { .. }
            | ProcessEvent::ProcessCompleted
            | ProcessEvent::ProcessCompensated
            | ProcessEvent::ProcessFailed { .. }
            | ProcessEvent::ProcessPaused
            | ProcessEvent::ProcessResumed => None,
        }
    }
}
