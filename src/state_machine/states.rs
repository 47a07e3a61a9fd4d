use serde::{Deserialize, Serialize};
use std::fmt;

/// Worker lifecycle states owned by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Registered, not yet started (also the state a restart passes through)
    Initializing,
    /// Started and able to accept invocations
    Ready,
    /// Executing an invocation
    Running,
    /// Missed heartbeats; awaiting the restart decision
    Unavailable,
    /// Start failed or restart attempts exhausted
    Failed,
    /// Stopped by shutdown or deregistration
    Shutdown,
}

impl WorkerStatus {
    /// No further transitions allowed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Able to accept invocations
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }

    /// Check whether a transition is valid; same-state writes are allowed for
    /// non-terminal states
    pub fn can_transition_to(&self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;

        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return true;
        }

        match self {
            Initializing => matches!(next, Ready | Failed | Shutdown),
            Ready => matches!(next, Running | Unavailable | Initializing | Failed | Shutdown),
            Running => matches!(next, Ready | Unavailable | Initializing | Failed | Shutdown),
            Unavailable => matches!(next, Ready | Initializing | Failed | Shutdown),
            Failed => matches!(next, Initializing | Unavailable | Shutdown),
            Shutdown => false,
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Failed => write!(f, "failed"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "unavailable" => Ok(Self::Unavailable),
            "failed" => Ok(Self::Failed),
            "shutdown" => Ok(Self::Shutdown),
            _ => Err(format!("Invalid worker status: {s}")),
        }
    }
}

/// Collaborative plan states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    InProgress,
    /// Suspended until a human clarification arrives
    WaitingClarification,
    Completed,
    Failed,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Steps may run in this state
    pub fn is_executable(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    pub fn can_transition_to(&self, next: PlanStatus) -> bool {
        use PlanStatus::*;

        match self {
            Pending => matches!(next, InProgress | Failed),
            InProgress => matches!(next, InProgress | WaitingClarification | Completed | Failed),
            WaitingClarification => matches!(next, InProgress | Failed),
            Completed | Failed => false,
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::WaitingClarification => write!(f, "waiting_clarification"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for PlanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "waiting_clarification" => Ok(Self::WaitingClarification),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid plan status: {s}")),
        }
    }
}

/// Isolated task states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Waiting out the retry delay before the next attempt
    Retrying,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        match self {
            Pending => matches!(next, InProgress | Failed),
            InProgress => matches!(next, Completed | Failed | Retrying),
            Retrying => matches!(next, InProgress | Failed),
            Completed | Failed => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// Outcome status of a single plan step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
