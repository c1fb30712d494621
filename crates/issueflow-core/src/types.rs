use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FlowError;

// ---------------------------------------------------------------------------
// ConversationStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Analyzing,
    NeedsClarification,
    ReadyForDev,
    InDevelopment,
    Completed,
}

impl ConversationStatus {
    pub fn all() -> &'static [ConversationStatus] {
        &[
            ConversationStatus::Analyzing,
            ConversationStatus::NeedsClarification,
            ConversationStatus::ReadyForDev,
            ConversationStatus::InDevelopment,
            ConversationStatus::Completed,
        ]
    }

    /// Statuses reachable from `self` in a single transition.
    pub fn allowed_next(self) -> &'static [ConversationStatus] {
        use ConversationStatus::*;
        match self {
            Analyzing => &[NeedsClarification, ReadyForDev],
            NeedsClarification => &[NeedsClarification, ReadyForDev],
            ReadyForDev => &[InDevelopment, NeedsClarification],
            InDevelopment => &[Completed, NeedsClarification],
            Completed => &[],
        }
    }

    pub fn can_transition_to(self, to: ConversationStatus) -> bool {
        self.allowed_next().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_next().is_empty()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConversationStatus::Analyzing => "analyzing",
            ConversationStatus::NeedsClarification => "needs_clarification",
            ConversationStatus::ReadyForDev => "ready_for_dev",
            ConversationStatus::InDevelopment => "in_development",
            ConversationStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analyzing" => Ok(ConversationStatus::Analyzing),
            "needs_clarification" => Ok(ConversationStatus::NeedsClarification),
            "ready_for_dev" => Ok(ConversationStatus::ReadyForDev),
            "in_development" => Ok(ConversationStatus::InDevelopment),
            "completed" => Ok(ConversationStatus::Completed),
            _ => Err(FlowError::InvalidStatus(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// GenerationStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Generated,
    PrCreated,
    CiPassed,
    CiFailed,
    Merged,
    Closed,
    Failed,
}

impl GenerationStatus {
    pub fn allowed_next(self) -> &'static [GenerationStatus] {
        use GenerationStatus::*;
        match self {
            Generated => &[PrCreated, Failed],
            PrCreated => &[CiPassed, CiFailed, Merged, Closed],
            CiPassed | CiFailed => &[CiPassed, CiFailed, Merged, Closed],
            Merged | Closed | Failed => &[],
        }
    }

    pub fn can_transition_to(self, to: GenerationStatus) -> bool {
        self.allowed_next().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_next().is_empty()
    }

    /// A generation whose pull request has not reached a final outcome yet.
    pub fn is_in_flight(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GenerationStatus::Generated => "generated",
            GenerationStatus::PrCreated => "pr_created",
            GenerationStatus::CiPassed => "ci_passed",
            GenerationStatus::CiFailed => "ci_failed",
            GenerationStatus::Merged => "merged",
            GenerationStatus::Closed => "closed",
            GenerationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GenerationStatus {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generated" => Ok(GenerationStatus::Generated),
            "pr_created" => Ok(GenerationStatus::PrCreated),
            "ci_passed" => Ok(GenerationStatus::CiPassed),
            "ci_failed" => Ok(GenerationStatus::CiFailed),
            "merged" => Ok(GenerationStatus::Merged),
            "closed" => Ok(GenerationStatus::Closed),
            "failed" => Ok(GenerationStatus::Failed),
            _ => Err(FlowError::InvalidStatus(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// ActionStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failure,
    Partial,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Success => "success",
            ActionStatus::Failure => "failure",
            ActionStatus::Partial => "partial",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ActionStatus::Success),
            "failure" => Ok(ActionStatus::Failure),
            "partial" => Ok(ActionStatus::Partial),
            _ => Err(FlowError::InvalidStatus(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// AgentKind
// ---------------------------------------------------------------------------

/// Which agent produced an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Requirement refinement.
    ProductOwner,
    /// Code generation and pull requests.
    Developer,
    /// Ingress, replay handling and bookkeeping.
    Orchestrator,
}

impl AgentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::ProductOwner => "product_owner",
            AgentKind::Developer => "developer",
            AgentKind::Orchestrator => "orchestrator",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentKind {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "product_owner" => Ok(AgentKind::ProductOwner),
            "developer" => Ok(AgentKind::Developer),
            "orchestrator" => Ok(AgentKind::Orchestrator),
            _ => Err(FlowError::InvalidStatus(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// TurnRole
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Agent,
}

impl TurnRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Agent => "agent",
        }
    }
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TurnRole {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(TurnRole::User),
            "agent" => Ok(TurnRole::Agent),
            _ => Err(FlowError::InvalidStatus(s.to_string())),
        }
    }
}
