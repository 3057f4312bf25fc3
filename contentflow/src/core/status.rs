//! Stage type and status enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of generation capability a stage invokes.
///
/// This is a closed set: adding a capability means adding a variant here
/// and an adapter for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    /// Script writing from the project brief.
    Script,
    /// Voice-over synthesis from a script.
    Voice,
    /// Image generation for scenes.
    Image,
    /// Final assembly of the generated media.
    Assembly,
}

impl StageType {
    /// All stage types, in canonical pipeline order.
    pub const ALL: [Self; 4] = [Self::Script, Self::Voice, Self::Image, Self::Assembly];

    /// Returns the stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Voice => "voice",
            Self::Image => "image",
            Self::Assembly => "assembly",
        }
    }
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "script" => Ok(Self::Script),
            "voice" => Ok(Self::Voice),
            "image" => Ok(Self::Image),
            "assembly" => Ok(Self::Assembly),
            other => Err(format!("unknown stage type '{other}'")),
        }
    }
}

/// Workflow-level lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created, waiting for `start`.
    #[default]
    Pending,
    /// Admitted and executing.
    Running,
    /// Every stage succeeded.
    Completed,
    /// A stage failed permanently.
    Failed,
    /// Cancelled by request.
    Cancelled,
}

impl WorkflowStatus {
    /// Returns true for `Completed`, `Failed` and `Cancelled`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the state machine allows moving to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Cancelled)
                | (Self::Running, Self::Completed | Self::Failed | Self::Cancelled)
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The execution status of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not started yet.
    #[default]
    Pending,
    /// An attempt is in flight or waiting out a backoff.
    Running,
    /// Produced an output.
    Succeeded,
    /// Failed permanently or exhausted its retries.
    Failed,
}

impl StageStatus {
    /// Returns true once the stage can no longer change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_type_display_and_parse() {
        for ty in StageType::ALL {
            assert_eq!(ty.to_string().parse::<StageType>().unwrap(), ty);
        }
        assert!("video".parse::<StageType>().is_err());
    }

    #[test]
    fn test_stage_type_serialize() {
        let json = serde_json::to_string(&StageType::Assembly).unwrap();
        assert_eq!(json, r#""assembly""#);
    }

    #[test]
    fn test_workflow_transitions() {
        use WorkflowStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Pending));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_stage_status_is_terminal() {
        assert!(StageStatus::Succeeded.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
    }
}
