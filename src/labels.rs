//! Canonical kiln label set and stage transition table.
//!
//! Labels on the remote issue are the shared state machine between daemon
//! instances and human users. This module is pure data: it enumerates the
//! labels, classifies them, and maps board statuses to workflow stages and
//! their running / ready / failure labels. No I/O happens here.
//!
//! # Invariants encoded here
//!
//! - Every stage has exactly one running label.
//! - Ready labels exist only for stages whose output awaits advancement
//!   (Research and Plan).
//! - A stage may define no failure label; failures then surface only through
//!   run history and the removed running label.

use std::collections::BTreeSet;
use std::fmt;

use crate::types::Status;

/// Every label the daemon owns on the ticket system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Label {
    // Running labels: a workflow is in progress. At most one per item.
    Preparing,
    Researching,
    Planning,
    Implementing,
    Reviewing,
    Editing,
    // Ready labels: stage output awaits advancement.
    ResearchReady,
    PlanReady,
    // Control labels: user-driven signals.
    Yolo,
    Reset,
    // Failure labels: surfaced on the ticket itself.
    YoloFailed,
    ImplementationFailed,
    ResearchFailed,
    // Marker: Done-column resources have been released.
    CleanedUp,
}

/// Classification of a label, used for reset stripping and invariant checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelClass {
    Running,
    Ready,
    Control,
    Failure,
    Marker,
}

impl Label {
    /// All kiln labels in canonical order.
    pub const ALL: [Label; 14] = [
        Label::Preparing,
        Label::Researching,
        Label::Planning,
        Label::Implementing,
        Label::Reviewing,
        Label::Editing,
        Label::ResearchReady,
        Label::PlanReady,
        Label::Yolo,
        Label::Reset,
        Label::YoloFailed,
        Label::ImplementationFailed,
        Label::ResearchFailed,
        Label::CleanedUp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Label::Preparing => "preparing",
            Label::Researching => "researching",
            Label::Planning => "planning",
            Label::Implementing => "implementing",
            Label::Reviewing => "reviewing",
            Label::Editing => "editing",
            Label::ResearchReady => "research_ready",
            Label::PlanReady => "plan_ready",
            Label::Yolo => "yolo",
            Label::Reset => "reset",
            Label::YoloFailed => "yolo_failed",
            Label::ImplementationFailed => "implementation_failed",
            Label::ResearchFailed => "research_failed",
            Label::CleanedUp => "cleaned_up",
        }
    }

    pub fn parse(s: &str) -> Option<Label> {
        Label::ALL.iter().copied().find(|l| l.as_str() == s)
    }

    pub fn class(self) -> LabelClass {
        match self {
            Label::Preparing
            | Label::Researching
            | Label::Planning
            | Label::Implementing
            | Label::Reviewing
            | Label::Editing => LabelClass::Running,
            Label::ResearchReady | Label::PlanReady => LabelClass::Ready,
            Label::Yolo | Label::Reset => LabelClass::Control,
            Label::YoloFailed | Label::ImplementationFailed | Label::ResearchFailed => {
                LabelClass::Failure
            }
            Label::CleanedUp => LabelClass::Marker,
        }
    }

    pub fn is_running(self) -> bool {
        self.class() == LabelClass::Running
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Metadata used when provisioning labels on a repository.
#[derive(Debug, Clone, Copy)]
pub struct LabelSpec {
    pub label: Label,
    pub description: &'static str,
    pub color: &'static str,
}

/// Labels created in every repository that appears on a watched board.
///
/// Colors follow the GitHub default palette: orange for in-progress, blue for
/// review/interaction, green for ready, red for failure, purple for control.
pub const REQUIRED_LABELS: [LabelSpec; 14] = [
    LabelSpec {
        label: Label::Preparing,
        description: "Preparation workflow in progress",
        color: "FFA500",
    },
    LabelSpec {
        label: Label::Researching,
        description: "Research workflow in progress",
        color: "FFA500",
    },
    LabelSpec {
        label: Label::Planning,
        description: "Planning workflow in progress",
        color: "FFA500",
    },
    LabelSpec {
        label: Label::Implementing,
        description: "Implementation workflow in progress",
        color: "FFA500",
    },
    LabelSpec {
        label: Label::Reviewing,
        description: "PR under internal review",
        color: "1D76DB",
    },
    LabelSpec {
        label: Label::Editing,
        description: "Processing user comment",
        color: "1D76DB",
    },
    LabelSpec {
        label: Label::ResearchReady,
        description: "Research findings ready for review",
        color: "0E8A16",
    },
    LabelSpec {
        label: Label::PlanReady,
        description: "Implementation plan ready for review",
        color: "0E8A16",
    },
    LabelSpec {
        label: Label::Yolo,
        description: "Automatically advance through ready stages",
        color: "5319E7",
    },
    LabelSpec {
        label: Label::Reset,
        description: "Wipe generated content and return to Backlog",
        color: "5319E7",
    },
    LabelSpec {
        label: Label::YoloFailed,
        description: "Automatic advancement failed",
        color: "B60205",
    },
    LabelSpec {
        label: Label::ImplementationFailed,
        description: "Implementation workflow failed",
        color: "B60205",
    },
    LabelSpec {
        label: Label::ResearchFailed,
        description: "Research workflow failed",
        color: "B60205",
    },
    LabelSpec {
        label: Label::CleanedUp,
        description: "Workspace resources released",
        color: "D4C5F9",
    },
];

/// A workflow stage.
///
/// Prepare / Research / Plan / Implement / Review run in their status
/// columns; Edit is the in-place comment iteration workflow and has no
/// column of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Prepare,
    Research,
    Plan,
    Implement,
    Review,
    Edit,
}

impl Stage {
    /// The workflow name recorded in run history and passed to the executor.
    pub fn workflow_name(self) -> &'static str {
        match self {
            Stage::Prepare => "prepare",
            Stage::Research => "research",
            Stage::Plan => "plan",
            Stage::Implement => "implement",
            Stage::Review => "review",
            Stage::Edit => "process_comments",
        }
    }

    /// Parses a stage by its workflow name (used by configuration).
    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "prepare" => Some(Stage::Prepare),
            "research" => Some(Stage::Research),
            "plan" => Some(Stage::Plan),
            "implement" => Some(Stage::Implement),
            "review" => Some(Stage::Review),
            "process_comments" | "edit" => Some(Stage::Edit),
            _ => None,
        }
    }

    /// The running label held while this stage executes.
    pub fn running_label(self) -> Label {
        match self {
            Stage::Prepare => Label::Preparing,
            Stage::Research => Label::Researching,
            Stage::Plan => Label::Planning,
            Stage::Implement => Label::Implementing,
            Stage::Review => Label::Reviewing,
            Stage::Edit => Label::Editing,
        }
    }

    /// The ready label added on success, if the stage defines one.
    pub fn ready_label(self) -> Option<Label> {
        match self {
            Stage::Research => Some(Label::ResearchReady),
            Stage::Plan => Some(Label::PlanReady),
            _ => None,
        }
    }

    /// The failure label added on failure, if the stage defines one.
    pub fn failure_label(self) -> Option<Label> {
        match self {
            Stage::Research => Some(Label::ResearchFailed),
            Stage::Implement => Some(Label::ImplementationFailed),
            _ => None,
        }
    }

    /// Maps a board status to the stage that runs in that column.
    pub fn for_status(status: &Status) -> Option<Stage> {
        match status {
            Status::Prepare => Some(Stage::Prepare),
            Status::Research => Some(Stage::Research),
            Status::Plan => Some(Stage::Plan),
            Status::Implement => Some(Stage::Implement),
            Status::Validate => Some(Stage::Review),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.workflow_name())
    }
}

/// The status an item advances to when its current stage's ready label is
/// accepted (the yolo transition table).
pub fn next_status(status: &Status) -> Option<Status> {
    match status {
        Status::Research => Some(Status::Plan),
        Status::Plan => Some(Status::Implement),
        _ => None,
    }
}

/// Extracts the kiln running labels present in a raw label set, in canonical
/// order.
pub fn running_labels_in(labels: &BTreeSet<String>) -> Vec<Label> {
    Label::ALL
        .iter()
        .copied()
        .filter(|l| l.is_running() && labels.contains(l.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_parse_roundtrip() {
        for label in Label::ALL {
            assert_eq!(Label::parse(label.as_str()), Some(label));
        }
        assert_eq!(Label::parse("bug"), None);
    }

    #[test]
    fn exactly_six_running_labels() {
        let running: Vec<_> = Label::ALL.iter().filter(|l| l.is_running()).collect();
        assert_eq!(running.len(), 6);
    }

    #[test]
    fn every_label_has_a_spec() {
        for label in Label::ALL {
            assert!(
                REQUIRED_LABELS.iter().any(|spec| spec.label == label),
                "missing spec for {label}"
            );
        }
        assert_eq!(REQUIRED_LABELS.len(), Label::ALL.len());
    }

    #[test]
    fn stage_running_labels_are_distinct() {
        let stages = [
            Stage::Prepare,
            Stage::Research,
            Stage::Plan,
            Stage::Implement,
            Stage::Review,
            Stage::Edit,
        ];
        let labels: BTreeSet<_> = stages.iter().map(|s| s.running_label()).collect();
        assert_eq!(labels.len(), stages.len());
    }

    #[test]
    fn ready_labels_only_for_research_and_plan() {
        assert_eq!(Stage::Research.ready_label(), Some(Label::ResearchReady));
        assert_eq!(Stage::Plan.ready_label(), Some(Label::PlanReady));
        assert_eq!(Stage::Prepare.ready_label(), None);
        assert_eq!(Stage::Implement.ready_label(), None);
        assert_eq!(Stage::Review.ready_label(), None);
        assert_eq!(Stage::Edit.ready_label(), None);
    }

    #[test]
    fn plan_stage_defines_no_failure_label() {
        assert_eq!(Stage::Plan.failure_label(), None);
        assert_eq!(Stage::Research.failure_label(), Some(Label::ResearchFailed));
        assert_eq!(
            Stage::Implement.failure_label(),
            Some(Label::ImplementationFailed)
        );
    }

    #[test]
    fn status_to_stage_mapping() {
        assert_eq!(Stage::for_status(&Status::Research), Some(Stage::Research));
        assert_eq!(Stage::for_status(&Status::Validate), Some(Stage::Review));
        assert_eq!(Stage::for_status(&Status::Backlog), None);
        assert_eq!(Stage::for_status(&Status::Done), None);
        assert_eq!(
            Stage::for_status(&Status::Other("Future Ideas".into())),
            None
        );
    }

    #[test]
    fn yolo_transition_table() {
        assert_eq!(next_status(&Status::Research), Some(Status::Plan));
        assert_eq!(next_status(&Status::Plan), Some(Status::Implement));
        assert_eq!(next_status(&Status::Implement), None);
        assert_eq!(next_status(&Status::Backlog), None);
    }

    #[test]
    fn running_labels_in_ignores_foreign_labels() {
        let labels: BTreeSet<String> = ["bug", "researching", "yolo", "editing"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            running_labels_in(&labels),
            vec![Label::Researching, Label::Editing]
        );
    }
}
