//! Per-item workflow gating: the trigger policy.
//!
//! `evaluate` is a pure function from one item snapshot (plus a small view of
//! local state) to a single decision. Rules are evaluated top-down and the
//! first match wins:
//!
//! 1. `reset` label present on an open item → Reset.
//! 2. Closed or Done → Cleanup (once; the `cleaned_up` marker makes it
//!    idempotent). Closed items are cleaned up even when `reset` lingers
//!    on them.
//! 3. A running label with no local run backing it → clear it (stale
//!    recovery, subject to an authorship check the caller performs). A
//!    running label with a local run → nothing.
//! 4. Watched stage column, no running label, no ready label → run the
//!    stage workflow.
//! 5. Ready label plus `yolo` → advance the status.
//! 6. Research/Plan with an actionable comment → iterate on the comment.
//! 7. Otherwise nothing.
//!
//! Two or more running labels on one item violate the core invariant; that
//! is surfaced before anything else so the caller can repair it.

use crate::labels::{self, Label, Stage};
use crate::types::{Comment, Item, Status};

/// What the poller should do with an item this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Do nothing this cycle.
    None,
    /// Start the given stage under its running label.
    RunWorkflow(Stage),
    /// Respond to a new actionable comment with an in-place edit workflow.
    IterateComment(Comment),
    /// Yolo: advance the item to the next status column.
    Advance(Status),
    /// The `reset` control label is present.
    Reset,
    /// Item is finished; release resources and mark `cleaned_up`.
    Cleanup,
    /// A running label has no local run behind it. The caller must verify
    /// this daemon authored the label before stripping it.
    ClearStaleLabel(Label),
    /// More than one running label: an invariant violation. Strip them all.
    RepairRunningLabels(Vec<Label>),
}

/// The slice of local state the policy needs alongside the item snapshot.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    /// Whether the runner pool holds an active run for this item.
    pub has_active_run: bool,
    /// The oldest actionable comment newer than the cursor, if the reactor
    /// found one. `None` either means no new comments or that the caller
    /// skipped the fetch because earlier rules would fire anyway.
    pub actionable_comment: Option<Comment>,
}

/// The trigger policy, parameterized over the watched status columns.
#[derive(Debug, Clone)]
pub struct TriggerPolicy {
    watched: Vec<Status>,
}

impl TriggerPolicy {
    pub fn new(watched: Vec<Status>) -> Self {
        TriggerPolicy { watched }
    }

    fn is_watched(&self, status: &Status) -> bool {
        self.watched.contains(status)
    }

    /// Evaluates the rules for one item. Pure: no I/O, no mutation.
    pub fn evaluate(&self, item: &Item, ctx: &EvalContext) -> Decision {
        let running = item.running_labels();

        // Invariant: at most one running label per item. Repair first.
        if running.len() > 1 {
            return Decision::RepairRunningLabels(running);
        }

        // Rule 1: reset wins over everything else, but never fires on a
        // closed item (rule 2 handles those).
        if item.has_label(Label::Reset) && !item.state.is_closed() {
            return Decision::Reset;
        }

        // Rule 2: closed or Done items are cleaned up exactly once.
        if item.state.is_closed() || item.status == Status::Done {
            if item.has_label(Label::CleanedUp) {
                return Decision::None;
            }
            return Decision::Cleanup;
        }

        // Rule 3: a running label without a local run is stale.
        if let Some(label) = running.first().copied() {
            if ctx.has_active_run {
                return Decision::None;
            }
            return Decision::ClearStaleLabel(label);
        }

        // Rule 4: start the stage workflow for a watched column.
        if self.is_watched(&item.status)
            && let Some(stage) = Stage::for_status(&item.status)
        {
            let ready_present = stage
                .ready_label()
                .is_some_and(|ready| item.has_label(ready));
            if !ready_present {
                return Decision::RunWorkflow(stage);
            }
        }

        // Rule 5: yolo advances a stage whose ready label is present.
        if item.has_label(Label::Yolo)
            && let Some(stage) = Stage::for_status(&item.status)
            && stage
                .ready_label()
                .is_some_and(|ready| item.has_label(ready))
            && let Some(next) = labels::next_status(&item.status)
        {
            return Decision::Advance(next);
        }

        // Rule 6: iterate on new comments while in Research or Plan.
        if matches!(item.status, Status::Research | Status::Plan)
            && let Some(comment) = &ctx.actionable_comment
        {
            return Decision::IterateComment(comment.clone());
        }

        Decision::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{item_in, with_labels};
    use crate::types::ItemState;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn policy() -> TriggerPolicy {
        TriggerPolicy::new(vec![Status::Research, Status::Plan, Status::Implement])
    }

    fn ctx() -> EvalContext {
        EvalContext::default()
    }

    fn comment(body: &str) -> Comment {
        Comment {
            id: crate::types::CommentId(9),
            author: "alice".to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
            reactions: BTreeSet::new(),
        }
    }

    #[test]
    fn reset_label_wins() {
        let item = with_labels(item_in(Status::Research), &["reset", "researching"]);
        // Reset outranks even a running label... but two running labels
        // would still be repaired first.
        assert_eq!(policy().evaluate(&item, &ctx()), Decision::Reset);
    }

    #[test]
    fn done_item_is_cleaned_up_once() {
        let item = item_in(Status::Done);
        assert_eq!(policy().evaluate(&item, &ctx()), Decision::Cleanup);

        let item = with_labels(item_in(Status::Done), &["cleaned_up"]);
        assert_eq!(policy().evaluate(&item, &ctx()), Decision::None);
    }

    #[test]
    fn closed_item_is_cleaned_up() {
        let mut item = item_in(Status::Research);
        item.state = ItemState::Closed;
        assert_eq!(policy().evaluate(&item, &ctx()), Decision::Cleanup);
    }

    #[test]
    fn closed_item_with_reset_is_cleaned_up_not_reset() {
        let mut item = with_labels(item_in(Status::Research), &["reset", "research_ready"]);
        item.state = ItemState::Closed;
        assert_eq!(policy().evaluate(&item, &ctx()), Decision::Cleanup);

        // Once marked, the lingering reset label changes nothing.
        let mut item = with_labels(item_in(Status::Research), &["reset", "cleaned_up"]);
        item.state = ItemState::Closed;
        assert_eq!(policy().evaluate(&item, &ctx()), Decision::None);
    }

    #[test]
    fn running_label_with_active_run_is_left_alone() {
        let item = with_labels(item_in(Status::Research), &["researching"]);
        let ctx = EvalContext {
            has_active_run: true,
            ..Default::default()
        };
        assert_eq!(policy().evaluate(&item, &ctx), Decision::None);
    }

    #[test]
    fn running_label_without_run_is_stale() {
        let item = with_labels(item_in(Status::Research), &["researching"]);
        assert_eq!(
            policy().evaluate(&item, &ctx()),
            Decision::ClearStaleLabel(Label::Researching)
        );
    }

    #[test]
    fn two_running_labels_trigger_repair() {
        let item = with_labels(item_in(Status::Research), &["researching", "planning"]);
        assert_eq!(
            policy().evaluate(&item, &ctx()),
            Decision::RepairRunningLabels(vec![Label::Researching, Label::Planning])
        );
    }

    #[test]
    fn bare_research_item_triggers_research() {
        let item = item_in(Status::Research);
        assert_eq!(
            policy().evaluate(&item, &ctx()),
            Decision::RunWorkflow(Stage::Research)
        );
    }

    #[test]
    fn ready_label_blocks_rerun() {
        let item = with_labels(item_in(Status::Research), &["research_ready"]);
        assert_eq!(policy().evaluate(&item, &ctx()), Decision::None);
    }

    #[test]
    fn unwatched_status_never_triggers() {
        let policy = TriggerPolicy::new(vec![Status::Research]);
        let item = item_in(Status::Plan);
        assert_eq!(policy.evaluate(&item, &ctx()), Decision::None);
    }

    #[test]
    fn implement_reruns_even_without_ready_label() {
        // Implement defines no ready label, so the column alone triggers.
        let item = item_in(Status::Implement);
        assert_eq!(
            policy().evaluate(&item, &ctx()),
            Decision::RunWorkflow(Stage::Implement)
        );
    }

    #[test]
    fn yolo_with_ready_advances() {
        let item = with_labels(item_in(Status::Research), &["research_ready", "yolo"]);
        assert_eq!(
            policy().evaluate(&item, &ctx()),
            Decision::Advance(Status::Plan)
        );

        let item = with_labels(item_in(Status::Plan), &["plan_ready", "yolo"]);
        assert_eq!(
            policy().evaluate(&item, &ctx()),
            Decision::Advance(Status::Implement)
        );
    }

    #[test]
    fn yolo_without_ready_does_not_advance() {
        let item = with_labels(item_in(Status::Research), &["yolo"]);
        // Rule 4 fires instead: the stage itself still needs to run.
        assert_eq!(
            policy().evaluate(&item, &ctx()),
            Decision::RunWorkflow(Stage::Research)
        );
    }

    #[test]
    fn yolo_on_backlog_does_nothing() {
        // Backlog has no stage and no ready label; yolo alone must not
        // trigger the first Research transition.
        let item = with_labels(item_in(Status::Backlog), &["yolo"]);
        assert_eq!(policy().evaluate(&item, &ctx()), Decision::None);
    }

    #[test]
    fn actionable_comment_iterates_after_ready() {
        let item = with_labels(item_in(Status::Research), &["research_ready"]);
        let ctx = EvalContext {
            has_active_run: false,
            actionable_comment: Some(comment("tighten the scope")),
        };
        match policy().evaluate(&item, &ctx) {
            Decision::IterateComment(c) => assert_eq!(c.body, "tighten the scope"),
            other => panic!("expected IterateComment, got {other:?}"),
        }
    }

    #[test]
    fn comments_never_iterate_in_implement() {
        // No PR-stage vibe-coding: Implement items run the stage workflow
        // and comments are ignored by rule 6's status gate.
        let item = item_in(Status::Implement);
        let ctx = EvalContext {
            has_active_run: false,
            actionable_comment: Some(comment("tweak it")),
        };
        assert_eq!(
            policy().evaluate(&item, &ctx),
            Decision::RunWorkflow(Stage::Implement)
        );

        // Even when the stage cannot run (unwatched), Implement comments do
        // not trigger iteration.
        let narrow = TriggerPolicy::new(vec![Status::Research]);
        assert_eq!(narrow.evaluate(&item, &ctx), Decision::None);
    }

    #[test]
    fn yolo_advance_outranks_comment_iteration() {
        let item = with_labels(item_in(Status::Research), &["research_ready", "yolo"]);
        let ctx = EvalContext {
            has_active_run: false,
            actionable_comment: Some(comment("late feedback")),
        };
        assert_eq!(policy().evaluate(&item, &ctx), Decision::Advance(Status::Plan));
    }

    #[test]
    fn backlog_item_does_nothing() {
        let item = item_in(Status::Backlog);
        assert_eq!(policy().evaluate(&item, &ctx()), Decision::None);
    }

    #[test]
    fn custom_status_does_nothing() {
        let item = item_in(Status::Other("Future Ideas".to_string()));
        assert_eq!(policy().evaluate(&item, &ctx()), Decision::None);
    }
}
