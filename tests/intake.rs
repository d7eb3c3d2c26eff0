//! Scan, classify and act: launches, plans, questions and skips.

mod common;

use common::*;
use forge_grid::config::BudgetSection;
use forge_grid::coordinator::CyclePhase;
use forge_grid::coordinator::db::ExecutionQuery;
use forge_grid::tracker::metadata::{CommentKind, extract_metadata};
use grid_common::{Category, ExecutionMode, ExecutionStatus, Label};

const PLAN_42: &str = r#"Here is the plan:
{
  "summary": "Split the export feature into parser, writer and CLI.",
  "sub_tasks": [
    {"title": "Add CSV parser", "description": "Parse rows", "acceptance_criteria": ["handles quotes"], "complexity": 3, "depends_on": []},
    {"title": "Add CSV writer", "description": "Write rows", "complexity": 3, "depends_on": []},
    {"title": "Wire export command", "description": "CLI flag", "complexity": 2, "depends_on": [0]}
  ],
  "risks": ["large files"]
}"#;

#[tokio::test]
async fn test_simple_issue_is_launched_and_labelled() {
    let h = harness();
    h.tracker.add_issue(7, "Fix typo in README", "teh -> the", &[]);
    h.completion.classify(7, &simple("one-line fix"));

    let report = h.coordinator.run_phase(CyclePhase::Intake).await;

    assert_eq!(report.scanned, 1);
    assert_eq!(report.launched, 1);
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert!(h.tracker.has_label(7, Label::InProgress));

    let launches = h.grid.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].issue_number, 7);
    assert_eq!(launches[0].mode, ExecutionMode::Implement);
    assert!(launches[0].config.prompt.contains("Closes #7"));
    assert_eq!(launches[0].context["mode"], "implement");

    let executions = h
        .db
        .call(|db| db.list_executions(&ExecutionQuery::default()))
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Running);
    assert_eq!(executions[0].branch.as_deref(), Some("agent/7"));
    assert_eq!(executions[0].external_run_id.as_deref(), Some("m-7"));

    let state = h
        .db
        .call(|db| db.get_issue_state(REPO, 7))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.classification, Some(Category::Simple));
    assert_eq!(state.metadata["reason"], "one-line fix");
}

#[tokio::test]
async fn test_at_most_one_active_execution_per_issue() {
    let h = harness();
    h.tracker.add_issue(7, "Fix typo", "", &[]);
    h.completion.classify(7, &simple("small"));

    h.coordinator.run_phase(CyclePhase::Intake).await;
    // Someone strips the status label; the issue is scanned again.
    h.tracker.add_issue(7, "Fix typo", "", &[]);
    let report = h.coordinator.run_phase(CyclePhase::Intake).await;

    assert_eq!(report.classified, 1);
    assert_eq!(report.launched, 0);
    assert_eq!(h.grid.launches().len(), 1);
    // The running issue gets its label back and drops out of the next scan.
    assert!(h.tracker.has_label(7, Label::InProgress));
    let next = h.coordinator.run_phase(CyclePhase::Intake).await;
    assert_eq!(next.scanned, 0);
    let active = h.db.call(|db| db.count_active()).await.unwrap();
    assert_eq!(active, 1);
}

#[tokio::test]
async fn test_unparseable_classification_defaults_to_simple() {
    let h = harness();
    h.tracker.add_issue(3, "Refactor", "", &[]);
    h.completion.classify(3, "I think this one is probably easy.");

    let report = h.coordinator.run_phase(CyclePhase::Intake).await;

    assert_eq!(report.launched, 1);
    let state = h
        .db
        .call(|db| db.get_issue_state(REPO, 3))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.classification, Some(Category::Simple));
    assert_eq!(
        state.metadata["reason"],
        "Classification parse error, defaulting to SIMPLE"
    );
}

#[tokio::test]
async fn test_failed_classification_call_skips_issue() {
    let h = harness();
    h.tracker.add_issue(4, "Mystery", "", &[]);

    let report = h.coordinator.run_phase(CyclePhase::Intake).await;

    assert_eq!(report.skipped, 1);
    assert_eq!(report.launched, 0);
    assert!(h.tracker.has_label(4, Label::Skipped));
    assert!(h.grid.launches().is_empty());
}

#[tokio::test]
async fn test_blocked_issue_gets_question_and_label() {
    let h = harness();
    h.tracker.add_issue(55, "Add auth", "Make login work", &[]);
    h.completion.classify(
        55,
        r#"{"category": "BLOCKED", "reason": "unclear provider", "blocking_question": "Which OAuth provider should we use?"}"#,
    );

    let report = h.coordinator.run_phase(CyclePhase::Intake).await;

    assert_eq!(report.blocked, 1);
    assert_eq!(h.tracker.labels(55), vec!["ai-blocked"]);
    let comments = h.tracker.comments(55);
    assert_eq!(comments.len(), 1);
    assert!(comments[0].body.contains("Which OAuth provider should we use?"));
    assert_eq!(
        extract_metadata(&comments[0].body).map(|m| m.kind),
        Some(CommentKind::BlockingQuestion)
    );
}

#[tokio::test]
async fn test_complex_issue_is_decomposed_into_sub_issues() {
    let h = harness();
    h.tracker.add_issue(42, "CSV export", "Users want CSV export", &[]);
    h.completion.classify(42, r#"{"category": "COMPLEX", "reason": "three concerns"}"#);
    h.completion.plan(42, PLAN_42);

    let report = h.coordinator.run_phase(CyclePhase::Intake).await;
    assert_eq!(report.planned, 1);
    assert!(report.errors.is_empty(), "{:?}", report.errors);

    let subs = h.tracker.sub_issues_of(42);
    assert_eq!(subs.len(), 3);
    let numbers: Vec<u64> = subs.iter().map(|s| s.number).collect();
    assert!(subs.iter().all(|s| s.has_label(Label::SubIssue)));
    assert!(!subs[0].has_label(Label::Waiting));
    assert!(!subs[1].has_label(Label::Waiting));
    assert!(subs[2].has_label(Label::Waiting));
    assert_eq!(subs[2].blocked_by, vec![numbers[0]]);

    // The parent is an epic with no status label.
    let parent = h.tracker.issue(42);
    assert!(parent.has_label(Label::Epic));
    assert_eq!(parent.status_label(), None);

    // The summary mentions each sub-issue exactly once.
    let comments = h.tracker.comments(42);
    assert_eq!(comments.len(), 1);
    let summary = &comments[0].body;
    for n in &numbers {
        assert_eq!(summary.matches(&format!("#{} ", n)).count(), 1, "{}", summary);
    }

    let state = h
        .db
        .call(|db| db.get_issue_state(REPO, 42))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.sub_issues, numbers);
    let child = h
        .db
        .call(move |db| db.get_issue_state(REPO, numbers[2]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child.parent_issue, Some(42));
}

#[tokio::test]
async fn test_repeated_dependencies_are_listed_once() {
    let h = harness();
    h.tracker.add_issue(42, "CSV export", "", &[]);
    h.completion.classify(42, r#"{"category": "COMPLEX", "reason": "three concerns"}"#);
    h.completion.plan(
        42,
        r#"{"summary": "Parser, writer, command.", "sub_tasks": [
            {"title": "Parser", "description": "p", "depends_on": []},
            {"title": "Writer", "description": "w", "depends_on": []},
            {"title": "Command", "description": "c", "depends_on": [1, 0, 1]}
        ]}"#,
    );

    h.coordinator.run_phase(CyclePhase::Intake).await;

    let subs = h.tracker.sub_issues_of(42);
    assert_eq!(subs.len(), 3);
    assert_eq!(subs[2].blocked_by, vec![subs[0].number, subs[1].number]);
}

#[tokio::test]
async fn test_failed_plan_marks_parent_failed() {
    let h = harness();
    h.tracker.add_issue(42, "CSV export", "", &[]);
    h.completion.classify(42, r#"{"category": "COMPLEX", "reason": "big"}"#);
    h.completion.plan(42, r#"{"summary": "nothing", "sub_tasks": []}"#);

    let report = h.coordinator.run_phase(CyclePhase::Intake).await;

    assert_eq!(report.planned, 0);
    assert_eq!(report.errors.len(), 1);
    assert!(h.tracker.sub_issues_of(42).is_empty());
    assert_eq!(h.tracker.labels(42), vec!["ai-failed"]);
    assert_eq!(
        extract_metadata(&h.tracker.comments(42)[0].body).map(|m| m.kind),
        Some(CommentKind::Failure)
    );
}

#[tokio::test]
async fn test_budget_defers_launches_without_labelling() {
    let h = harness_with(BudgetSection {
        max_concurrent: 1,
        ..BudgetSection::default()
    });
    for n in [1, 2] {
        h.tracker.add_issue(n, &format!("Task {}", n), "", &[]);
        h.completion.classify(n, &simple("small"));
    }

    let report = h.coordinator.run_phase(CyclePhase::Intake).await;

    assert_eq!(report.launched, 1);
    assert_eq!(report.deferred, 1);
    assert!(report.budget_exhausted);
    assert!(h.tracker.has_label(1, Label::InProgress));
    // Still a candidate for the next tick.
    assert!(h.tracker.labels(2).is_empty());
}

#[tokio::test]
async fn test_launch_failure_fails_issue() {
    let h = harness();
    h.tracker.add_issue(9, "Bump deps", "", &[]);
    h.completion.classify(9, &simple("mechanical"));
    h.grid.fail_launches(true);

    let report = h.coordinator.run_phase(CyclePhase::Intake).await;

    assert_eq!(report.launched, 0);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("#9"));
    assert_eq!(h.tracker.labels(9), vec!["ai-failed"]);

    let executions = h
        .db
        .call(|db| db.list_executions(&ExecutionQuery::default()))
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
    assert!(executions[0].result.as_deref().unwrap().contains("503"));
    assert_eq!(h.db.call(|db| db.count_active()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_nudged_issue_is_handled_first() {
    let h = harness();
    for n in [1, 2, 3] {
        h.tracker.add_issue(n, &format!("Task {}", n), "", &[]);
        h.completion.classify(n, &simple("small"));
    }
    h.db.call(|db| db.create_nudge(REPO, 3, Some("exec-prev"), 5, Some("follow-up")))
        .await
        .unwrap();

    h.coordinator.run_phase(CyclePhase::Intake).await;

    let order: Vec<u64> = h.grid.launches().iter().map(|l| l.issue_number).collect();
    assert_eq!(order, vec![3, 1, 2]);
    let pending = h.db.call(|db| db.pending_nudges(REPO, 10)).await.unwrap();
    assert!(pending.is_empty());
}

#[tokio::test]
async fn test_deferred_nudge_stays_pending() {
    let h = harness_with(BudgetSection {
        max_concurrent: 0,
        ..BudgetSection::default()
    });
    h.tracker.add_issue(3, "Task", "", &[]);
    h.completion.classify(3, &simple("small"));
    h.db.call(|db| db.create_nudge(REPO, 3, None, 0, None))
        .await
        .unwrap();

    let report = h.coordinator.run_phase(CyclePhase::Intake).await;

    assert_eq!(report.deferred, 1);
    let pending = h.db.call(|db| db.pending_nudges(REPO, 10)).await.unwrap();
    assert_eq!(pending.len(), 1);
}
