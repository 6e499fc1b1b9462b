//! End-to-end scenarios over fake adapters: happy path, policy block,
//! HITL timeout, verifier retry, L4 deviation stop, planner auto-adopt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use deskpilot::adapters::{FakeOsAdapter, FakeWebEngine, SchemaElement};
use deskpilot::dsl::parse_plan;
use deskpilot::dsl::schema::{Role, StepStatus};
use deskpilot::error::ErrorCode;
use deskpilot::exec::Orchestrator;
use deskpilot::policy::{CheckKind, PolicyConfig};
use deskpilot::services::Services;
use deskpilot::store::{ApprovalStatus, DeviationKind, RunState};
use deskpilot::verifier::VerifierConfig;

fn fast_verifier() -> VerifierConfig {
    VerifierConfig {
        poll_interval: Duration::from_millis(5),
        retry_pause: Duration::from_millis(5),
        retry_extension: 1.5,
    }
}

fn services_with(
    policy: PolicyConfig,
    os: Arc<FakeOsAdapter>,
    web: Option<Arc<FakeWebEngine>>,
) -> Arc<Services> {
    let mut builder = Services::builder()
        .policy(policy)
        .os_adapter(os)
        .verifier(fast_verifier());
    if let Some(web) = web {
        builder = builder.web_engine(web);
    }
    builder.build()
}

#[tokio::test]
async fn s1_weekly_report_happy_path() {
    let os = Arc::new(FakeOsAdapter::new());
    for i in 0..10 {
        os.add_pdf(&format!("./sample_data/report_{i}.pdf"), 1);
    }
    let services = services_with(PolicyConfig::default(), Arc::clone(&os), None);
    let orchestrator = Orchestrator::new(services);

    let plan = parse_plan(
        r#"
dsl_version: "1.1"
name: weekly-report
variables:
  inbox: ./sample_data
steps:
  - find_files: {query: "*.pdf", roots: ["{{inbox}}"], limit: 10}
  - pdf_merge: {inputs: "{{steps[0].paths}}", out: ./sample_data/merged.pdf}
  - assert_pdf_pages: {path: "{{steps[1].path}}", expected_pages: 10}
  - compose_mail: {to: ["a@b"], subject: Weekly, body: "numbers attached"}
  - save_draft: {}
"#,
    )
    .unwrap();

    let run_id = orchestrator
        .submit(plan, HashMap::new(), true, false)
        .await
        .unwrap();
    orchestrator.drain().await;

    let run = orchestrator
        .services()
        .store
        .get_run(run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.state, RunState::Completed, "error: {:?}", run.error);
    assert_eq!(
        run.step_results[2].as_ref().unwrap().status,
        StepStatus::Pass
    );
    assert_eq!(
        run.step_results[1].as_ref().unwrap().output["page_count"],
        serde_json::json!(10)
    );

    let drafts = os.drafts();
    assert_eq!(drafts.len(), 1);
    assert!(drafts[0].saved);

    let snapshot = orchestrator.services().metrics.snapshot();
    assert_eq!(snapshot.last_24h.total_runs, 1);
    assert!((snapshot.last_24h.success_rate - 1.0).abs() < 1e-9);
    assert!((snapshot.last_24h.verifier_pass_rate - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn s2_policy_block_on_domain() {
    let os = Arc::new(FakeOsAdapter::new());
    let web = Arc::new(FakeWebEngine::new());
    let policy = PolicyConfig {
        allow_domains: vec!["partner.example.com".into()],
        ..PolicyConfig::default()
    };
    let services = services_with(policy, os, Some(web));
    let orchestrator = Orchestrator::new(services);

    let plan = parse_plan(
        r#"
dsl_version: "1.1"
name: exfil
steps:
  - open_browser: {url: "https://evil.example.com/upload"}
"#,
    )
    .unwrap();

    let run_id = orchestrator
        .submit(plan, HashMap::new(), true, false)
        .await
        .unwrap();
    orchestrator.drain().await;

    let run = orchestrator
        .services()
        .store
        .get_run(run_id)
        .await
        .unwrap()
        .unwrap();
    // QUEUED -> FAILED; the run never entered RUNNING.
    assert_eq!(run.state, RunState::Failed);
    assert!(run.started_at.is_none());
    assert_eq!(run.error.as_ref().unwrap().code, ErrorCode::PolicyBlocked);

    let decisions = orchestrator
        .services()
        .store
        .policy_decisions(run_id)
        .await
        .unwrap();
    assert_eq!(decisions.len(), 1);
    let domain_check = decisions[0]
        .checks
        .iter()
        .find(|c| c.kind == CheckKind::Domain)
        .unwrap();
    assert!(!domain_check.allowed);

    let snapshot = orchestrator.services().metrics.snapshot();
    assert_eq!(snapshot.last_24h.policy_blocks, 1);
}

fn hitl_plan() -> deskpilot::Plan {
    parse_plan(
        r#"
dsl_version: "1.1"
name: deploy
steps:
  - log: {message: preparing}
  - human_confirm:
      message: "Deploy?"
      timeout_minutes: 1
      auto_action: deny
      required_role: Editor
  - log: {message: deployed}
"#,
    )
    .unwrap()
}

#[tokio::test]
async fn s3_hitl_timeout_denies() {
    let services = services_with(PolicyConfig::default(), Arc::new(FakeOsAdapter::new()), None);
    let orchestrator = Orchestrator::new(services);

    let run_id = orchestrator
        .submit(hitl_plan(), HashMap::new(), true, false)
        .await
        .unwrap();
    orchestrator.drain().await;

    assert_eq!(
        orchestrator.run_state(run_id).await.unwrap(),
        RunState::WaitingApproval
    );
    // A checkpoint was written before suspending.
    let checkpoint = orchestrator
        .services()
        .checkpoints
        .load(run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.next_step_index, 1);

    // The clock runs out with no decision.
    orchestrator.expire_approval(run_id).await.unwrap();
    orchestrator.drain().await;

    let run = orchestrator
        .services()
        .store
        .get_run(run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.error.as_ref().unwrap().code, ErrorCode::ApprovalTimeout);
    // The step after the confirmation never executed.
    assert!(run.step_results.get(2).map(Option::is_none).unwrap_or(true));

    let approvals = orchestrator.services().store.approvals(run_id).await.unwrap();
    assert_eq!(approvals[0].status, ApprovalStatus::TimedOut);
}

#[tokio::test]
async fn s3b_hitl_approval_with_role_check() {
    let services = services_with(PolicyConfig::default(), Arc::new(FakeOsAdapter::new()), None);
    let orchestrator = Orchestrator::new(services);

    let run_id = orchestrator
        .submit(hitl_plan(), HashMap::new(), true, false)
        .await
        .unwrap();
    orchestrator.drain().await;
    assert_eq!(
        orchestrator.run_state(run_id).await.unwrap(),
        RunState::WaitingApproval
    );

    // A Viewer cannot satisfy a required Editor role.
    assert!(orchestrator
        .resolve_approval(run_id, true, Some(Role::Viewer))
        .await
        .is_err());

    orchestrator
        .resolve_approval(run_id, true, Some(Role::Editor))
        .await
        .unwrap();
    orchestrator.drain().await;

    let run = orchestrator
        .services()
        .store
        .get_run(run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.state, RunState::Completed, "error: {:?}", run.error);
    assert_eq!(
        run.step_results[2].as_ref().unwrap().output["message"],
        serde_json::json!("deployed")
    );
}

#[tokio::test]
async fn s4_verifier_retry_counts_as_pass() {
    let os = Arc::new(FakeOsAdapter::new());
    let web = Arc::new(FakeWebEngine::new());
    // The element appears only on the second observation: the bounded
    // first attempt misses it, the extended auto-retry finds it.
    web.add_deferred_element(SchemaElement::button("送信"), 2);

    let services = services_with(PolicyConfig::default(), os, Some(web));
    let orchestrator = Orchestrator::new(services);

    let plan = parse_plan(
        r#"
dsl_version: "1.1"
name: submit-form
steps:
  - open_browser: {url: "https://portal.example.com/form"}
  - wait_for_element: {text: "送信", timeout_ms: 0}
"#,
    )
    .unwrap();

    let run_id = orchestrator
        .submit(plan, HashMap::new(), true, false)
        .await
        .unwrap();
    orchestrator.drain().await;

    let run = orchestrator
        .services()
        .store
        .get_run(run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.state, RunState::Completed, "error: {:?}", run.error);
    assert_eq!(
        run.step_results[1].as_ref().unwrap().status,
        StepStatus::Retry
    );

    let snapshot = orchestrator.services().metrics.snapshot();
    assert!((snapshot.last_24h.verifier_pass_rate - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn s5_l4_deviation_stop_and_resume() {
    let os = Arc::new(FakeOsAdapter::new());
    let web = Arc::new(FakeWebEngine::new());
    // Fields addressable only through their placeholders: each fill
    // needs the label fallback, and each fallback is an unexpected-UI
    // deviation worth 2 points.
    web.add_element(SchemaElement {
        role: "textbox".into(),
        placeholder: Some("申請者メール".into()),
        ..Default::default()
    });
    web.add_element(SchemaElement {
        role: "textbox".into(),
        placeholder: Some("合計金額".into()),
        ..Default::default()
    });

    let policy = PolicyConfig {
        autopilot: true,
        ..PolicyConfig::default()
    };
    let services = services_with(policy, os, Some(web));
    let orchestrator = Orchestrator::new(services);

    let plan = parse_plan(
        r#"
dsl_version: "1.1"
name: expense-form
steps:
  - open_browser: {url: "https://forms.example.com/expense"}
  - fill_by_label: {label: "申請者メール", text: "a@b"}
  - fill_by_label: {label: "合計金額", text: "1200"}
  - log: {message: done}
"#,
    )
    .unwrap();

    let run_id = orchestrator
        .submit(plan, HashMap::new(), true, false)
        .await
        .unwrap();
    orchestrator.drain().await;

    // Score 2 after step 1, 4 after step 2: threshold 3 crossed, the
    // run pauses before the final step.
    let run = orchestrator
        .services()
        .store
        .get_run(run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.state, RunState::Paused);
    assert!(run.step_results.get(3).map(Option::is_none).unwrap_or(true));

    let deviations = orchestrator.services().store.deviations(run_id).await.unwrap();
    assert_eq!(deviations.len(), 2);
    assert!(deviations
        .iter()
        .all(|d| d.kind == DeviationKind::UnexpectedElement));

    let snapshot = orchestrator.services().metrics.snapshot();
    assert_eq!(snapshot.last_24h.deviation_stops, 1);
    assert_eq!(snapshot.last_24h.l4_autoruns, 1);

    // Human resume continues from the checkpoint and completes.
    orchestrator.resume(run_id).unwrap();
    orchestrator.drain().await;
    assert_eq!(
        orchestrator.run_state(run_id).await.unwrap(),
        RunState::Completed
    );
}

#[tokio::test]
async fn s6_planner_auto_adopts_replace_text() {
    let os = Arc::new(FakeOsAdapter::new());
    let web = Arc::new(FakeWebEngine::new());
    web.add_element(SchemaElement::button("確定"));

    let policy = PolicyConfig {
        autopilot: true,
        ..PolicyConfig::default()
    };
    let services = services_with(policy, os, Some(web.clone()));
    let orchestrator = Orchestrator::new(services);

    let plan = parse_plan(
        r#"
dsl_version: "1.1"
name: submit-form
steps:
  - open_browser: {url: "https://portal.example.com/form"}
  - click_by_text: {text: "送信", role: button}
"#,
    )
    .unwrap();

    let run_id = orchestrator
        .submit(plan, HashMap::new(), true, false)
        .await
        .unwrap();
    orchestrator.drain().await;

    let run = orchestrator
        .services()
        .store
        .get_run(run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.state, RunState::Completed, "error: {:?}", run.error);
    // The click landed on the synonym the patch substituted.
    assert_eq!(web.clicks(), vec!["確定".to_string()]);

    let snapshot = orchestrator.services().metrics.snapshot();
    assert_eq!(snapshot.last_24h.patches_proposed, 1);
    assert_eq!(snapshot.last_24h.patches_auto_adopted, 1);
}

#[tokio::test]
async fn s6b_patch_requires_confirmation_outside_autopilot() {
    let os = Arc::new(FakeOsAdapter::new());
    let web = Arc::new(FakeWebEngine::new());
    web.add_element(SchemaElement::button("確定"));

    let services = services_with(PolicyConfig::default(), os, Some(web.clone()));
    let orchestrator = Orchestrator::new(services);

    let plan = parse_plan(
        r#"
dsl_version: "1.1"
name: submit-form
steps:
  - open_browser: {url: "https://portal.example.com/form"}
  - click_by_text: {text: "送信", role: button}
"#,
    )
    .unwrap();

    let run_id = orchestrator
        .submit(plan, HashMap::new(), true, false)
        .await
        .unwrap();
    orchestrator.drain().await;

    // The proposal is not auto-adopted; the deterministic synonym
    // recovery still lands the click.
    let run = orchestrator
        .services()
        .store
        .get_run(run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.state, RunState::Completed, "error: {:?}", run.error);
    assert_eq!(web.clicks(), vec!["確定".to_string()]);
    assert!(!run.step_results[1]
        .as_ref()
        .unwrap()
        .recovery_actions
        .is_empty());

    let snapshot = orchestrator.services().metrics.snapshot();
    assert_eq!(snapshot.last_24h.patches_proposed, 1);
    assert_eq!(snapshot.last_24h.patches_auto_adopted, 0);
}
