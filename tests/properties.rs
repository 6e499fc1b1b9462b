//! Cross-module properties: checkpoint reconstruction, secrets masking,
//! queue overflow reporting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use deskpilot::adapters::{FakeOsAdapter, FakeWebEngine, OsAdapter, SchemaElement};
use deskpilot::dsl::parse_plan;
use deskpilot::error::ErrorCode;
use deskpilot::exec::Orchestrator;
use deskpilot::policy::PolicyConfig;
use deskpilot::secrets::{InMemoryBackend, SecretsResolver, MASK};
use deskpilot::services::Services;
use deskpilot::store::RunState;
use deskpilot::verifier::VerifierConfig;

fn fast_verifier() -> VerifierConfig {
    VerifierConfig {
        poll_interval: Duration::from_millis(5),
        retry_pause: Duration::from_millis(5),
        retry_extension: 1.5,
    }
}

#[tokio::test]
async fn resume_reconstructs_prior_step_outputs() {
    let os = Arc::new(FakeOsAdapter::new());
    for i in 0..3 {
        os.add_pdf(&format!("./inbox/doc_{i}.pdf"), 1);
    }
    let services = Services::builder()
        .policy(PolicyConfig::default())
        .os_adapter(os)
        .verifier(fast_verifier())
        .build();
    let orchestrator = Orchestrator::new(services);

    // The merge after the approval consumes the pre-suspension find
    // output; a correct checkpoint round-trips it.
    let plan = parse_plan(
        r#"
dsl_version: "1.1"
name: merge-after-approval
steps:
  - find_files: {query: "*.pdf", roots: ["./inbox"], limit: 10}
  - human_confirm: {message: "Merge these?", timeout_minutes: 5, auto_action: deny}
  - pdf_merge: {inputs: "{{steps[0].paths}}", out: ./inbox/merged.pdf}
  - assert_pdf_pages: {path: "{{steps[2].path}}", expected_pages: 3}
"#,
    )
    .unwrap();

    let run_id = orchestrator
        .submit(plan, HashMap::new(), true, false)
        .await
        .unwrap();
    orchestrator.drain().await;
    assert_eq!(
        orchestrator.run_state(run_id).await.unwrap(),
        RunState::WaitingApproval
    );

    orchestrator
        .resolve_approval(run_id, true, None)
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
        run.step_results[2].as_ref().unwrap().output["page_count"],
        serde_json::json!(3)
    );
    // The checkpoint is invalidated on completion.
    assert!(orchestrator
        .services()
        .checkpoints
        .load(run_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn secrets_never_reach_persisted_records() {
    let os = Arc::new(FakeOsAdapter::new());
    let web = Arc::new(FakeWebEngine::new());
    web.add_element(SchemaElement::textbox("パスワード"));

    let backend = Arc::new(InMemoryBackend::new());
    backend.insert(Some("portal"), "password", "hunter2-secret-value");

    let services = Services::builder()
        .policy(PolicyConfig::default())
        .os_adapter(os)
        .web_engine(web.clone())
        .secrets(Arc::new(SecretsResolver::new(vec![
            backend as Arc<dyn deskpilot::secrets::SecretBackend>,
        ])))
        .verifier(fast_verifier())
        .build();
    let orchestrator = Orchestrator::new(services);

    let plan = parse_plan(
        r#"
dsl_version: "1.1"
name: login
steps:
  - open_browser: {url: "https://portal.example.com/login"}
  - fill_by_label: {label: "パスワード", text: "{{secrets://portal/password}}"}
  - log: {message: "sent {{secrets://portal/password}}"}
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

    // The engine received the real value...
    assert_eq!(
        web.fills(),
        vec![("パスワード".to_string(), "hunter2-secret-value".to_string())]
    );
    // ...but nothing persisted contains it.
    let persisted = serde_json::to_string(&run).unwrap();
    assert!(!persisted.contains("hunter2-secret-value"));
    assert!(persisted.contains(MASK));
}

#[tokio::test]
async fn queue_overflow_reports_queue_full() {
    let mut orchestrator_config = deskpilot::config::OrchestratorConfig::default();
    orchestrator_config
        .queues
        .get_mut("default")
        .unwrap()
        .max_queued = 1;

    let services = Services::builder()
        .policy(PolicyConfig::default())
        .os_adapter(Arc::new(FakeOsAdapter::new()))
        .orchestrator(orchestrator_config)
        .build();
    let orchestrator = Orchestrator::new(services);

    let plan = parse_plan(
        "dsl_version: \"1.1\"\nname: tiny\nsteps:\n  - log: {message: hi}\n",
    )
    .unwrap();

    orchestrator
        .submit(plan.clone(), HashMap::new(), true, false)
        .await
        .unwrap();
    let err = orchestrator
        .submit(plan, HashMap::new(), true, false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::QueueFull);
}

#[tokio::test]
async fn dry_run_touches_nothing() {
    let os = Arc::new(FakeOsAdapter::new());
    os.add_pdf("./inbox/a.pdf", 2);
    let services = Services::builder()
        .policy(PolicyConfig::default())
        .os_adapter(Arc::clone(&os) as Arc<dyn OsAdapter>)
        .verifier(fast_verifier())
        .build();
    let orchestrator = Orchestrator::new(services);

    let plan = parse_plan(
        r#"
dsl_version: "1.1"
name: dry
steps:
  - find_files: {query: "*.pdf", roots: ["./inbox"], limit: 10}
  - compose_mail: {to: ["a@b"], subject: s, body: b}
  - save_draft: {}
"#,
    )
    .unwrap();

    let run_id = orchestrator
        .submit(plan, HashMap::new(), true, true)
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
        run.step_results[1].as_ref().unwrap().output["would_compose"],
        serde_json::json!(true)
    );
    assert!(os.drafts().is_empty());
}
