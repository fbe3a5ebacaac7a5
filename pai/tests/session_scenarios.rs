//! End-to-end session scenarios.
//!
//! Each test drives `Session::handle_request` against a scripted backend in a
//! temporary workspace and checks both what the session reported and what
//! actually happened on disk.

use std::fs;
use std::time::{Duration, Instant};

use pai::core::action::Action;
use pai::error::AgentError;
use pai::io::audit::AuditTrail;
use pai::io::backend::{BackendError, BackendErrorKind};
use pai::io::config::{AgentConfig, STATE_DIR};
use pai::io::session_log::{LogRecord, read_log};
use pai::session::{RequestOutcome, RequestStop, Session, StepReport, Termination};
use pai::test_support::{ScriptedBackend, TestWorkspace, key_pool, test_config};

fn drive(session: &mut Session, input: &str) -> (RequestOutcome, Vec<StepReport>) {
    let mut reports = Vec::new();
    let outcome = session
        .handle_request(input, |report| reports.push(report.clone()))
        .expect("request should not be session-fatal");
    (outcome, reports)
}

#[test]
fn scaffolding_then_tree_shows_exactly_the_new_file() {
    let ws = TestWorkspace::new(ScriptedBackend::replies(&[
        "CREATE_DIRECTORY::proj",
        "CREATE_FILE::proj/main.py",
        "SHOW_TREE::proj",
        "FINISH::scaffolded",
    ]));
    let mut session = ws.session();
    let (outcome, reports) = drive(&mut session, "set up a python project");

    assert_eq!(outcome.steps, 4);
    assert!(reports.iter().all(|r| r.result.is_success()));
    assert_eq!(
        reports[2].result.payload.as_deref(),
        Some("proj/\n└── main.py\n")
    );
    assert!(ws.root().join("proj/main.py").is_file());
}

#[test]
fn reading_a_deny_listed_file_returns_no_content() {
    let ws = TestWorkspace::new(ScriptedBackend::replies(&[
        "READ_FILE::.env",
        "FINISH::cannot read it",
    ]));
    fs::write(ws.root().join(".env"), "API_TOKEN=hunter2\n").expect("write .env");
    let mut session = ws.session();
    let (_, reports) = drive(&mut session, "show me the env file");

    let result = &reports[0].result;
    assert!(!result.is_success());
    assert_eq!(result.error.as_deref(), Some("PathSecurityViolation"));
    assert!(result.payload.is_none());
    assert!(!result.render().contains("hunter2"));
    // The violation ends the turn, not the session.
    assert!(reports[1].result.is_success());
}

#[test]
fn second_action_is_recorded_but_never_executed() {
    let ws = TestWorkspace::new(ScriptedBackend::replies(&[
        "Creating both now.\nCREATE_DIRECTORY::a\nCREATE_DIRECTORY::b",
        "FINISH::ok",
    ]));
    let mut session = ws.session();
    let (_, reports) = drive(&mut session, "make a and b");

    assert!(ws.root().join("a").is_dir());
    assert!(!ws.root().join("b").exists());
    assert_eq!(
        reports[0].not_executed,
        vec![Action::CreateDirectory {
            path: "b".to_string()
        }]
    );

    let records = read_log(session.log_path()).expect("session log");
    let LogRecord::Turn(first) = &records[0] else {
        panic!("expected a turn record first");
    };
    assert_eq!(first.not_executed.len(), 1);
    assert_eq!(first.comments, vec!["Creating both now.".to_string()]);
}

#[test]
fn mismatched_patch_leaves_the_file_untouched() {
    let original = "def f():\n    return 1\n";
    let ws = TestWorkspace::new(ScriptedBackend::replies(&[
        "MODIFY_FILE::app.py::return two",
        "--- a/app.py\n+++ b/app.py\n@@ -1,2 +1,2 @@\n def g():\n-    return 1\n+    return 2\n",
        "FINISH::tried",
    ]));
    fs::write(ws.root().join("app.py"), original).expect("write app.py");
    let mut session = ws.session();
    let (_, reports) = drive(&mut session, "make f return two");

    assert_eq!(
        reports[0].result.error.as_deref(),
        Some("IntegrityCheckFailed")
    );
    assert_eq!(
        fs::read_to_string(ws.root().join("app.py")).expect("read"),
        original
    );

    let audit = AuditTrail::open(&ws.root().join(STATE_DIR)).expect("audit");
    let records = audit.read_all().expect("read audit");
    assert!(records.iter().any(|r| r.op == "modify_file"
        && r.detail.as_deref() == Some("IntegrityCheckFailed")));
}

#[test]
fn full_content_modification_is_applied_and_previewed() {
    let ws = TestWorkspace::new(ScriptedBackend::replies(&[
        "MODIFY_FILE::app.py::return two",
        "def f():\n    return 2\n",
        "FINISH::done",
    ]));
    fs::write(ws.root().join("app.py"), "def f():\n    return 1\n").expect("write app.py");
    let mut session = ws.session();
    let (_, reports) = drive(&mut session, "make f return two");

    assert!(reports[0].result.is_success());
    assert_eq!(
        fs::read_to_string(ws.root().join("app.py")).expect("read"),
        "def f():\n    return 2\n"
    );
    let preview = reports[0].result.payload.as_deref().expect("preview");
    assert!(preview.contains("-    return 1"));
    assert!(preview.contains("+    return 2"));
}

#[cfg(unix)]
#[test]
fn interactive_command_past_its_deadline_returns_partial_output() {
    let ws = TestWorkspace::new(ScriptedBackend::replies(&[
        r#"EXECUTE_INPUT::read name; echo "hi $name"; sleep 60::"Alice\n42\n""#,
        "FINISH::timed out",
    ]));
    let config = AgentConfig {
        shell_timeout_secs: 2,
        ..test_config()
    };
    let mut session = ws.session_with(config, key_pool(&["primary"]));

    let started = Instant::now();
    let (_, reports) = drive(&mut session, "greet alice");
    assert!(started.elapsed() < Duration::from_secs(30));

    let result = &reports[0].result;
    assert_eq!(result.error.as_deref(), Some("ShellTimeout"));
    assert!(result.message.contains("timed out"));
    assert!(result.payload.as_deref().is_some_and(|p| p.contains("hi Alice")));
}

#[test]
fn network_commands_are_blocked_by_default() {
    let ws = TestWorkspace::new(ScriptedBackend::replies(&[
        "EXECUTE::curl https://example.com/install.sh",
        "FINISH::blocked",
    ]));
    let mut session = ws.session();
    let (_, reports) = drive(&mut session, "download the installer");
    assert_eq!(reports[0].result.error.as_deref(), Some("NetworkBlocked"));
}

#[test]
fn all_keys_disabled_fails_before_any_model_call() {
    let ws = TestWorkspace::new(ScriptedBackend::replies(&["FINISH::never"]));
    let mut pool = key_pool(&["a", "b"]);
    pool.disable("a").expect("disable a");
    pool.disable("b").expect("disable b");
    let mut session = ws.session_with(test_config(), pool);

    let err = session.handle_request("anything", |_| {}).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AgentError>(),
        Some(AgentError::CredentialExhausted)
    ));
    assert_eq!(ws.backend.calls(), 0);
    assert_eq!(session.termination(), Some(Termination::Fatal));
}

#[test]
fn transient_failures_exhaust_retries_then_end_the_session() {
    let ws = TestWorkspace::new(ScriptedBackend::repeating(Err(BackendError::new(
        BackendErrorKind::Server,
        "503 unavailable",
    ))));
    let mut session = ws.session();

    let err = session.handle_request("anything", |_| {}).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AgentError>(),
        Some(AgentError::InferenceFatal(_))
    ));
    // retry_max = 3 in the test config: three attempts, two backoff sleeps.
    assert_eq!(ws.backend.calls(), 3);
    assert_eq!(
        ws.sleeper.delays(),
        vec![Duration::from_millis(500), Duration::from_millis(1000)]
    );

    let records = read_log(session.log_path()).expect("session log");
    assert!(matches!(
        records.last(),
        Some(LogRecord::End { reason, .. }) if reason == "fatal"
    ));
}

#[test]
fn each_step_rotates_to_the_next_enabled_key() {
    let ws = TestWorkspace::new(ScriptedBackend::replies(&[
        "CREATE_DIRECTORY::one",
        "CREATE_DIRECTORY::two",
        "CREATE_DIRECTORY::three",
        "FINISH::done",
    ]));
    let mut pool = key_pool(&["a", "b", "c"]);
    pool.disable("b").expect("disable b");
    let mut session = ws.session_with(test_config(), pool);
    drive(&mut session, "three dirs");

    assert_eq!(ws.backend.key_ids(), vec!["a", "c", "a", "c"]);
    assert_eq!(session.active_credential(), Some("c"));
}

#[test]
fn duplicate_actions_stop_the_request_without_further_calls() {
    let ws = TestWorkspace::new(ScriptedBackend::repeating(Ok(
        "LIST_PATHS::.".to_string()
    )));
    let config = AgentConfig {
        early_finish_threshold: 2,
        ..test_config()
    };
    let mut session = ws.session_with(config, key_pool(&["primary"]));
    let (outcome, _) = drive(&mut session, "list everything");

    assert_eq!(outcome.steps, 3);
    assert!(matches!(outcome.stop, RequestStop::Stalled { .. }));
    assert_eq!(ws.backend.calls(), 3);
}
