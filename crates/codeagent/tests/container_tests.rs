//! Container backends against a fake container runtime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use codeagent::config::RuntimeConfig;
use codeagent::{
    BackendKind, BoundaryConfig, CodeBackend, ContainerVariant, DefaultBackendFactory,
    InteractiveContainerBackend, ManagedContainerBackend, SessionError, SessionRegistry,
    SessionState, container_name, legacy_names,
};

mod common;
use common::{Sandbox, config_with_provider, fake_cli_profile};

fn container_factory(sandbox: &Sandbox, interactive: bool) -> Arc<DefaultBackendFactory> {
    let mut config = config_with_provider("x", fake_cli_profile());
    config.runtime.docker_enabled = true;
    config.runtime.interactive_enabled = interactive;
    config.runtime.container_binary = Some(sandbox.fake_docker().display().to_string());
    Arc::new(DefaultBackendFactory::new(Arc::new(config)))
}

#[tokio::test]
async fn test_managed_backend_execs_per_prompt() {
    let sandbox = Sandbox::new();
    let registry = SessionRegistry::new(container_factory(&sandbox, false));
    let workspace = sandbox.workspace("x", 7);

    let backend = registry.get_or_create(&workspace).await.unwrap();
    assert_eq!(backend.kind(), BackendKind::ManagedContainer);

    let reply = backend.prompt("hello").await.unwrap().text().await.unwrap();
    assert_eq!(reply, "exec: --print hello\n");

    let status = backend.status().await;
    assert_eq!(status.state, SessionState::Ready);
    let container = status.container.unwrap();
    assert!(container.starts_with("codeagent-x-o-r-pr-7-"));

    registry.close(&workspace).await.unwrap();
    let calls = sandbox.calls();
    assert!(calls.iter().any(|c| c.starts_with("inspect")));
    assert!(!calls.iter().any(|c| c.starts_with("run")));
    assert!(calls.contains(&format!("rm -f {}", container)));
}

#[tokio::test]
async fn test_managed_auth_failure_surfaces_in_stream() {
    let sandbox = Sandbox::new();
    let registry = SessionRegistry::new(container_factory(&sandbox, false));
    let backend = registry
        .get_or_create(&sandbox.workspace("x", 7))
        .await
        .unwrap();

    let err = backend
        .prompt("please logout")
        .await
        .unwrap()
        .text()
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Auth { .. }), "got {err}");
}

#[tokio::test]
async fn test_factory_selects_interactive_backend() {
    let sandbox = Sandbox::new();
    let registry = SessionRegistry::new(container_factory(&sandbox, true));
    let workspace = sandbox.workspace("x", 7);

    let backend = registry.get_or_create(&workspace).await.unwrap();
    assert_eq!(backend.kind(), BackendKind::InteractiveContainer);

    let status = backend.status().await;
    assert_eq!(status.state, SessionState::Ready);
    assert!(status.container.unwrap().contains("-interactive-"));
    registry.close(&workspace).await.unwrap();
}

async fn start_interactive(sandbox: &Sandbox) -> InteractiveContainerBackend {
    start_interactive_with(sandbox, &RuntimeConfig::default())
        .await
        .unwrap()
}

async fn start_interactive_with(
    sandbox: &Sandbox,
    runtime: &RuntimeConfig,
) -> Result<InteractiveContainerBackend, SessionError> {
    InteractiveContainerBackend::start(
        sandbox.fake_runtime(),
        &sandbox.workspace("x", 7),
        fake_cli_profile(),
        runtime,
        BoundaryConfig::default(),
    )
    .await
}

async fn start_managed(sandbox: &Sandbox, runtime: &RuntimeConfig) -> ManagedContainerBackend {
    ManagedContainerBackend::start(
        sandbox.fake_runtime(),
        &sandbox.workspace("x", 7),
        fake_cli_profile(),
        runtime,
    )
    .await
    .unwrap()
}

fn short_timeouts() -> RuntimeConfig {
    RuntimeConfig {
        prompt_timeout_secs: 1,
        startup_timeout_secs: 1,
        kill_grace_secs: 1,
        ..RuntimeConfig::default()
    }
}

fn exec_attach_count(sandbox: &Sandbox) -> usize {
    sandbox
        .calls()
        .iter()
        .filter(|c| c.starts_with("exec -i"))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interactive_prompts_are_serialized() {
    let sandbox = Sandbox::new();
    let backend = Arc::new(start_interactive(&sandbox).await);
    assert_eq!(backend.state().await, SessionState::Ready);

    let first = backend.prompt("ping").await.unwrap();

    let second = {
        let backend = backend.clone();
        tokio::spawn(async move { backend.prompt("pong").await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!second.is_finished());

    assert_eq!(first.text().await.unwrap(), "reply to ping\nsecond line\n");

    let second = second.await.unwrap().unwrap();
    assert_eq!(second.text().await.unwrap(), "reply to pong\nsecond line\n");

    let session = backend.session().await;
    assert_eq!(session.message_count, 2);
}

#[tokio::test]
async fn test_dropped_response_does_not_leak_into_next_turn() {
    let sandbox = Sandbox::new();
    let backend = start_interactive(&sandbox).await;

    drop(backend.prompt("first").await.unwrap());

    let reply = backend.prompt("second").await.unwrap().text().await.unwrap();
    assert_eq!(reply, "reply to second\nsecond line\n");
}

#[tokio::test]
async fn test_multiline_prompt_is_sent_as_one_line() {
    let sandbox = Sandbox::new();
    let backend = start_interactive(&sandbox).await;

    let reply = backend
        .prompt("fix\nthe tests")
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(reply, "reply to fix the tests\nsecond line\n");
}

#[tokio::test]
async fn test_interactive_close_keeps_container() {
    let sandbox = Sandbox::new();
    let backend = start_interactive(&sandbox).await;

    backend.close().await.unwrap();
    assert_eq!(backend.state().await, SessionState::Closed);
    assert!(matches!(
        backend.prompt("late").await,
        Err(SessionError::Closed)
    ));
    // Closing twice is fine.
    backend.close().await.unwrap();

    let calls = sandbox.calls();
    assert!(calls.iter().any(|c| c.starts_with("exec -i")));
    assert!(!calls.iter().any(|c| c.starts_with("rm")));
}

#[tokio::test]
async fn test_handshake_timeout_fails_start() {
    let sandbox = Sandbox::new();
    sandbox.silence_cli();

    let started = Instant::now();
    let err = start_interactive_with(&sandbox, &short_timeouts())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SessionError::Timeout { .. }), "got {err}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_reattach_after_cli_exit() {
    let sandbox = Sandbox::new();
    let backend = start_interactive(&sandbox).await;

    let err = backend.prompt("exit").await.unwrap().text().await.unwrap_err();
    assert!(matches!(err, SessionError::ProcessExited(_)), "got {err}");

    let reply = backend.prompt("ping").await.unwrap().text().await.unwrap();
    assert_eq!(reply, "reply to ping\nsecond line\n");
    assert_eq!(exec_attach_count(&sandbox), 2);
    assert_eq!(backend.state().await, SessionState::Ready);
}

#[tokio::test]
async fn test_reattach_after_turn_timeout() {
    let sandbox = Sandbox::new();
    let runtime = RuntimeConfig {
        startup_timeout_secs: 10,
        ..short_timeouts()
    };
    let backend = start_interactive_with(&sandbox, &runtime).await.unwrap();

    let err = backend.prompt("hang").await.unwrap().text().await.unwrap_err();
    assert!(matches!(err, SessionError::Timeout { .. }), "got {err}");

    let reply = backend.prompt("ping").await.unwrap().text().await.unwrap();
    assert_eq!(reply, "reply to ping\nsecond line\n");
    assert_eq!(exec_attach_count(&sandbox), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_is_not_blocked_by_abandoned_turn() {
    let sandbox = Sandbox::new();
    let runtime = RuntimeConfig {
        prompt_timeout_secs: 120,
        kill_grace_secs: 1,
        ..RuntimeConfig::default()
    };
    let backend = Arc::new(start_interactive_with(&sandbox, &runtime).await.unwrap());

    // No reply ever comes, so the abandoned turn keeps the output busy.
    drop(backend.prompt("hang").await.unwrap());

    let waiting = {
        let backend = backend.clone();
        tokio::spawn(async move { backend.prompt("next").await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiting.is_finished());

    tokio::time::timeout(Duration::from_secs(5), backend.close())
        .await
        .expect("close waited for the abandoned turn")
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("waiting prompt never finished")
        .unwrap();
    assert!(matches!(result, Err(SessionError::Closed)), "got {result:?}");
    assert_eq!(exec_attach_count(&sandbox), 1);
}

#[tokio::test]
async fn test_create_passes_api_key_outside_argv() {
    let sandbox = Sandbox::new();
    sandbox.use_container_table();

    let backend = start_managed(&sandbox, &RuntimeConfig::default()).await;
    let workspace = sandbox.workspace("x", 7);
    let current = container_name("x", &workspace, ContainerVariant::Managed);
    assert_eq!(backend.container(), current);
    assert!(sandbox.has_container(&current));

    let calls = sandbox.calls();
    let run = calls.iter().find(|c| c.starts_with("run ")).unwrap();
    assert!(run.contains("-e FAKE_KEY "), "run line: {run}");
    assert!(!run.contains("FAKE_KEY="), "run line: {run}");
    assert!(calls.contains(&"run-env FAKE_KEY=k".to_string()));
}

#[tokio::test]
async fn test_legacy_container_is_reused() {
    let sandbox = Sandbox::new();
    let workspace = sandbox.workspace("x", 7);
    let legacy = legacy_names("x", &workspace, ContainerVariant::Managed)
        .into_iter()
        .next()
        .unwrap();
    sandbox.add_container(&legacy, "running null");

    let backend = start_managed(&sandbox, &RuntimeConfig::default()).await;
    assert_eq!(backend.container(), legacy);

    let calls = sandbox.calls();
    assert!(calls.iter().any(|c| c.starts_with("inspect") && c.ends_with(&legacy)));
    assert!(!calls.iter().any(|c| c.starts_with("run ")));
}

#[tokio::test]
async fn test_container_of_another_session_is_not_reused() {
    let sandbox = Sandbox::new();
    let workspace = sandbox.workspace("x", 7);
    let legacy = legacy_names("x", &workspace, ContainerVariant::Managed)
        .into_iter()
        .next()
        .unwrap();
    sandbox.add_container(&legacy, r#"running {"codeagent.session":"y/o/r#pr-7"}"#);

    let backend = start_managed(&sandbox, &RuntimeConfig::default()).await;
    let current = container_name("x", &workspace, ContainerVariant::Managed);
    assert_eq!(backend.container(), current);
    assert!(sandbox.calls().iter().any(|c| c.starts_with("run ")));
}

#[tokio::test]
async fn test_stopped_container_is_started() {
    let sandbox = Sandbox::new();
    let workspace = sandbox.workspace("x", 7);
    let current = container_name("x", &workspace, ContainerVariant::Managed);
    sandbox.add_container(&current, r#"exited {"codeagent.session":"x/o/r#pr-7"}"#);

    let backend = start_managed(&sandbox, &RuntimeConfig::default()).await;
    assert_eq!(backend.container(), current);

    let calls = sandbox.calls();
    assert!(calls.contains(&format!("start {current}")));
    assert!(!calls.iter().any(|c| c.starts_with("run ")));
}

#[tokio::test]
async fn test_name_conflict_is_retried_once() {
    let sandbox = Sandbox::new();
    sandbox.use_container_table();
    sandbox.fail_next_run();

    let backend = start_managed(&sandbox, &RuntimeConfig::default()).await;
    let current = container_name("x", &sandbox.workspace("x", 7), ContainerVariant::Managed);
    assert_eq!(backend.container(), current);

    let calls = sandbox.calls();
    assert_eq!(calls.iter().filter(|c| c.starts_with("run ")).count(), 1);
    let inspects = calls
        .iter()
        .filter(|c| c.starts_with("inspect") && c.ends_with(&current))
        .count();
    assert_eq!(inspects, 2);
}

#[tokio::test]
async fn test_managed_prompt_timeout() {
    let sandbox = Sandbox::new();
    let backend = start_managed(&sandbox, &short_timeouts()).await;

    let started = Instant::now();
    let err = backend
        .prompt("be slow")
        .await
        .unwrap()
        .text()
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Timeout { .. }), "got {err}");
    assert!(started.elapsed() < Duration::from_secs(4));
}
