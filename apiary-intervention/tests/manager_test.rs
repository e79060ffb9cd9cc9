//! Intervention session state machine tests
//!
//! Time is paused; the window and step timers fire on the virtual clock.

#![allow(clippy::unwrap_used)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Value, json};

use apiary_bus::{CommandPayload, InterventionNotifier, OperatorNotice};
use apiary_intervention::{
    BrowserController, CommandExecutor, CommandOutcome, InterventionConfig, InterventionError,
    InterventionManager,
};

#[derive(Default)]
struct MockBrowser {
    interaction: Mutex<Vec<bool>>,
}

#[async_trait]
impl BrowserController for MockBrowser {
    async fn screenshot(&self) -> anyhow::Result<String> {
        Ok("/tmp/shot-1.png".to_string())
    }

    async fn current_url(&self) -> Option<String> {
        Some("https://example.com/checkout".to_string())
    }

    async fn dom_context(&self) -> Value {
        json!({"title": "Checkout"})
    }

    async fn set_operator_interaction(&self, enabled: bool) {
        self.interaction.lock().unwrap().push(enabled);
    }
}

#[derive(Default)]
struct MockExecutor {
    executed: Mutex<Vec<CommandPayload>>,
}

#[async_trait]
impl CommandExecutor for MockExecutor {
    async fn execute(&self, command: CommandPayload) -> anyhow::Result<Value> {
        self.executed.lock().unwrap().push(command);
        Ok(json!({"ok": true}))
    }
}

#[derive(Default)]
struct MockNotifier {
    notices: Mutex<Vec<OperatorNotice>>,
}

#[async_trait]
impl InterventionNotifier for MockNotifier {
    async fn notify(&self, notice: OperatorNotice) -> anyhow::Result<()> {
        self.notices.lock().unwrap().push(notice);
        Ok(())
    }
}

struct Fixture {
    manager: Arc<InterventionManager>,
    browser: Arc<MockBrowser>,
    executor: Arc<MockExecutor>,
    notifier: Arc<MockNotifier>,
}

fn fixture(config: InterventionConfig) -> Fixture {
    let browser = Arc::new(MockBrowser::default());
    let executor = Arc::new(MockExecutor::default());
    let notifier = Arc::new(MockNotifier::default());
    let manager = InterventionManager::new(
        config,
        browser.clone(),
        executor.clone(),
        notifier.clone(),
    );

    Fixture {
        manager,
        browser,
        executor,
        notifier,
    }
}

fn parent(command_id: &str) -> CommandPayload {
    CommandPayload {
        command_id: command_id.to_string(),
        kind: "navigate".to_string(),
        parameters: json!({"url": "https://example.com/checkout"}),
        persona: json!({}),
        session: None,
        timeout_secs: 30,
    }
}

fn step(kind: &str, parent_id: &str, extra: Value) -> CommandPayload {
    let mut parameters = json!({
        "mode": "intervention",
        "parentCommandId": parent_id,
    });
    if let (Some(base), Some(add)) = (parameters.as_object_mut(), extra.as_object()) {
        for (k, v) in add {
            base.insert(k.clone(), v.clone());
        }
    }

    CommandPayload {
        command_id: format!("step-{kind}"),
        kind: kind.to_string(),
        parameters,
        persona: json!({}),
        session: None,
        timeout_secs: 10,
    }
}

#[tokio::test(start_paused = true)]
async fn initiate_is_exclusive() {
    let f = fixture(InterventionConfig::default());

    assert!(f.manager.current().await.is_none());
    assert!(f.manager.initiate("captcha", parent("c1")).await.is_ok());
    assert!(f.manager.current().await.is_some());

    // A second session may not start while the first is active.
    assert!(matches!(
        f.manager.initiate("captcha", parent("c2")).await,
        Err(InterventionError::AlreadyActive)
    ));

    let ctx = f.manager.current().await;
    assert!(ctx.as_ref().is_some_and(|c| c.parent_command_id == "c1"));
    assert!(ctx.as_ref().is_some_and(|c| c.replayable_action.command_id == "c1_replay"));
    assert!(ctx.is_some_and(|c| c.screenshot_path.is_some()));

    // Operator interaction was enabled and a notice went out.
    assert_eq!(*f.browser.interaction.lock().unwrap(), vec![true]);
    assert_eq!(f.notifier.notices.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn whitelist_gates_commands() {
    let f = fixture(InterventionConfig::default());
    f.manager.initiate("captcha", parent("c1")).await.ok();

    // Unsafe script: rejected, no execution, no step recorded.
    let outcome = f
        .manager
        .handle_command(step("ExecuteScript", "c1", json!({"safe": false})))
        .await;
    assert_eq!(
        outcome,
        CommandOutcome::Fail("invalid_in_intervention_mode".to_string())
    );
    assert!(f.executor.executed.lock().unwrap().is_empty());

    // Wrong parent: rejected even for a whitelisted kind.
    let outcome = f
        .manager
        .handle_command(step("Click", "other-command", json!({})))
        .await;
    assert!(matches!(outcome, CommandOutcome::Fail(_)));

    // Missing intervention mode: rejected.
    let mut bare = step("Click", "c1", json!({}));
    bare.parameters = json!({"parentCommandId": "c1"});
    assert!(matches!(
        f.manager.handle_command(bare).await,
        CommandOutcome::Fail(_)
    ));

    // A proper click goes through and is recorded as a step.
    let outcome = f.manager.handle_command(step("Click", "c1", json!({}))).await;
    assert!(matches!(outcome, CommandOutcome::Executed(_)));
    assert_eq!(f.executor.executed.lock().unwrap().len(), 1);

    let ctx = f.manager.current().await;
    assert!(ctx.is_some_and(|c| c.steps.len() == 1 && c.steps[0].command_type == "Click"));
}

#[tokio::test(start_paused = true)]
async fn resume_replays_and_goes_idle() {
    let f = fixture(InterventionConfig::default());
    f.manager.initiate("manual_review", parent("c1")).await.ok();

    let report = f.manager.resume(None).await;
    let report = match report {
        Ok(report) => report,
        Err(e) => panic!("resume failed: {e}"),
    };

    assert!(report.resumed);
    assert_eq!(report.parent_command_id, "c1");
    assert!(f.manager.current().await.is_none());

    // The replayable action ran through the executor.
    let executed = f.executor.executed.lock().unwrap();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].command_id, "c1_replay");
    assert_eq!(executed[0].kind, "navigate");
    drop(executed);

    // Interaction toggled on at start, off at resume.
    assert_eq!(*f.browser.interaction.lock().unwrap(), vec![true, false]);

    // Resuming again has nothing to resume.
    assert!(matches!(
        f.manager.resume(None).await,
        Err(InterventionError::NotActive)
    ));
}

#[tokio::test(start_paused = true)]
async fn resume_with_override_executes_it() {
    let f = fixture(InterventionConfig::default());
    f.manager.initiate("captcha", parent("c1")).await.ok();

    let override_action = CommandPayload {
        command_id: "c1_manual".to_string(),
        kind: "reload".to_string(),
        parameters: json!({}),
        persona: json!({}),
        session: None,
        timeout_secs: 10,
    };
    let options = apiary_intervention::ResumeOptions {
        action_override: Some(override_action),
    };
    assert!(f.manager.resume(Some(options)).await.is_ok());

    let executed = f.executor.executed.lock().unwrap();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].command_id, "c1_manual");
}

#[tokio::test(start_paused = true)]
async fn window_timeout_closes_session() {
    let config = InterventionConfig {
        window_ttl_secs: 60,
        step_ttl_secs: 600,
        ..InterventionConfig::default()
    };
    let f = fixture(config);
    f.manager.initiate("captcha", parent("c1")).await.ok();

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(f.manager.is_active().await);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!f.manager.is_active().await);

    // Interaction was disabled by the timeout path.
    assert_eq!(*f.browser.interaction.lock().unwrap(), vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn step_timeout_closes_quiet_session() {
    let config = InterventionConfig {
        window_ttl_secs: 600,
        step_ttl_secs: 30,
        ..InterventionConfig::default()
    };
    let f = fixture(config);
    f.manager.initiate("captcha", parent("c1")).await.ok();

    // A step inside the window keeps the session alive past the first
    // step deadline.
    tokio::time::sleep(Duration::from_secs(20)).await;
    let outcome = f.manager.handle_command(step("Click", "c1", json!({}))).await;
    assert!(matches!(outcome, CommandOutcome::Executed(_)));

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert!(f.manager.is_active().await);

    // Silence past the step TTL ends it.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!f.manager.is_active().await);
}
