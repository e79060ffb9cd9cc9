//! The intervention state machine
//!
//! `Idle → Active` on `initiate`, back to `Idle` via `resume`, the window
//! timer or the step timer. A single mutex over the active session
//! serialises every transition; command execution and replay happen
//! outside it so a slow browser cannot wedge the timers.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::{task::JoinHandle, time::Instant};

use apiary_bus::{CommandPayload, InterventionNotifier, OperatorNotice};
use apiary_common::params;
use apiary_metrics::InterventionMetrics;

use crate::{
    context::{InterventionContext, InterventionStep},
    traits::{BrowserController, CommandExecutor},
    whitelist,
};

/// Rejection reason returned for commands that may not run mid-session
pub const INVALID_IN_INTERVENTION_MODE: &str = "invalid_in_intervention_mode";

/// Intervention configuration
#[derive(Debug, Clone, Deserialize)]
pub struct InterventionConfig {
    /// Capture a screenshot when a session starts
    #[serde(default = "default_attach_screenshot")]
    pub attach_screenshot: bool,

    /// Whole-session time limit
    #[serde(default = "default_window_ttl_secs")]
    pub window_ttl_secs: u64,

    /// Limit on silence between operator steps
    #[serde(default = "default_step_ttl_secs")]
    pub step_ttl_secs: u64,
}

impl Default for InterventionConfig {
    fn default() -> Self {
        Self {
            attach_screenshot: default_attach_screenshot(),
            window_ttl_secs: default_window_ttl_secs(),
            step_ttl_secs: default_step_ttl_secs(),
        }
    }
}

const fn default_attach_screenshot() -> bool {
    true
}

const fn default_window_ttl_secs() -> u64 {
    120
}

const fn default_step_ttl_secs() -> u64 {
    30
}

/// Errors from session transitions
#[derive(Debug, Error)]
pub enum InterventionError {
    /// `initiate` while a session is active
    #[error("An intervention is already active")]
    AlreadyActive,

    /// `resume` with no session to resume
    #[error("No intervention is active")]
    NotActive,
}

/// Outcome of an operator command offered to the session
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// The command was whitelisted and executed
    Executed(Value),
    /// The command was rejected or its execution failed
    Fail(String),
}

/// Options for `resume`
#[derive(Debug, Default)]
pub struct ResumeOptions {
    /// Execute this instead of the stored replayable action
    pub action_override: Option<CommandPayload>,
}

/// What `resume` reports back to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeReport {
    pub resumed: bool,
    pub parent_command_id: String,
    pub duration: Duration,
}

struct ActiveSession {
    ctx: InterventionContext,
    window_timer: JoinHandle<()>,
    step_timer: JoinHandle<()>,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.window_timer.abort();
        self.step_timer.abort();
    }
}

/// Manager for the single allowed intervention session
pub struct InterventionManager {
    config: InterventionConfig,
    controller: Arc<dyn BrowserController>,
    executor: Arc<dyn CommandExecutor>,
    notifier: Arc<dyn InterventionNotifier>,
    active: tokio::sync::Mutex<Option<ActiveSession>>,
    metrics: Option<Arc<InterventionMetrics>>,
}

impl InterventionManager {
    #[must_use]
    pub fn new(
        config: InterventionConfig,
        controller: Arc<dyn BrowserController>,
        executor: Arc<dyn CommandExecutor>,
        notifier: Arc<dyn InterventionNotifier>,
    ) -> Arc<Self> {
        let metrics = match InterventionMetrics::new() {
            Ok(metrics) => Some(Arc::new(metrics)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to initialize intervention metrics");
                None
            }
        };

        Arc::new(Self {
            config,
            controller,
            executor,
            notifier,
            active: tokio::sync::Mutex::new(None),
            metrics,
        })
    }

    /// Start a session for `parent`, pausing its drone under operator
    /// control
    ///
    /// # Errors
    ///
    /// Returns an error if a session is already active.
    pub async fn initiate(
        self: &Arc<Self>,
        reason: &str,
        parent: CommandPayload,
    ) -> Result<(), InterventionError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(InterventionError::AlreadyActive);
        }

        let mut ctx = InterventionContext::new(reason.to_string(), parent);

        if self.config.attach_screenshot {
            match self.controller.screenshot().await {
                Ok(path) => ctx.screenshot_path = Some(path),
                Err(e) => {
                    tracing::warn!(command_id = %ctx.command_id, error = %e, "Screenshot failed")
                }
            }
        }
        ctx.url = self.controller.current_url().await;
        ctx.dom_context = self.controller.dom_context().await;

        self.controller.set_operator_interaction(true).await;

        tracing::info!(
            command_id = %ctx.command_id,
            reason,
            "Intervention session started"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_started(reason);
        }

        let notice = OperatorNotice {
            command_id: ctx.command_id.clone(),
            drone_id: None,
            kind: "RequireIntervention".to_string(),
            reason: reason.to_string(),
            requested_at_utc: Utc::now(),
            metadata: json!({
                "url": ctx.url,
                "screenshotPath": ctx.screenshot_path,
            }),
        };
        if let Err(e) = self.notifier.notify(notice).await {
            tracing::warn!(command_id = %ctx.command_id, error = %e, "Operator notify failed");
        }

        let window_timer = self.spawn_window_timer(ctx.command_id.clone());
        let step_timer = self.spawn_step_timer(ctx.command_id.clone());

        *active = Some(ActiveSession {
            ctx,
            window_timer,
            step_timer,
        });
        Ok(())
    }

    /// Offer an operator command to the active session
    ///
    /// The command must carry `parameters.mode == "intervention"`, name the
    /// session's parent command, and be whitelisted. Accepted commands are
    /// recorded as steps and reset the step timer.
    pub async fn handle_command(self: &Arc<Self>, command: CommandPayload) -> CommandOutcome {
        {
            let mut active = self.active.lock().await;
            let Some(session) = active.as_mut() else {
                return CommandOutcome::Fail(INVALID_IN_INTERVENTION_MODE.to_string());
            };

            let mode_ok = params::str_ci(&command.parameters, "mode")
                .is_some_and(|mode| mode.eq_ignore_ascii_case("intervention"));
            let parent_ok = params::str_ci(&command.parameters, "parentCommandId")
                == Some(session.ctx.parent_command_id.as_str());

            if !mode_ok || !parent_ok || !whitelist::allows(&command.kind, &command.parameters) {
                tracing::debug!(
                    command_id = %command.command_id,
                    kind = %command.kind,
                    "Rejected intervention command"
                );
                return CommandOutcome::Fail(INVALID_IN_INTERVENTION_MODE.to_string());
            }

            let now = Instant::now();
            session.ctx.steps.push(InterventionStep {
                command_type: command.kind.clone(),
                timestamp: now,
                command: command.clone(),
            });
            session.ctx.last_step_time = now;
            session.step_timer.abort();
            session.step_timer = self.spawn_step_timer(session.ctx.command_id.clone());
        }

        // Execute outside the session lock; the browser can be slow and
        // the timers must stay live.
        match self.executor.execute(command).await {
            Ok(result) => CommandOutcome::Executed(result),
            Err(e) => CommandOutcome::Fail(e.to_string()),
        }
    }

    /// End the session and hand the browser back to automation
    ///
    /// Executes `options.action_override`, or the stored replayable
    /// action; a replay failure is logged but does not block the resume.
    ///
    /// # Errors
    ///
    /// Returns an error if no session is active.
    pub async fn resume(
        &self,
        options: Option<ResumeOptions>,
    ) -> Result<ResumeReport, InterventionError> {
        let session = {
            let mut active = self.active.lock().await;
            active.take().ok_or(InterventionError::NotActive)?
        };

        self.controller.set_operator_interaction(false).await;

        let action = options
            .and_then(|o| o.action_override)
            .unwrap_or_else(|| session.ctx.replayable_action.clone());
        let action_id = action.command_id.clone();
        if let Err(e) = self.executor.execute(action).await {
            tracing::warn!(
                command_id = %session.ctx.command_id,
                replay_id = %action_id,
                error = %e,
                "Replay failed after resume"
            );
        }

        let duration = session.ctx.start_time.elapsed();
        #[allow(clippy::cast_precision_loss)]
        if let Some(metrics) = &self.metrics {
            metrics.record_window(duration.as_millis() as f64);
        }

        tracing::info!(
            command_id = %session.ctx.command_id,
            steps = session.ctx.steps.len(),
            duration_ms = duration.as_millis(),
            "Intervention resumed"
        );

        Ok(ResumeReport {
            resumed: true,
            parent_command_id: session.ctx.parent_command_id.clone(),
            duration,
        })
    }

    /// Snapshot of the active session, `None` when idle
    pub async fn current(&self) -> Option<InterventionContext> {
        self.active.lock().await.as_ref().map(|s| s.ctx.clone())
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    fn spawn_window_timer(self: &Arc<Self>, session_id: String) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let ttl = Duration::from_secs(self.config.window_ttl_secs);

        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(manager) = manager.upgrade() {
                manager.window_timeout(&session_id).await;
            }
        })
    }

    fn spawn_step_timer(self: &Arc<Self>, session_id: String) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let ttl = Duration::from_secs(self.config.step_ttl_secs);

        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(manager) = manager.upgrade() {
                manager.step_timeout(&session_id, ttl).await;
            }
        })
    }

    async fn window_timeout(&self, session_id: &str) {
        let session = {
            let mut active = self.active.lock().await;
            if !active
                .as_ref()
                .is_some_and(|session| session.ctx.command_id == session_id)
            {
                return;
            }
            active.take()
        };
        let Some(session) = session else { return };

        tracing::warn!(
            command_id = %session.ctx.command_id,
            "Intervention window expired"
        );
        self.controller.set_operator_interaction(false).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_timeout();
        }
    }

    async fn step_timeout(&self, session_id: &str, ttl: Duration) {
        let session = {
            let mut active = self.active.lock().await;
            if !active.as_ref().is_some_and(|session| {
                session.ctx.command_id == session_id
                    && session.ctx.last_step_time.elapsed() >= ttl
            }) {
                return;
            }
            active.take()
        };
        let Some(session) = session else { return };

        tracing::warn!(
            command_id = %session.ctx.command_id,
            "Intervention step timer expired"
        );
        self.controller.set_operator_interaction(false).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_step_timeout();
        }
    }
}
