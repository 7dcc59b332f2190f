use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use nanoid::nanoid;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactStore;
use crate::browser::{Browser, BrowserConfig};
use crate::interpreter::{Interpreter, PageDriver};
use crate::report::{RunReporter, RunResult, RunStatus};
use crate::step::Step;

// ========================= Pluggable Sessions =========================

/// An isolated browser page owned by exactly one run.
#[async_trait]
pub trait PageSession: Send + Sync {
    fn driver(&self) -> &dyn PageDriver;
    async fn shutdown(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self, headless: bool) -> Result<Box<dyn PageSession>>;
}

#[async_trait]
impl PageSession for Browser {
    fn driver(&self) -> &dyn PageDriver {
        self
    }

    async fn shutdown(self: Box<Self>) -> Result<()> {
        (*self).close().await
    }
}

/// Launches a fresh Chromium per run.
pub struct ChromiumLauncher {
    base: BrowserConfig,
}

impl ChromiumLauncher {
    pub fn new(base: BrowserConfig) -> Self {
        Self { base }
    }
}

#[async_trait]
impl SessionLauncher for ChromiumLauncher {
    async fn launch(&self, headless: bool) -> Result<Box<dyn PageSession>> {
        let cfg = BrowserConfig { headless, ..self.base.clone() };
        Ok(Box::new(Browser::launch(cfg).await?))
    }
}

// ========================= Lifecycle =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Launching,
    Running,
    Closing,
}

impl SessionPhase {
    /// Legal moves: Idle -> Launching -> Running -> Closing -> Idle, plus
    /// Launching -> Idle when the launch itself fails.
    pub fn can_advance_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (Idle, Launching) | (Launching, Running) | (Launching, Idle) | (Running, Closing) | (Closing, Idle)
        )
    }
}

struct Lifecycle<'a> {
    run_id: &'a str,
    phase: SessionPhase,
}

impl<'a> Lifecycle<'a> {
    fn new(run_id: &'a str) -> Self {
        Self { run_id, phase: SessionPhase::Idle }
    }

    fn advance(&mut self, next: SessionPhase) {
        debug_assert!(self.phase.can_advance_to(next), "{:?} -> {:?}", self.phase, next);
        debug!(run_id = self.run_id, from = ?self.phase, to = ?next, "session phase");
        self.phase = next;
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("failed to close browser: {0}")]
    Teardown(String),
    #[error("run aborted: {0}")]
    Aborted(String),
}

/// Owns everything needed to turn a manifest into a [`RunResult`].
#[derive(Clone)]
pub struct Executor {
    launcher: Arc<dyn SessionLauncher>,
    interpreter: Arc<Interpreter>,
    run_timeout: Duration,
    close_timeout: Duration,
    artifacts: Option<Arc<dyn ArtifactStore>>,
}

impl Executor {
    pub fn new(launcher: Arc<dyn SessionLauncher>, interpreter: Interpreter, run_timeout: Duration) -> Self {
        Self {
            launcher,
            interpreter: Arc::new(interpreter),
            run_timeout,
            close_timeout: Duration::from_secs(10),
            artifacts: None,
        }
    }

    pub fn with_artifacts(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn with_close_timeout(mut self, limit: Duration) -> Self {
        self.close_timeout = limit;
        self
    }

    /// Runs on a separate task: if the caller goes away mid-run the task still
    /// finishes and closes its session.
    pub async fn execute(&self, steps: Vec<Step>, headless: bool) -> Result<RunResult, SessionError> {
        let this = self.clone();
        tokio::spawn(async move { this.execute_inline(&steps, headless).await })
            .await
            .map_err(|e| SessionError::Aborted(e.to_string()))?
    }

    pub async fn execute_inline(&self, steps: &[Step], headless: bool) -> Result<RunResult, SessionError> {
        let run_id = nanoid!();
        let started = Instant::now();
        let mut lifecycle = Lifecycle::new(&run_id);
        info!(run_id = %run_id, steps = steps.len(), headless, "run requested");

        lifecycle.advance(SessionPhase::Launching);
        let session = match self.launcher.launch(headless).await {
            Ok(session) => session,
            Err(e) => {
                lifecycle.advance(SessionPhase::Idle);
                warn!(run_id = %run_id, error = %e, "browser launch failed");
                return Err(SessionError::Launch(e.to_string()));
            }
        };

        lifecycle.advance(SessionPhase::Running);
        let reporter = RunReporter::new();
        let run = self.interpreter.run_with(&run_id, steps, session.driver(), reporter.clone());
        let outcome = tokio::time::timeout(self.run_timeout, AssertUnwindSafe(run).catch_unwind()).await;

        lifecycle.advance(SessionPhase::Closing);
        let teardown = self.close(&run_id, session).await;
        lifecycle.advance(SessionPhase::Idle);

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let reason = panic_message(panic.as_ref());
                warn!(run_id = %run_id, reason = %reason, "run panicked");
                return Err(SessionError::Aborted(reason));
            }
            Err(_) => {
                let message = format!("run timed out after {} ms", self.run_timeout.as_millis());
                warn!(run_id = %run_id, completed_logs = reporter.log_count(), "{}", message);
                reporter.log(message.clone());
                reporter.into_result(
                    &run_id,
                    RunStatus::Failed,
                    Some(message),
                    None,
                    started.elapsed().as_millis() as u64,
                )
            }
        };

        if let Some(store) = &self.artifacts {
            if let Err(e) = store.save(&result).await {
                warn!(run_id = %run_id, error = %e, "failed to persist artifacts");
            }
        }
        teardown?;
        info!(run_id = %run_id, status = ?result.status, duration_ms = result.duration_ms, "run finished");
        Ok(result)
    }

    /// Shuts the session down within the close timeout. A session that
    /// overruns is dropped, which releases whatever it still holds.
    async fn close(&self, run_id: &str, session: Box<dyn PageSession>) -> Result<(), SessionError> {
        let err = match tokio::time::timeout(self.close_timeout, session.shutdown()).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {} ms", self.close_timeout.as_millis()),
        };
        warn!(run_id, error = %err, "session teardown failed");
        Err(SessionError::Teardown(err))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("run panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("run panicked: {s}")
    } else {
        "run panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::SessionPhase::*;

    #[test]
    fn lifecycle_moves_in_one_direction() {
        assert!(Idle.can_advance_to(Launching));
        assert!(Launching.can_advance_to(Running));
        assert!(Running.can_advance_to(Closing));
        assert!(Closing.can_advance_to(Idle));
        assert!(Launching.can_advance_to(Idle));
        assert!(!Running.can_advance_to(Idle));
        assert!(!Idle.can_advance_to(Running));
        assert!(!Closing.can_advance_to(Running));
    }
}
