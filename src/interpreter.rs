use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::report::{RunResult, RunReporter, RunStatus, ShotStatus};
use crate::step::{Action, Locator, Step};

// ========================= Errors =========================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("element not found: {0}")]
    NotFound(String),
    #[error("{op} timed out after {ms} ms")]
    Timeout { op: &'static str, ms: u128 },
    #[error("{0}")]
    Assertion(String),
    #[error("browser error: {0}")]
    Browser(String),
}

// ========================= Page Driver =========================

/// A live page the interpreter drives. Implementations do not need to bound
/// their own calls; every call is wrapped in a timeout by the interpreter.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), StepError>;
    async fn current_url(&self) -> Result<String, StepError>;
    async fn body_text(&self) -> Result<String, StepError>;
    async fn scroll_into_view(&self, target: &Locator) -> Result<(), StepError>;
    async fn click(&self, target: &Locator) -> Result<(), StepError>;
    /// Replaces the field's value.
    async fn fill(&self, target: &Locator, value: &str) -> Result<(), StepError>;
    /// Dispatches to whatever currently has focus.
    async fn press_key(&self, key: &str) -> Result<(), StepError>;
    async fn is_visible(&self, target: &Locator) -> Result<bool, StepError>;
    async fn screenshot(&self) -> Result<Vec<u8>, StepError>;
}

/// Bounds `fut` by `limit`, mapping expiry to [`StepError::Timeout`].
pub async fn with_timeout<T, F>(op: &'static str, limit: Duration, fut: F) -> Result<T, StepError>
where
    F: Future<Output = Result<T, StepError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(StepError::Timeout { op, ms: limit.as_millis() }),
    }
}

/// Re-runs `probe` until it reports true or `window` elapses. Probe errors are
/// treated as "not yet"; the last one is returned if the window closes.
pub async fn poll_until<F, Fut>(window: Duration, interval: Duration, mut probe: F) -> Result<bool, StepError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, StepError>>,
{
    let deadline = Instant::now() + window;
    let mut last_err = None;
    loop {
        match probe().await {
            Ok(true) => return Ok(true),
            Ok(false) => last_err = None,
            Err(e) => last_err = Some(e),
        }
        let now = Instant::now();
        if now >= deadline {
            return match last_err {
                Some(e) => Err(e),
                None => Ok(false),
            };
        }
        sleep(interval.min(deadline - now)).await;
    }
}

// ========================= Interpreter =========================

#[derive(Clone, Debug)]
pub struct InterpreterConfig {
    pub action_timeout: Duration,
    pub navigation_timeout: Duration,
    pub screenshot_timeout: Duration,
    /// Extra window a failing non-final assertion gets to become true.
    pub assertion_wait: Duration,
    pub poll_interval: Duration,
    pub failure_keywords: Vec<String>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_millis(500),
            navigation_timeout: Duration::from_secs(10),
            screenshot_timeout: Duration::from_secs(5),
            assertion_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            failure_keywords: default_failure_keywords(),
        }
    }
}

pub fn default_failure_keywords() -> Vec<String> {
    ["error", "failed", "invalid", "incorrect", "not found", "lỗi", "không hợp lệ", "thất bại"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Ephemeral state for one run.
struct RunContext {
    reporter: RunReporter,
    /// First non-final assertion that had to fall back to waiting.
    assertion_failure: Option<String>,
    note: Option<String>,
}

pub struct Interpreter {
    cfg: InterpreterConfig,
}

impl Interpreter {
    pub fn new(cfg: InterpreterConfig) -> Self {
        Self { cfg }
    }

    /// Replays `steps` in order against `page`. Step failures come back as a
    /// failed [`RunResult`], never as an error.
    pub async fn run(&self, run_id: &str, steps: &[Step], page: &dyn PageDriver) -> RunResult {
        self.run_with(run_id, steps, page, RunReporter::new()).await
    }

    /// Like [`Interpreter::run`], recording into `reporter` as it goes so a
    /// caller holding a clone sees partial evidence if the run is dropped.
    pub async fn run_with(
        &self,
        run_id: &str,
        steps: &[Step],
        page: &dyn PageDriver,
        reporter: RunReporter,
    ) -> RunResult {
        let start = Instant::now();
        let Some(last) = steps.len().checked_sub(1) else {
            return RunResult::failed(run_id, "no steps to run");
        };
        let mut ctx = RunContext {
            reporter,
            assertion_failure: None,
            note: None,
        };

        if let Some(url) = steps[0].url.as_deref() {
            self.navigate(page, url, &ctx.reporter).await;
        }

        for (i, step) in steps.iter().enumerate() {
            let kind = step.kind();
            info!(run_id, step = i, kind = %kind, "executing step");

            match self.execute(page, &step.action).await {
                Ok(detail) => {
                    ctx.reporter.log(format!("Step {} ({}) passed: {}", i + 1, kind, detail));
                    self.capture(page, &ctx.reporter, i, ShotStatus::Success).await;
                }
                Err(err) if step.action.is_assertion() && i == last => {
                    let note = format!(
                        "Final step assertion mismatch ignored: Step {} ({}): {}",
                        i + 1,
                        kind,
                        err
                    );
                    warn!(run_id, step = i, kind = %kind, error = %err, "final assertion mismatch ignored");
                    ctx.reporter.log(format!("Step {} ({}) warning: {}", i + 1, kind, note));
                    self.capture(page, &ctx.reporter, i, ShotStatus::Warning).await;
                    ctx.note = Some(note);
                }
                Err(err) if step.action.is_assertion() => {
                    let first = format!("Step {} ({}) failed: {}", i + 1, kind, err);
                    ctx.assertion_failure.get_or_insert(first);
                    debug!(run_id, step = i, error = %err, "assertion not met yet, waiting");
                    match self.wait_for_assertion(page, &step.action).await {
                        Ok(detail) => {
                            ctx.assertion_failure = None;
                            ctx.reporter.log(format!(
                                "Step {} ({}) passed after waiting: {}",
                                i + 1,
                                kind,
                                detail
                            ));
                            self.capture(page, &ctx.reporter, i, ShotStatus::Success).await;
                        }
                        Err(err) => {
                            let first = ctx
                                .assertion_failure
                                .take()
                                .unwrap_or_else(|| format!("Step {} ({}) failed: {}", i + 1, kind, err));
                            let message = format!(
                                "{} (still failing after waiting {} ms)",
                                first,
                                self.cfg.assertion_wait.as_millis()
                            );
                            return self.fail(run_id, page, ctx, i, message, start).await;
                        }
                    }
                }
                Err(err) => {
                    let mut message = format!("Step {} ({}) failed: {}", i + 1, kind, err);
                    if let Some(hint) = self.failure_hint(page).await {
                        message.push_str(&format!(" (page shows: \"{hint}\")"));
                    }
                    return self.fail(run_id, page, ctx, i, message, start).await;
                }
            }
        }

        info!(run_id, steps = steps.len(), lenient = ctx.note.is_some(), "run succeeded");
        ctx.reporter.into_result(
            run_id,
            RunStatus::Success,
            None,
            ctx.note,
            start.elapsed().as_millis() as u64,
        )
    }

    async fn fail(
        &self,
        run_id: &str,
        page: &dyn PageDriver,
        ctx: RunContext,
        step: usize,
        message: String,
        start: Instant,
    ) -> RunResult {
        warn!(run_id, step, "{}", message);
        ctx.reporter.log(message.clone());
        self.capture(page, &ctx.reporter, step, ShotStatus::Failed).await;
        ctx.reporter.into_result(
            run_id,
            RunStatus::Failed,
            Some(message),
            None,
            start.elapsed().as_millis() as u64,
        )
    }

    async fn navigate(&self, page: &dyn PageDriver, url: &str, reporter: &RunReporter) {
        match with_timeout("navigation", self.cfg.navigation_timeout, page.goto(url)).await {
            Ok(()) => info!(url, "navigated"),
            Err(err) => {
                // The first step fails on its own if the page really is missing.
                warn!(url, error = %err, "navigation failed, continuing");
                reporter.log(format!("Navigation to {url} failed: {err}; continuing"));
            }
        }
    }

    async fn execute(&self, page: &dyn PageDriver, action: &Action) -> Result<String, StepError> {
        let t = self.cfg.action_timeout;
        match action {
            Action::Click { target } => {
                with_timeout("scroll into view", t, page.scroll_into_view(target)).await?;
                with_timeout("click", t, page.click(target)).await?;
                Ok(format!("clicked {target}"))
            }
            Action::Input { target, value } => {
                with_timeout("scroll into view", t, page.scroll_into_view(target)).await?;
                with_timeout("fill", t, page.fill(target, value)).await?;
                Ok(format!("filled {target} with \"{value}\""))
            }
            Action::Keydown { key } => {
                with_timeout("keydown", t, page.press_key(key)).await?;
                Ok(format!("pressed {key}"))
            }
            Action::Scroll => Ok("scroll recorded, nothing to replay".to_string()),
            Action::AssertUrl { .. } | Action::AssertText { .. } | Action::AssertVisible { .. } => {
                self.await_assertion(page, action, t).await
            }
        }
    }

    async fn wait_for_assertion(&self, page: &dyn PageDriver, action: &Action) -> Result<String, StepError> {
        self.await_assertion(page, action, self.cfg.assertion_wait).await
    }

    /// Polls the assertion for up to `window`; the page may still be settling
    /// from the previous action.
    async fn await_assertion(
        &self,
        page: &dyn PageDriver,
        action: &Action,
        window: Duration,
    ) -> Result<String, StepError> {
        let held = poll_until(window, self.cfg.poll_interval, move || self.assertion_holds(page, action)).await?;
        if held {
            Ok(describe_assertion(action))
        } else {
            Err(self.mismatch(page, action).await)
        }
    }

    /// One bounded probe of an assertion.
    async fn assertion_holds(&self, page: &dyn PageDriver, action: &Action) -> Result<bool, StepError> {
        let t = self.cfg.action_timeout;
        match action {
            Action::AssertUrl { expected } => {
                let url = with_timeout("url check", t, page.current_url()).await?;
                Ok(url.contains(expected.as_str()))
            }
            Action::AssertText { expected } => {
                let text = with_timeout("text check", t, page.body_text()).await?;
                Ok(text.contains(expected.as_str()))
            }
            Action::AssertVisible { target } => with_timeout("visibility check", t, page.is_visible(target)).await,
            other => Err(StepError::Browser(format!("{} is not an assertion", other.kind()))),
        }
    }

    /// Best effort: never errors, bounded by the action timeout.
    async fn failure_hint(&self, page: &dyn PageDriver) -> Option<String> {
        if self.cfg.failure_keywords.is_empty() {
            return None;
        }
        match with_timeout("page text", self.cfg.action_timeout, page.body_text()).await {
            Ok(text) => {
                let text = text.to_lowercase();
                self.cfg
                    .failure_keywords
                    .iter()
                    .find(|k| !k.is_empty() && text.contains(&k.to_lowercase()))
                    .cloned()
            }
            Err(err) => {
                debug!(error = %err, "failure hint unavailable");
                None
            }
        }
    }

    /// Builds the mismatch error, quoting the current URL for URL assertions.
    async fn mismatch(&self, page: &dyn PageDriver, action: &Action) -> StepError {
        match action {
            Action::AssertUrl { expected } => {
                let current = with_timeout("url check", self.cfg.action_timeout, page.current_url())
                    .await
                    .unwrap_or_else(|_| "<unknown>".to_string());
                StepError::Assertion(format!("URL \"{current}\" does not contain \"{expected}\""))
            }
            Action::AssertText { expected } => {
                StepError::Assertion(format!("page text does not contain \"{expected}\""))
            }
            Action::AssertVisible { target } => StepError::Assertion(format!("{target} is not visible")),
            other => StepError::Assertion(format!("{} assertion failed", other.kind())),
        }
    }

    async fn capture(&self, page: &dyn PageDriver, reporter: &RunReporter, step: usize, status: ShotStatus) {
        match with_timeout("screenshot", self.cfg.screenshot_timeout, page.screenshot()).await {
            Ok(png) => reporter.screenshot(step, status, png),
            Err(err) => warn!(step, status = status.as_str(), error = %err, "screenshot failed"),
        }
    }
}

fn describe_assertion(action: &Action) -> String {
    match action {
        Action::AssertUrl { expected } => format!("URL contains \"{expected}\""),
        Action::AssertText { expected } => format!("page text contains \"{expected}\""),
        Action::AssertVisible { target } => format!("{target} is visible"),
        other => other.kind().to_string(),
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new(InterpreterConfig::default())
    }
}
