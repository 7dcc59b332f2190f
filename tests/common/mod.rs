#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use case_runner::interpreter::{PageDriver, StepError};
use case_runner::session::{PageSession, SessionLauncher};
use case_runner::step::Locator;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// In-memory page whose behaviour is scripted per test.
#[derive(Default)]
pub struct ScriptedPage {
    url: Mutex<String>,
    text: Mutex<String>,
    visible: Mutex<HashSet<String>>,
    missing: HashSet<String>,
    hangs: HashSet<&'static str>,
    navigations: HashMap<String, String>,
    slow_navigations: HashMap<String, (String, Duration)>,
    pending_url: Mutex<Option<(String, Instant)>>,
    panics: HashSet<&'static str>,
    text_after_probes: Option<(usize, String)>,
    text_probes: AtomicUsize,
    goto_fails: bool,
    screenshots_fail: bool,
    calls: Mutex<Vec<String>>,
}

impl ScriptedPage {
    pub fn new() -> Self {
        Self { url: Mutex::new("about:blank".into()), ..Default::default() }
    }

    pub fn with_text(self, text: &str) -> Self {
        *self.text.lock().unwrap() = text.to_string();
        self
    }

    pub fn with_visible(self, locator: &str) -> Self {
        self.visible.lock().unwrap().insert(locator.to_string());
        self
    }

    pub fn with_missing(mut self, locator: &str) -> Self {
        self.missing.insert(locator.to_string());
        self
    }

    /// Operation never completes (`click`, `fill`, `press_key`, `goto`, ...).
    pub fn with_hang(mut self, op: &'static str) -> Self {
        self.hangs.insert(op);
        self
    }

    /// Clicking `locator` moves the page to `url`.
    pub fn with_navigation(mut self, locator: &str, url: &str) -> Self {
        self.navigations.insert(locator.to_string(), url.to_string());
        self
    }

    /// Clicking `locator` moves the page to `url` only after `delay`.
    pub fn with_slow_navigation(mut self, locator: &str, url: &str, delay: Duration) -> Self {
        self.slow_navigations.insert(locator.to_string(), (url.to_string(), delay));
        self
    }

    /// Operation panics instead of returning.
    pub fn with_panic(mut self, op: &'static str) -> Self {
        self.panics.insert(op);
        self
    }

    /// Body text changes to `text` once it has been read `probes` times.
    pub fn with_text_after(mut self, probes: usize, text: &str) -> Self {
        self.text_after_probes = Some((probes, text.to_string()));
        self
    }

    pub fn with_failing_goto(mut self) -> Self {
        self.goto_fails = true;
        self
    }

    pub fn with_failing_screenshots(mut self) -> Self {
        self.screenshots_fail = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    async fn gate(&self, op: &'static str) {
        if self.panics.contains(op) {
            panic!("{op} blew up");
        }
        if self.hangs.contains(op) {
            futures::future::pending::<()>().await;
        }
    }

    fn present(&self, target: &Locator) -> Result<(), StepError> {
        let key = target.to_string();
        if self.missing.contains(&key) {
            return Err(StepError::NotFound(key));
        }
        Ok(())
    }
}

#[async_trait]
impl PageDriver for ScriptedPage {
    async fn goto(&self, url: &str) -> Result<(), StepError> {
        self.gate("goto").await;
        self.record(format!("goto {url}"));
        if self.goto_fails {
            return Err(StepError::Browser("net::ERR_NAME_NOT_RESOLVED".into()));
        }
        *self.url.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn current_url(&self) -> Result<String, StepError> {
        let mut pending = self.pending_url.lock().unwrap();
        if let Some((url, at)) = pending.take() {
            if Instant::now() >= at {
                *self.url.lock().unwrap() = url;
            } else {
                *pending = Some((url, at));
            }
        }
        Ok(self.url.lock().unwrap().clone())
    }

    async fn body_text(&self) -> Result<String, StepError> {
        self.gate("body_text").await;
        let n = self.text_probes.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, text)) = &self.text_after_probes {
            if n >= *after {
                return Ok(text.clone());
            }
        }
        Ok(self.text.lock().unwrap().clone())
    }

    async fn scroll_into_view(&self, target: &Locator) -> Result<(), StepError> {
        self.gate("scroll_into_view").await;
        self.present(target)
    }

    async fn click(&self, target: &Locator) -> Result<(), StepError> {
        self.gate("click").await;
        self.present(target)?;
        self.record(format!("click {target}"));
        if let Some(url) = self.navigations.get(&target.to_string()) {
            *self.url.lock().unwrap() = url.clone();
        }
        if let Some((url, delay)) = self.slow_navigations.get(&target.to_string()) {
            *self.pending_url.lock().unwrap() = Some((url.clone(), Instant::now() + *delay));
        }
        Ok(())
    }

    async fn fill(&self, target: &Locator, value: &str) -> Result<(), StepError> {
        self.gate("fill").await;
        self.present(target)?;
        self.record(format!("fill {target}={value}"));
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), StepError> {
        self.gate("press_key").await;
        self.record(format!("key {key}"));
        Ok(())
    }

    async fn is_visible(&self, target: &Locator) -> Result<bool, StepError> {
        Ok(self.visible.lock().unwrap().contains(&target.to_string()))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, StepError> {
        self.gate("screenshot").await;
        if self.screenshots_fail {
            return Err(StepError::Browser("screenshot unavailable".into()));
        }
        Ok(vec![0x89, b'P', b'N', b'G'])
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Shutdown {
    #[default]
    Clean,
    Fails,
    Hangs,
}

pub struct ScriptedSession {
    page: ScriptedPage,
    shutdowns: Arc<AtomicUsize>,
    shutdown: Shutdown,
}

#[async_trait]
impl PageSession for ScriptedSession {
    fn driver(&self) -> &dyn PageDriver {
        &self.page
    }

    async fn shutdown(self: Box<Self>) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        match self.shutdown {
            Shutdown::Clean => Ok(()),
            Shutdown::Fails => bail!("chromium did not exit"),
            Shutdown::Hangs => futures::future::pending().await,
        }
    }
}

/// Hands out a fresh scripted page per launch and counts lifecycle calls.
pub struct ScriptedLauncher {
    make: Box<dyn Fn() -> ScriptedPage + Send + Sync>,
    pub launches: Arc<AtomicUsize>,
    pub shutdowns: Arc<AtomicUsize>,
    pub headless_flags: Mutex<Vec<bool>>,
    fail_launch: bool,
    shutdown: Shutdown,
}

impl ScriptedLauncher {
    pub fn new(make: impl Fn() -> ScriptedPage + Send + Sync + 'static) -> Self {
        Self {
            make: Box::new(make),
            launches: Arc::new(AtomicUsize::new(0)),
            shutdowns: Arc::new(AtomicUsize::new(0)),
            headless_flags: Mutex::new(Vec::new()),
            fail_launch: false,
            shutdown: Shutdown::Clean,
        }
    }

    pub fn failing() -> Self {
        Self { fail_launch: true, ..Self::new(ScriptedPage::new) }
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }
}

#[async_trait]
impl SessionLauncher for ScriptedLauncher {
    async fn launch(&self, headless: bool) -> Result<Box<dyn PageSession>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.headless_flags.lock().unwrap().push(headless);
        if self.fail_launch {
            bail!("chromium executable not found");
        }
        Ok(Box::new(ScriptedSession { page: (self.make)(), shutdowns: self.shutdowns.clone(), shutdown: self.shutdown }))
    }
}
