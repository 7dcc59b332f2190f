use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::browser::BrowserConfig;
use crate::interpreter::{default_failure_keywords, InterpreterConfig};

/// Startup configuration, built once and handed to the server.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub addr: SocketAddr,
    pub interpreter: InterpreterConfig,
    pub browser: BrowserConfig,
    pub run_timeout: Duration,
    pub close_timeout: Duration,
    pub proxy_timeout: Duration,
    pub artifacts_dir: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            interpreter: InterpreterConfig::default(),
            browser: BrowserConfig::default(),
            run_timeout: Duration::from_secs(120),
            close_timeout: Duration::from_secs(10),
            proxy_timeout: Duration::from_secs(30),
            artifacts_dir: None,
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RunnerConfig::from_env`] but reads through `get`; empty values count as unset.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let ms = |key: &str, default: Duration| -> Result<Duration> {
            match get(key) {
                Some(v) => Ok(Duration::from_millis(
                    v.parse::<u64>().with_context(|| format!("{key} must be milliseconds, got {v:?}"))?,
                )),
                None => Ok(default),
            }
        };

        let mut cfg = Self::default();
        if let Some(addr) = get("RUNNER_ADDR") {
            cfg.addr = addr.parse().with_context(|| format!("invalid RUNNER_ADDR {addr:?}"))?;
        }
        let it = &mut cfg.interpreter;
        it.action_timeout = ms("RUNNER_ACTION_TIMEOUT_MS", it.action_timeout)?;
        it.navigation_timeout = ms("RUNNER_NAV_TIMEOUT_MS", it.navigation_timeout)?;
        it.screenshot_timeout = ms("RUNNER_SCREENSHOT_TIMEOUT_MS", it.screenshot_timeout)?;
        it.assertion_wait = ms("RUNNER_ASSERT_WAIT_MS", it.assertion_wait)?;
        it.failure_keywords = match get("RUNNER_FAILURE_KEYWORDS") {
            Some(list) => list
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
            None => default_failure_keywords(),
        };
        cfg.run_timeout = ms("RUNNER_RUN_TIMEOUT_MS", cfg.run_timeout)?;
        cfg.close_timeout = ms("RUNNER_CLOSE_TIMEOUT_MS", cfg.close_timeout)?;
        cfg.proxy_timeout = ms("RUNNER_PROXY_TIMEOUT_MS", cfg.proxy_timeout)?;
        cfg.artifacts_dir = get("RUNNER_ARTIFACTS_DIR").map(PathBuf::from);
        cfg.browser.user_agent = get("RUNNER_USER_AGENT");
        cfg.browser.executable = get("RUNNER_CHROME_PATH").map(PathBuf::from);
        Ok(cfg)
    }
}
