use anyhow::Result;
use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{DispatchKeyEventParams, DispatchKeyEventType};
use chromiumoxide::element::Element;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use nanoid::nanoid;
use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::interpreter::{PageDriver, StepError};
use crate::step::Locator;

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub executable: Option<PathBuf>,
    pub viewport: (u32, u32),
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { headless: true, user_agent: None, executable: None, viewport: (1280, 800) }
    }
}

/// One Chromium process with a single page and its own throwaway profile.
pub struct Browser {
    page: Page,
    browser: OxideBrowser,
    handler: JoinHandle<()>,
    profile_dir: PathBuf,
    viewport: (u32, u32),
}

fn cdp(e: impl Display) -> StepError {
    StepError::Browser(e.to_string())
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &cfg.executable {
            builder = builder.chrome_executable(path);
        }
        // A fresh profile per run keeps sessions isolated and avoids
        // ProcessSingleton lock conflicts between concurrent runs.
        let profile_dir = std::env::temp_dir().join(format!("case-runner-profile-{}", nanoid!(12)));
        tokio::fs::create_dir_all(&profile_dir).await?;
        builder = builder
            .user_data_dir(profile_dir.clone())
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow::anyhow!(e))?;
        let (mut browser, mut handler) = match OxideBrowser::launch(bcfg).await {
            Ok(pair) => pair,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&profile_dir).await;
                return Err(e.into());
            }
        };
        let handler = tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                let _ = browser.close().await;
                handler.abort();
                let _ = tokio::fs::remove_dir_all(&profile_dir).await;
                return Err(e.into());
            }
        };
        let this = Self { page, browser, handler, profile_dir, viewport: cfg.viewport };
        if let Some(ua) = cfg.user_agent {
            if let Err(e) = this.page.set_user_agent(ua).await {
                warn!(error = %e, "failed to set user agent");
            }
        }
        this.reset_viewport().await;
        Ok(this)
    }

    /// Shuts Chromium down and removes the profile directory. Each step is
    /// attempted even if an earlier one fails.
    pub async fn close(mut self) -> Result<()> {
        let closed = self.browser.close().await.map(|_| ());
        if let Err(e) = self.browser.wait().await {
            debug!(error = %e, "waiting for chromium exit failed");
        }
        self.handler.abort();
        if let Err(e) = tokio::fs::remove_dir_all(&self.profile_dir).await {
            debug!(dir = %self.profile_dir.display(), error = %e, "profile cleanup failed");
        }
        closed.map_err(Into::into)
    }

    // Ensure a non-zero viewport to avoid screenshot 0-width errors
    async fn reset_viewport(&self) {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(self.viewport.0 as i64)
            .height(self.viewport.1 as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build();
        match params {
            Ok(p) => {
                if let Err(e) = self.page.execute(p).await {
                    debug!(error = %e, "viewport override failed");
                }
            }
            Err(e) => warn!(error = %e, "invalid viewport override"),
        }
    }

    async fn locate(&self, target: &Locator) -> Result<Element, StepError> {
        let found = match target {
            Locator::XPath { expr } => self.page.find_xpath(expr.as_str()).await,
            Locator::Id { .. } => {
                let css = target.css_selector().unwrap_or_default();
                self.page.find_element(css).await
            }
        };
        found.map_err(|e| StepError::NotFound(format!("{target} ({e})")))
    }

    async fn key_event(&self, kind: DispatchKeyEventType, key: &str) -> Result<(), StepError> {
        let (code, vk, text) = key_definition(key);
        let down = matches!(kind, DispatchKeyEventType::KeyDown);
        let mut b = DispatchKeyEventParams::builder()
            .r#type(kind)
            .key(key)
            .code(code)
            .windows_virtual_key_code(vk)
            .native_virtual_key_code(vk);
        if down {
            if let Some(text) = text {
                b = b.text(text);
            }
        }
        let params = b.build().map_err(cdp)?;
        self.page.execute(params).await.map_err(cdp)?;
        Ok(())
    }
}

/// (code, virtual key code, text) for the keys recorders emit.
fn key_definition(key: &str) -> (String, i64, Option<String>) {
    match key {
        "Enter" => ("Enter".into(), 13, Some("\r".into())),
        "Tab" => ("Tab".into(), 9, None),
        "Escape" => ("Escape".into(), 27, None),
        "Backspace" => ("Backspace".into(), 8, None),
        "ArrowDown" => ("ArrowDown".into(), 40, None),
        "ArrowUp" => ("ArrowUp".into(), 38, None),
        " " => ("Space".into(), 32, Some(" ".into())),
        k if k.chars().count() == 1 => {
            let c = k.chars().next().unwrap_or_default();
            let code = if c.is_ascii_alphabetic() {
                format!("Key{}", c.to_ascii_uppercase())
            } else if c.is_ascii_digit() {
                format!("Digit{c}")
            } else {
                String::new()
            };
            (code, c.to_ascii_uppercase() as i64, Some(k.to_string()))
        }
        other => (other.to_string(), 0, None),
    }
}

const FILL_JS: &str = r#"function(v) {
    this.focus();
    if (this.isContentEditable) {
        this.textContent = v;
    } else {
        const desc = Object.getOwnPropertyDescriptor(Object.getPrototypeOf(this), 'value');
        if (desc && desc.set) { desc.set.call(this, v); } else { this.value = v; }
    }
    this.dispatchEvent(new Event('input', { bubbles: true }));
    this.dispatchEvent(new Event('change', { bubbles: true }));
}"#;

const VISIBLE_JS: &str = r#"function() {
    const style = window.getComputedStyle(this);
    if (style.visibility === 'hidden' || style.display === 'none') return false;
    const rect = this.getBoundingClientRect();
    return rect.width > 0 && rect.height > 0;
}"#;

/// Covers a teardown that was abandoned part way (close timeout, panic).
/// chromiumoxide kills the child process on its own drop.
impl Drop for Browser {
    fn drop(&mut self) {
        self.handler.abort();
        if self.profile_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.profile_dir) {
                debug!(dir = %self.profile_dir.display(), error = %e, "profile cleanup on drop failed");
            }
        }
    }
}

#[async_trait]
impl PageDriver for Browser {
    async fn goto(&self, url: &str) -> Result<(), StepError> {
        self.page.goto(url).await.map_err(cdp)?;
        self.page.wait_for_navigation().await.map_err(cdp)?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, StepError> {
        Ok(self.page.url().await.map_err(cdp)?.unwrap_or_default())
    }

    async fn body_text(&self) -> Result<String, StepError> {
        self.page
            .evaluate("document.body ? document.body.innerText : ''")
            .await
            .map_err(cdp)?
            .into_value::<String>()
            .map_err(cdp)
    }

    async fn scroll_into_view(&self, target: &Locator) -> Result<(), StepError> {
        self.locate(target).await?.scroll_into_view().await.map_err(cdp)?;
        Ok(())
    }

    async fn click(&self, target: &Locator) -> Result<(), StepError> {
        self.locate(target).await?.click().await.map_err(cdp)?;
        Ok(())
    }

    async fn fill(&self, target: &Locator, value: &str) -> Result<(), StepError> {
        let el = self.locate(target).await?;
        // call_js_fn takes no arguments, so the value is inlined as a JSON literal.
        let literal = serde_json::to_string(value).map_err(cdp)?;
        let js = format!("function() {{ return ({FILL_JS}).call(this, {literal}); }}");
        el.call_js_fn(js, false).await.map_err(cdp)?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), StepError> {
        self.key_event(DispatchKeyEventType::KeyDown, key).await?;
        self.key_event(DispatchKeyEventType::KeyUp, key).await
    }

    async fn is_visible(&self, target: &Locator) -> Result<bool, StepError> {
        let el = match self.locate(target).await {
            Ok(el) => el,
            Err(StepError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let ret = el.call_js_fn(VISIBLE_JS, false).await.map_err(cdp)?;
        Ok(ret.result.value.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, StepError> {
        let take = || async {
            self.page
                .screenshot(ScreenshotParamsBuilder::default().full_page(true).build())
                .await
        };
        match take().await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("0 width") || msg.contains("0 height") {
                    // Force viewport and retry once
                    self.reset_viewport().await;
                    sleep(Duration::from_millis(50)).await;
                    return take().await.map_err(cdp);
                }
                Err(cdp(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_sends_carriage_return() {
        let (code, vk, text) = key_definition("Enter");
        assert_eq!(code, "Enter");
        assert_eq!(vk, 13);
        assert_eq!(text.as_deref(), Some("\r"));
    }

    #[test]
    fn printable_keys_type_themselves() {
        let (code, vk, text) = key_definition("a");
        assert_eq!(code, "KeyA");
        assert_eq!(vk, 'A' as i64);
        assert_eq!(text.as_deref(), Some("a"));
        assert_eq!(key_definition("7").0, "Digit7");
    }
}
