use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize, Serializer};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

/// Outcome class a screenshot is tagged with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShotStatus {
    Success,
    Warning,
    Failed,
}

impl ShotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShotStatus::Success => "success",
            ShotStatus::Warning => "warning",
            ShotStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Screenshot {
    pub step_index: usize,
    pub status: ShotStatus,
    #[serde(rename = "image", serialize_with = "png_data_url")]
    pub png: Vec<u8>,
}

fn png_data_url<S: Serializer>(png: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("data:image/png;base64,{}", STANDARD.encode(png)))
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub duration_ms: u64,
    pub logs: Vec<String>,
    pub screenshots: Vec<Screenshot>,
}

impl RunResult {
    /// Failure reported before any step ran (launch error, run timeout).
    pub fn failed(run_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Failed,
            message: Some(message.into()),
            note: None,
            duration_ms: 0,
            logs: Vec::new(),
            screenshots: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

#[derive(Debug, Default)]
struct Evidence {
    logs: Vec<String>,
    screenshots: Vec<Screenshot>,
}

/// Append-only evidence for one run. Screenshots carry their step index, so a
/// skipped capture leaves no hole to misalign later entries.
///
/// Clones share the same evidence: whoever bounds the run keeps a handle and
/// can still report what was gathered if the run is cut short.
#[derive(Clone, Debug, Default)]
pub struct RunReporter {
    inner: Arc<Mutex<Evidence>>,
}

impl RunReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn evidence(&self) -> MutexGuard<'_, Evidence> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn log(&self, line: impl Into<String>) {
        self.evidence().logs.push(line.into());
    }

    pub fn screenshot(&self, step_index: usize, status: ShotStatus, png: Vec<u8>) {
        self.evidence().screenshots.push(Screenshot { step_index, status, png });
    }

    pub fn log_count(&self) -> usize {
        self.evidence().logs.len()
    }

    /// Drains the shared evidence into a result.
    pub fn into_result(
        self,
        run_id: &str,
        status: RunStatus,
        message: Option<String>,
        note: Option<String>,
        duration_ms: u64,
    ) -> RunResult {
        let Evidence { logs, screenshots } = std::mem::take(&mut *self.evidence());
        RunResult {
            run_id: run_id.to_string(),
            status,
            message,
            note,
            duration_ms,
            logs,
            screenshots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sparse_screenshots_keep_their_index() {
        let r = RunReporter::new();
        r.log("step 1");
        r.log("step 2");
        r.screenshot(1, ShotStatus::Warning, vec![1, 2, 3]);
        let res = r.into_result("abc", RunStatus::Success, None, Some("note".into()), 5);
        assert_eq!(res.logs.len(), 2);
        assert_eq!(res.screenshots.len(), 1);
        assert_eq!(res.screenshots[0].step_index, 1);
    }

    #[test]
    fn result_serializes_for_the_web_app() {
        let r = RunReporter::new();
        r.log("ok");
        r.screenshot(0, ShotStatus::Success, vec![0x89, 0x50]);
        let v = serde_json::to_value(r.into_result("id1", RunStatus::Success, None, None, 12)).unwrap();
        assert_eq!(v["status"], json!("success"));
        assert_eq!(v["runId"], json!("id1"));
        assert!(v.get("message").is_none());
        assert!(v.get("note").is_none());
        assert_eq!(v["screenshots"][0]["stepIndex"], json!(0));
        assert_eq!(v["screenshots"][0]["status"], json!("success"));
        assert_eq!(v["screenshots"][0]["image"], json!("data:image/png;base64,iVA="));
    }

    #[test]
    fn clones_share_evidence() {
        let r = RunReporter::new();
        let handle = r.clone();
        r.log("Step 1 (CLICK) passed: clicked #a");
        drop(r);
        assert_eq!(handle.log_count(), 1);
        let res = handle.into_result("id", RunStatus::Failed, Some("cut short".into()), None, 3);
        assert_eq!(res.logs, vec!["Step 1 (CLICK) passed: clicked #a"]);
    }

    #[test]
    fn early_failure_has_message_and_no_evidence() {
        let res = RunResult::failed("x", "launch failed");
        assert!(!res.is_success());
        assert_eq!(res.message.as_deref(), Some("launch failed"));
        assert!(res.logs.is_empty());
    }
}
