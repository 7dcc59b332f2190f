use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs as async_fs;

use crate::report::RunResult;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Optional sink for a finished run's evidence.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn save(&self, result: &RunResult) -> Result<(), ArtifactError>;
}

/// Writes `<base>/<run_id>/step_NNN_<status>.png` and a `result.json`
/// without the inline images.
pub struct DiskArtifactStore {
    base_dir: PathBuf,
}

impl DiskArtifactStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(run_id)
    }
}

#[async_trait]
impl ArtifactStore for DiskArtifactStore {
    async fn save(&self, result: &RunResult) -> Result<(), ArtifactError> {
        let dir = self.run_dir(&result.run_id);
        async_fs::create_dir_all(&dir).await?;
        for shot in &result.screenshots {
            let name = format!("step_{:03}_{}.png", shot.step_index, shot.status.as_str());
            async_fs::write(dir.join(name), &shot.png).await?;
        }

        let mut summary = serde_json::to_value(result)?;
        if let Some(shots) = summary.get_mut("screenshots").and_then(|s| s.as_array_mut()) {
            for shot in shots.iter_mut().filter_map(|s| s.as_object_mut()) {
                shot.remove("image");
            }
        }
        async_fs::write(dir.join("result.json"), serde_json::to_vec_pretty(&summary)?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{RunReporter, RunStatus, ShotStatus};

    #[tokio::test]
    async fn writes_pngs_and_summary() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskArtifactStore::new(tmp.path());
        let r = RunReporter::new();
        r.log("Step 1 (CLICK) passed");
        r.screenshot(0, ShotStatus::Success, vec![1, 2]);
        r.screenshot(1, ShotStatus::Warning, vec![3]);
        let result = r.into_result("run1", RunStatus::Success, None, Some("lenient".into()), 7);

        store.save(&result).await.unwrap();

        let dir = store.run_dir("run1");
        assert_eq!(std::fs::read(dir.join("step_000_success.png")).unwrap(), vec![1, 2]);
        assert_eq!(std::fs::read(dir.join("step_001_warning.png")).unwrap(), vec![3]);
        let summary: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.join("result.json")).unwrap()).unwrap();
        assert_eq!(summary["note"], "lenient");
        assert_eq!(summary["screenshots"][1]["status"], "warning");
        assert!(summary["screenshots"][1].get("image").is_none());
    }
}
