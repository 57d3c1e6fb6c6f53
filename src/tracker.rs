use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Where experiment tracking output goes. Both modes record to the local
/// filesystem; "online" exists for config compatibility with deployments
/// that sync the experiment directory elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerMode {
    Offline,
    Online,
}

/// Experiment tracking capability, passed by reference into the training
/// loop instead of living in ambient process state.
pub trait Tracker {
    fn log_parameters(&mut self, params: serde_json::Value) -> Result<()>;
    fn log_metrics(&mut self, epoch: usize, metrics: &[(&str, f64)]) -> Result<()>;
    fn log_image(&mut self, path: &Path) -> Result<()>;
}

/// Tracker that drops everything on the floor.
pub struct NullTracker;

impl Tracker for NullTracker {
    fn log_parameters(&mut self, _params: serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn log_metrics(&mut self, _epoch: usize, _metrics: &[(&str, f64)]) -> Result<()> {
        Ok(())
    }

    fn log_image(&mut self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// File-backed tracker: `params.json`, append-only `metrics.jsonl` and
/// copied images under `{workspace}_{project}/` in the experiment directory.
pub struct FileTracker {
    dir: PathBuf,
    metrics: File,
}

impl FileTracker {
    pub fn new(experiment_dir: &Path, project: &str, workspace: &str) -> Result<Self> {
        let dir = experiment_dir.join(format!("{workspace}_{project}"));
        std::fs::create_dir_all(dir.join("images"))
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let metrics_path = dir.join("metrics.jsonl");
        let metrics = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&metrics_path)
            .with_context(|| format!("failed to open {}", metrics_path.display()))?;
        Ok(Self { dir, metrics })
    }
}

impl Tracker for FileTracker {
    fn log_parameters(&mut self, params: serde_json::Value) -> Result<()> {
        let path = self.dir.join("params.json");
        let contents = serde_json::to_string_pretty(&params)?;
        std::fs::write(&path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    fn log_metrics(&mut self, epoch: usize, metrics: &[(&str, f64)]) -> Result<()> {
        let mut entry = serde_json::Map::new();
        entry.insert("epoch".to_string(), epoch.into());
        for (name, value) in metrics {
            entry.insert((*name).to_string(), (*value).into());
        }
        writeln!(self.metrics, "{}", serde_json::Value::Object(entry))
            .context("failed to append metrics")?;
        Ok(())
    }

    fn log_image(&mut self, path: &Path) -> Result<()> {
        let name = path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("image path {} has no file name", path.display()))?;
        std::fs::copy(path, self.dir.join("images").join(name))
            .with_context(|| format!("failed to copy {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_tracker_writes_params_and_metrics() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tracker =
            FileTracker::new(dir.path(), "gaze-redirection", "team").expect("tracker");

        tracker
            .log_parameters(serde_json::json!({"lr": 5e-4}))
            .expect("params");
        tracker
            .log_metrics(0, &[("loss_d", 1.25), ("loss_g", 3.5)])
            .expect("metrics");
        tracker
            .log_metrics(1, &[("loss_d", 1.0), ("loss_g", 3.0)])
            .expect("metrics");

        let base = dir.path().join("team_gaze-redirection");
        let params = std::fs::read_to_string(base.join("params.json")).expect("read params");
        assert!(params.contains("lr"));

        let metrics = std::fs::read_to_string(base.join("metrics.jsonl")).expect("read metrics");
        let lines: Vec<&str> = metrics.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json line");
        assert_eq!(first["epoch"], 0);
        assert_eq!(first["loss_d"], 1.25);
    }

    #[test]
    fn file_tracker_copies_images() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tracker = FileTracker::new(dir.path(), "proj", "ws").expect("tracker");
        let image_path = dir.path().join("0_100.png");
        std::fs::write(&image_path, b"png-bytes").expect("write image");

        tracker.log_image(&image_path).expect("log image");
        let copied = dir.path().join("ws_proj").join("images").join("0_100.png");
        assert!(copied.exists());
    }
}
