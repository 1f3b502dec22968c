use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::error::EngineError;

pub const WEBHOOK_ENV: &str = "ORIPA_WEBHOOK_URL";

/// Consolidated fatal-failure path: persist the rendered page for offline
/// inspection and ping the notification webhook. Reporting must never make a
/// bad run worse, so every step here swallows its own failures.
#[derive(Clone)]
pub struct FailureReporter {
    artifact_dir: PathBuf,
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl FailureReporter {
    pub fn new(artifact_dir: &Path, webhook_url: Option<String>) -> Self {
        Self {
            artifact_dir: artifact_dir.to_path_buf(),
            webhook_url: webhook_url.filter(|u| !u.trim().is_empty()),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env(artifact_dir: &Path) -> Self {
        Self::new(artifact_dir, std::env::var(WEBHOOK_ENV).ok())
    }

    pub async fn report_fatal(&self, site: &str, failure: &EngineError, page_html: Option<&str>) {
        error!(site, error = %failure, "run aborted");
        match page_html {
            Some(html) => {
                if let Some(path) = self.dump_artifact(site, html) {
                    info!(site, artifact = %path.display(), "failure page persisted");
                }
            }
            None => warn!(site, "no rendered markup available for failure artifact"),
        }
        self.notify(site, failure).await;
    }

    /// Write the rendered markup to a fixed per-site file. Write-only output;
    /// the engine never reads it back.
    fn dump_artifact(&self, site: &str, html: &str) -> Option<PathBuf> {
        if let Err(e) = fs::create_dir_all(&self.artifact_dir) {
            warn!(site, error = %e, "artifact dir create failed");
            return None;
        }
        let path = self.artifact_dir.join(format!("{site}_failure.html"));
        match fs::write(&path, html) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(site, error = %e, "artifact write failed");
                None
            }
        }
    }

    /// Short human-readable message to the webhook. Delivery failure is
    /// logged and swallowed; a run must never crash over a notification.
    async fn notify(&self, site: &str, failure: &EngineError) {
        let Some(url) = &self.webhook_url else {
            return;
        };
        let message = format!(
            "[{}] {site} run aborted: {failure}",
            Utc::now().format("%Y-%m-%d %H:%M:%SZ")
        );
        let result = self
            .client
            .post(url)
            .json(&json!({ "text": message }))
            .send()
            .await;
        match result {
            Ok(res) if res.status().is_success() => {}
            Ok(res) => warn!(site, status = res.status().as_u16(), "webhook rejected notification"),
            Err(e) => warn!(site, error = %e, "webhook delivery failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_fixed_per_site_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = FailureReporter::new(dir.path(), None);
        let failure = EngineError::ReadinessTimeout {
            site: "demo".into(),
            detail: "never stabilized".into(),
        };
        reporter
            .report_fatal("demo", &failure, Some("<html>broken</html>"))
            .await;

        let artifact = dir.path().join("demo_failure.html");
        assert_eq!(fs::read_to_string(artifact).unwrap(), "<html>broken</html>");
    }

    #[tokio::test]
    async fn missing_markup_and_webhook_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = FailureReporter::new(dir.path(), Some("   ".into()));
        let failure = EngineError::navigation("https://s.test/", "dns failure");
        reporter.report_fatal("demo", &failure, None).await;
        assert!(!dir.path().join("demo_failure.html").exists());
    }
}
