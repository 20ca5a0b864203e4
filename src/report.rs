//! Forensic capture and the single failure-report submission.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tracing::{error, info, warn};

use crate::api::Backend;
use crate::page::Page;
use crate::types::{FailureReport, Task};

pub const UNKNOWN_URL: &str = "unavailable";
pub const MISSING_HTML: &str = "<!-- page markup unavailable -->";
pub const MISSING_SCREENSHOT: &str = "";

/// What the reporter managed to do. Never an error: reporting is best-effort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportStatus {
    pub submitted: bool,
    pub screenshot_path: Option<PathBuf>,
    pub html_path: Option<PathBuf>,
}

impl ReportStatus {
    /// Local artifact paths for log lines, `-` when nothing was written.
    pub fn artifacts(&self) -> String {
        let paths: Vec<String> = [&self.screenshot_path, &self.html_path]
            .into_iter()
            .flatten()
            .map(|p| p.display().to_string())
            .collect();
        if paths.is_empty() {
            "-".to_string()
        } else {
            paths.join(",")
        }
    }
}

struct Evidence {
    url: String,
    html: Option<String>,
    screenshot: Option<Vec<u8>>,
}

pub struct FailureReporter {
    backend: Arc<dyn Backend>,
    artifacts_dir: Option<PathBuf>,
}

impl FailureReporter {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            artifacts_dir: None,
        }
    }

    /// Also keep screenshot and markup on disk under `dir`.
    pub fn with_artifacts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = Some(dir.into());
        self
    }

    /// Capture what the page shows, then submit exactly one report.
    ///
    /// `page` is `None` when the failure happened before a browser was acquired;
    /// the report then goes out with placeholders.
    pub async fn report(
        &self,
        task: &Task,
        page: Option<&dyn Page>,
        failed_action: &str,
        message: &str,
    ) -> ReportStatus {
        let evidence = match page {
            Some(page) => capture(page).await,
            None => Evidence {
                url: UNKNOWN_URL.to_string(),
                html: None,
                screenshot: None,
            },
        };

        let mut status = ReportStatus::default();
        if let Some(dir) = &self.artifacts_dir {
            let stem = format!("{}-{}", sanitize(&task.task_id), unix_millis());
            if let Some(png) = &evidence.screenshot {
                status.screenshot_path = write_artifact(dir, &format!("{stem}.png"), png).await;
            }
            if let Some(html) = &evidence.html {
                status.html_path = write_artifact(dir, &format!("{stem}.html"), html.as_bytes()).await;
            }
        }

        let report = FailureReport {
            account_id: task.execution_context.account_id.clone(),
            persona_id: task.execution_context.persona_id.clone(),
            task: serde_json::to_string(task).unwrap_or_else(|_| task.task_id.clone()),
            failed_action: failed_action.to_string(),
            error_message: message.to_string(),
            page_url: evidence.url,
            html_snapshot: evidence.html.unwrap_or_else(|| MISSING_HTML.to_string()),
            screenshot_base64: evidence
                .screenshot
                .map(|png| STANDARD.encode(png))
                .unwrap_or_else(|| MISSING_SCREENSHOT.to_string()),
        };

        match self.backend.submit_failure_report(&report).await {
            Ok(()) => {
                status.submitted = true;
                info!(task_id = %task.task_id, failed_action, "failure report submitted");
            }
            Err(e) => {
                error!(task_id = %task.task_id, failed_action, error = %e, "failure report submission failed");
            }
        }
        status
    }
}

async fn capture(page: &dyn Page) -> Evidence {
    let screenshot = match page.screenshot_png().await {
        Ok(png) => Some(png),
        Err(e) => {
            warn!(error = %format!("{e:#}"), "screenshot capture failed");
            None
        }
    };
    let html = match page.html().await {
        Ok(html) => Some(html),
        Err(e) => {
            warn!(error = %format!("{e:#}"), "markup capture failed");
            None
        }
    };
    let url = page.url().await.unwrap_or_else(|e| {
        warn!(error = %format!("{e:#}"), "page url unavailable");
        UNKNOWN_URL.to_string()
    });
    Evidence {
        url,
        html,
        screenshot,
    }
}

async fn write_artifact(dir: &Path, name: &str, bytes: &[u8]) -> Option<PathBuf> {
    let path = dir.join(name);
    match try_write(&path, bytes).await {
        Ok(()) => Some(path),
        Err(e) => {
            warn!(path = %path.display(), error = %format!("{e:#}"), "could not write artifact");
            None
        }
    }
}

async fn try_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("write {}", path.display()))
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FAKE_HTML, FAKE_PNG, FakeBackend, FakePage, task};
    use serde_json::json;

    #[tokio::test]
    async fn captures_page_and_submits_once() {
        let backend = Arc::new(FakeBackend::new([]));
        let dir = tempfile::tempdir().unwrap();
        let reporter = FailureReporter::new(backend.clone()).with_artifacts_dir(dir.path());
        let page = FakePage::default();
        page.goto("https://www.facebook.com/groups/g").await.unwrap();

        let t = task("SCRAPE_AND_LIKE", json!({"groupName": "G"}));
        let status = reporter.report(&t, Some(&page), "likePost", "X").await;

        assert!(status.submitted);
        let reports = backend.reports();
        assert_eq!(reports.len(), 1);
        let r = &reports[0];
        assert_eq!(r.failed_action, "likePost");
        assert_eq!(r.error_message, "X");
        assert_eq!(r.account_id.as_deref(), Some("acc-1"));
        assert_eq!(r.page_url, "https://www.facebook.com/groups/g");
        assert_eq!(r.html_snapshot, FAKE_HTML);
        assert_eq!(r.screenshot_base64, STANDARD.encode(FAKE_PNG));
        assert!(r.task.contains("\"taskId\":\"task-1\""));

        let png = status.screenshot_path.unwrap();
        assert_eq!(std::fs::read(&png).unwrap(), FAKE_PNG);
        assert!(png.file_name().unwrap().to_string_lossy().starts_with("task-1-"));
        assert!(status.html_path.unwrap().exists());
    }

    #[tokio::test]
    async fn capture_failure_still_submits_placeholders() {
        let backend = Arc::new(FakeBackend::new([]));
        let reporter = FailureReporter::new(backend.clone());
        let page = FakePage::default().failing_capture();

        let status = reporter
            .report(&task("T", json!({})), Some(&page), "likePost", "boom")
            .await;

        assert!(status.submitted);
        assert_eq!(status.artifacts(), "-");
        let r = &backend.reports()[0];
        assert_eq!(r.page_url, UNKNOWN_URL);
        assert_eq!(r.html_snapshot, MISSING_HTML);
        assert_eq!(r.screenshot_base64, MISSING_SCREENSHOT);
    }

    #[tokio::test]
    async fn rejected_submission_is_not_retried() {
        let backend = Arc::new(FakeBackend::new([]).rejecting_reports());
        let reporter = FailureReporter::new(backend.clone());

        let status = reporter
            .report(&task("T", json!({})), None, "INITIALIZATION", "no profile")
            .await;

        assert!(!status.submitted);
        assert_eq!(backend.reports().len(), 1);
    }

    #[tokio::test]
    async fn artifacts_create_missing_dirs_and_never_block_submission() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("failures").join("today");
        let backend = Arc::new(FakeBackend::new([]));
        let reporter = FailureReporter::new(backend.clone()).with_artifacts_dir(nested.clone());
        let page = FakePage::default();

        let status = reporter.report(&task("T", json!({})), Some(&page), "likePost", "X").await;
        assert!(status.screenshot_path.unwrap().starts_with(&nested));

        let blocker = root.path().join("plain-file");
        std::fs::write(&blocker, b"x").unwrap();
        let reporter = FailureReporter::new(backend.clone()).with_artifacts_dir(blocker.join("sub"));

        let status = reporter.report(&task("T", json!({})), Some(&page), "likePost", "X").await;
        assert!(status.submitted);
        assert!(status.screenshot_path.is_none());
        assert!(status.html_path.is_none());
        assert_eq!(backend.reports().len(), 2);
    }

    #[test]
    fn artifact_names_are_path_safe() {
        assert_eq!(sanitize("a/b:c-1_2"), "a_b_c-1_2");
    }
}
