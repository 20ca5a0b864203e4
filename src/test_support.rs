//! Scripted stand-ins for every collaborator the loop talks to.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::json;

use crate::actions::{ActionName, ActionRegistry, FinishTask, Operation};
use crate::api::Backend;
use crate::brain::{AiConfig, CompletionProvider, ProviderFactory};
use crate::error::TransportError;
use crate::page::{ElementSnapshot, Page, PageProvider};
use crate::types::{ActionResult, FailureReport, Parameters, Task};

pub const FAKE_HTML: &str = "<html><body>fake</body></html>";
pub const FAKE_PNG: &[u8] = b"\x89PNG fake";

#[derive(Debug, Default)]
struct PageLog {
    visited: Vec<String>,
    clicks: Vec<String>,
    typed: Vec<(String, String)>,
    keys: Vec<String>,
    waited: Vec<String>,
}

/// In-memory page that records every interaction.
#[derive(Debug, Default)]
pub struct FakePage {
    snapshots: Vec<ElementSnapshot>,
    fail_clicks: bool,
    fail_capture: bool,
    log: Mutex<PageLog>,
}

impl FakePage {
    pub fn with_snapshots(mut self, snapshots: Vec<ElementSnapshot>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn failing_clicks(mut self) -> Self {
        self.fail_clicks = true;
        self
    }

    /// Screenshot, markup and URL reads all fail.
    pub fn failing_capture(mut self) -> Self {
        self.fail_capture = true;
        self
    }

    pub fn visited(&self) -> Vec<String> {
        self.log.lock().unwrap().visited.clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.log.lock().unwrap().clicks.clone()
    }

    pub fn typed(&self) -> Vec<(String, String)> {
        self.log.lock().unwrap().typed.clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.log.lock().unwrap().keys.clone()
    }

    pub fn waited(&self) -> Vec<String> {
        self.log.lock().unwrap().waited.clone()
    }

    fn click_result(&self, what: String) -> Result<()> {
        if self.fail_clicks {
            bail!("no element matched {what}");
        }
        self.log.lock().unwrap().clicks.push(what);
        Ok(())
    }

    fn capture_guard(&self) -> Result<()> {
        if self.fail_capture {
            bail!("target closed");
        }
        Ok(())
    }
}

#[async_trait]
impl Page for FakePage {
    async fn goto(&self, url: &str) -> Result<()> {
        self.log.lock().unwrap().visited.push(url.to_string());
        Ok(())
    }

    async fn wait_for(&self, selector: &str, _timeout: Duration) -> Result<()> {
        self.log.lock().unwrap().waited.push(selector.to_string());
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.click_result(selector.to_string())
    }

    async fn click_with_text(&self, selector: &str, text: &str, _timeout: Duration) -> Result<()> {
        self.click_result(format!("{selector} ~ {text}"))
    }

    async fn wait_for_text(&self, _selector: &str, _text: &str, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .typed
            .push((selector.to_string(), text.to_string()));
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        self.log.lock().unwrap().keys.push(key.to_string());
        Ok(())
    }

    async fn snapshot_all(&self, _selector: &str, limit: usize) -> Result<Vec<ElementSnapshot>> {
        Ok(self.snapshots.iter().take(limit).cloned().collect())
    }

    async fn url(&self) -> Result<String> {
        self.capture_guard()?;
        Ok(self
            .log
            .lock()
            .unwrap()
            .visited
            .last()
            .cloned()
            .unwrap_or_else(|| "https://www.facebook.com/".to_string()))
    }

    async fn html(&self) -> Result<String> {
        self.capture_guard()?;
        Ok(FAKE_HTML.to_string())
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>> {
        self.capture_guard()?;
        Ok(FAKE_PNG.to_vec())
    }
}

/// Hands out `FakePage`s and counts sessions.
#[derive(Debug, Default)]
pub struct FakePageProvider {
    fail_open: bool,
    fail_capture: bool,
    opened: Mutex<Vec<String>>,
    released: AtomicUsize,
}

impl FakePageProvider {
    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Default::default()
        }
    }

    pub fn failing_capture() -> Self {
        Self {
            fail_capture: true,
            ..Default::default()
        }
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageProvider for FakePageProvider {
    async fn open(&self, profile_id: &str) -> Result<Box<dyn Page>> {
        if self.fail_open {
            bail!("profile {profile_id} could not be started");
        }
        self.opened.lock().unwrap().push(profile_id.to_string());
        let page = FakePage::default();
        Ok(Box::new(if self.fail_capture {
            page.failing_capture()
        } else {
            page
        }))
    }

    async fn release(&self, _profile_id: &str, _page: Box<dyn Page>) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Replies with canned completions, in order, and remembers each prompt.
#[derive(Debug, Default)]
pub struct ScriptedBrain {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBrain {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedBrain {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted brain has no replies left"))
    }
}

/// A well-formed model reply choosing `action` with `parameters`.
pub fn decision(action: &str, parameters: serde_json::Value) -> String {
    let body = json!({
        "thought": format!("next: {action}"),
        "action": action,
        "parameters": parameters,
    });
    format!("```json\n{body}\n```")
}

/// Always builds the same provider, or always fails.
pub struct StaticProviderFactory {
    provider: Option<Arc<dyn CompletionProvider>>,
}

impl StaticProviderFactory {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            provider: Some(provider),
        }
    }

    pub fn failing() -> Self {
        Self { provider: None }
    }
}

impl ProviderFactory for StaticProviderFactory {
    fn build(&self, config: &AiConfig) -> Result<Arc<dyn CompletionProvider>> {
        self.provider
            .clone()
            .ok_or_else(|| anyhow!("invalid AI provider \"{}\"", config.ai_provider))
    }
}

/// Succeeds without touching the page.
pub struct NoopOperation {
    name: ActionName,
}

impl NoopOperation {
    pub fn new(name: ActionName) -> Self {
        Self { name }
    }
}

#[async_trait]
impl Operation for NoopOperation {
    fn name(&self) -> ActionName {
        self.name
    }

    async fn run(&self, _page: &dyn Page, _params: &Parameters) -> ActionResult {
        ActionResult::ok(format!("{} done.", self.name))
    }
}

#[derive(Default)]
struct Script {
    results: VecDeque<ActionResult>,
    calls: Vec<Parameters>,
}

/// Returns queued results in order and records the parameters of every call.
/// Clones share one script, so keep a clone to inspect after registering.
#[derive(Clone)]
pub struct ScriptedOperation {
    name: ActionName,
    panics: bool,
    script: Arc<Mutex<Script>>,
}

impl ScriptedOperation {
    pub fn new(name: ActionName, results: impl IntoIterator<Item = ActionResult>) -> Self {
        Self {
            name,
            panics: false,
            script: Arc::new(Mutex::new(Script {
                results: results.into_iter().collect(),
                calls: Vec::new(),
            })),
        }
    }

    pub fn panicking(name: ActionName) -> Self {
        Self {
            panics: true,
            ..Self::new(name, [])
        }
    }

    pub fn calls(&self) -> Vec<Parameters> {
        self.script.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl Operation for ScriptedOperation {
    fn name(&self) -> ActionName {
        self.name
    }

    async fn run(&self, _page: &dyn Page, params: &Parameters) -> ActionResult {
        if self.panics {
            panic!("{} blew up", self.name);
        }
        let mut script = self.script.lock().unwrap();
        script.calls.push(params.clone());
        script
            .results
            .pop_front()
            .unwrap_or_else(|| ActionResult::ok(format!("{} done.", self.name)))
    }
}

/// Complete registry: scripted operations where given, the real `finish_task`,
/// and no-ops for everything else.
pub fn registry_with(scripted: impl IntoIterator<Item = ScriptedOperation>) -> ActionRegistry {
    let scripted: Vec<ScriptedOperation> = scripted.into_iter().collect();
    let mut builder = ActionRegistry::builder();
    for action in ActionName::ALL {
        if let Some(op) = scripted.iter().find(|op| op.name == action) {
            builder = builder.register(op.clone());
        } else if action == ActionName::FinishTask {
            builder = builder.register(FinishTask);
        } else {
            builder = builder.register(NoopOperation::new(action));
        }
    }
    builder.build().unwrap()
}

/// One scripted answer to `next_task`.
#[derive(Debug, Clone)]
pub enum Poll {
    Task(Task),
    Empty,
    Transient,
    Unauthorized,
}

/// Serves scripted polls and collects submitted failure reports.
/// Once the script runs out every poll comes back empty.
#[derive(Default)]
pub struct FakeBackend {
    polls: Mutex<VecDeque<Poll>>,
    ai_config: AiConfig,
    reject_ai_config: bool,
    reject_reports: bool,
    reports: Mutex<Vec<FailureReport>>,
    poll_count: AtomicUsize,
}

impl FakeBackend {
    pub fn new(polls: impl IntoIterator<Item = Poll>) -> Self {
        Self {
            polls: Mutex::new(polls.into_iter().collect()),
            ai_config: AiConfig {
                ai_provider: "ollama".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// `ai_config` answers 403.
    pub fn rejecting_ai_config(mut self) -> Self {
        self.reject_ai_config = true;
        self
    }

    pub fn rejecting_reports(mut self) -> Self {
        self.reject_reports = true;
        self
    }

    pub fn reports(&self) -> Vec<FailureReport> {
        self.reports.lock().unwrap().clone()
    }

    pub fn poll_count(&self) -> usize {
        self.poll_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn next_task(&self) -> Result<Option<Task>, TransportError> {
        self.poll_count.fetch_add(1, Ordering::SeqCst);
        match self.polls.lock().unwrap().pop_front() {
            Some(Poll::Task(task)) => Ok(Some(task)),
            Some(Poll::Empty) | None => Ok(None),
            Some(Poll::Transient) => Err(TransportError::Status {
                status: 503,
                body: "service unavailable".to_string(),
            }),
            Some(Poll::Unauthorized) => Err(TransportError::Unauthorized { status: 401 }),
        }
    }

    async fn ai_config(&self) -> Result<AiConfig, TransportError> {
        if self.reject_ai_config {
            return Err(TransportError::Unauthorized { status: 403 });
        }
        Ok(self.ai_config.clone())
    }

    async fn submit_failure_report(&self, report: &FailureReport) -> Result<(), TransportError> {
        self.reports.lock().unwrap().push(report.clone());
        if self.reject_reports {
            return Err(TransportError::Status {
                status: 500,
                body: "report store down".to_string(),
            });
        }
        Ok(())
    }
}

/// A task bound to profile `p1`.
pub fn task(kind: &str, payload: serde_json::Value) -> Task {
    serde_json::from_value(json!({
        "taskId": "task-1",
        "type": kind,
        "payload": payload,
        "executionContext": {"profileId": "p1", "accountId": "acc-1", "personaId": "persona-1"}
    }))
    .unwrap()
}
