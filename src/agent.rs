//! The decision loop: think, parse, act, observe, for one task at a time.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::actions::{ActionName, ActionRegistry, Pacing};
use crate::api::Backend;
use crate::brain::{CompletionProvider, ProviderFactory};
use crate::error::{FailureKind, TransportError};
use crate::face::{AgentEvent, Monitor};
use crate::page::{Page, PageProvider};
use crate::parser;
use crate::prompt::PromptBuilder;
use crate::report::{FailureReporter, ReportStatus};
use crate::state::{Merge, StateStore};
use crate::types::{
    ActionResult, AgentState, Command, DEFAULT_HISTORY_LIMIT, DEFAULT_MAX_STEPS, DEFAULT_SCRAPE_COUNT,
    HistoryEntry, Parameters, Role, ScrapedItem, Task,
};

pub const INITIAL_OBSERVATION: &str = "I am on the Facebook homepage.";
pub const NO_TARGET_OBSERVATION: &str = "I wanted to interact, but I have no unscraped posts in my memory. I should probably scrape some.";
const FINISH_MESSAGE: &str = "Task completed successfully.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub max_steps: usize,
    pub history_limit: usize,
    /// `count` handed to the scraper when neither model nor task gives one.
    pub scrape_count: u64,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            scrape_count: DEFAULT_SCRAPE_COUNT,
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Finished {
        task_id: String,
        steps: usize,
        message: String,
        /// Working memory as it stood when the task finished.
        memory: AgentState,
    },
    Failed(TaskFailure),
}

impl TaskOutcome {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskOutcome::Finished { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub task_id: String,
    pub kind: FailureKind,
    pub failed_action: String,
    pub message: String,
    pub report: ReportStatus,
    /// HTTP status when the backend refused our credentials mid-task.
    pub credentials_rejected: Option<u16>,
}

/// Where a running task stopped, before cleanup and reporting.
enum Terminal {
    Finished {
        steps: usize,
        message: String,
        memory: AgentState,
    },
    Failed {
        kind: FailureKind,
        failed_action: String,
        message: String,
    },
}

impl Terminal {
    fn failed(kind: FailureKind, failed_action: impl Into<String>, message: impl Into<String>) -> Self {
        Terminal::Failed {
            kind,
            failed_action: failed_action.into(),
            message: message.into(),
        }
    }

    /// Failure that came from the loop itself rather than an invoked operation.
    fn synthetic(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::failed(kind, kind.label(), message)
    }
}

/// Runs one task to `FINISHED` or `FAILED`. Collaborators are injected; the
/// loop owns nothing between tasks.
pub struct DecisionLoop {
    backend: Arc<dyn Backend>,
    pages: Arc<dyn PageProvider>,
    providers: Arc<dyn ProviderFactory>,
    reporter: FailureReporter,
    registry: Option<Arc<ActionRegistry>>,
    pacing: Pacing,
    settings: LoopSettings,
    monitor: Option<Monitor>,
}

impl DecisionLoop {
    pub fn new(
        backend: Arc<dyn Backend>,
        pages: Arc<dyn PageProvider>,
        providers: Arc<dyn ProviderFactory>,
    ) -> Self {
        Self {
            reporter: FailureReporter::new(backend.clone()),
            backend,
            pages,
            providers,
            registry: None,
            pacing: Pacing::default(),
            settings: LoopSettings::default(),
            monitor: None,
        }
    }

    pub fn with_settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Use a fixed registry instead of the standard operations.
    pub fn with_registry(mut self, registry: Arc<ActionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_artifacts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reporter = FailureReporter::new(self.backend.clone()).with_artifacts_dir(dir);
        self
    }

    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(monitor) = &self.monitor {
            monitor.emit(event);
        }
    }

    pub async fn execute_task(&self, task: &Task) -> TaskOutcome {
        info!(task_id = %task.task_id, kind = %task.kind, "task started");
        self.emit(AgentEvent::TaskStarted {
            task_id: task.task_id.clone(),
            kind: task.kind.clone(),
        });

        let Some(profile) = task.execution_context.profile() else {
            return self
                .initialization_failed(task, "task has no browser profile id".to_string(), None)
                .await;
        };
        let brain = match self.acquire_brain().await {
            Ok(brain) => brain,
            Err(e) => {
                let rejected = match e.downcast_ref::<TransportError>() {
                    Some(TransportError::Unauthorized { status }) => Some(*status),
                    _ => None,
                };
                return self
                    .initialization_failed(task, format!("{e:#}"), rejected)
                    .await;
            }
        };
        let page = match self.pages.open(profile).await {
            Ok(page) => page,
            Err(e) => {
                let message = format!("could not open browser profile {profile}: {e:#}");
                return self.initialization_failed(task, message, None).await;
            }
        };
        debug!(task_id = %task.task_id, profile, "browser session acquired");

        let registry = match &self.registry {
            Some(registry) => registry.clone(),
            None => Arc::new(ActionRegistry::standard(self.pacing, Some(brain.clone()))),
        };

        let terminal = self.run(task, page.as_ref(), brain.as_ref(), &registry).await;
        let outcome = match terminal {
            Terminal::Finished {
                steps,
                message,
                memory,
            } => TaskOutcome::Finished {
                task_id: task.task_id.clone(),
                steps,
                message,
                memory,
            },
            Terminal::Failed {
                kind,
                failed_action,
                message,
            } => {
                // Evidence must be taken while the session is still open.
                let report = self
                    .reporter
                    .report(task, Some(page.as_ref()), &failed_action, &message)
                    .await;
                TaskOutcome::Failed(TaskFailure {
                    task_id: task.task_id.clone(),
                    kind,
                    failed_action,
                    message,
                    report,
                    credentials_rejected: None,
                })
            }
        };

        if let Err(e) = self.pages.release(profile, page).await {
            warn!(task_id = %task.task_id, profile, error = %format!("{e:#}"), "browser release failed");
        }
        self.finish(outcome)
    }

    async fn acquire_brain(&self) -> Result<Arc<dyn CompletionProvider>> {
        let config = self
            .backend
            .ai_config()
            .await
            .context("fetch AI configuration")?;
        self.providers
            .build(&config)
            .context("build completion provider")
    }

    async fn initialization_failed(
        &self,
        task: &Task,
        message: String,
        credentials_rejected: Option<u16>,
    ) -> TaskOutcome {
        let kind = FailureKind::Initialization;
        let report = self.reporter.report(task, None, kind.label(), &message).await;
        self.finish(TaskOutcome::Failed(TaskFailure {
            task_id: task.task_id.clone(),
            kind,
            failed_action: kind.label().to_string(),
            message,
            report,
            credentials_rejected,
        }))
    }

    fn finish(&self, outcome: TaskOutcome) -> TaskOutcome {
        match &outcome {
            TaskOutcome::Finished {
                task_id,
                steps,
                message,
                ..
            } => {
                info!(task_id = %task_id, outcome = "FINISHED", steps, message = %message, "task finished");
                self.emit(AgentEvent::TaskFinished {
                    task_id: task_id.clone(),
                    steps: *steps,
                });
            }
            TaskOutcome::Failed(failure) => {
                error!(
                    task_id = %failure.task_id,
                    outcome = "FAILED",
                    kind = %failure.kind,
                    failed_action = %failure.failed_action,
                    message = %failure.message,
                    reported = failure.report.submitted,
                    artifacts = %failure.report.artifacts(),
                    "task failed"
                );
                self.emit(AgentEvent::TaskFailed {
                    task_id: failure.task_id.clone(),
                    failed_action: failure.failed_action.clone(),
                    message: failure.message.clone(),
                });
            }
        }
        outcome
    }

    async fn run(
        &self,
        task: &Task,
        page: &dyn Page,
        brain: &dyn CompletionProvider,
        registry: &ActionRegistry,
    ) -> Terminal {
        let mut store = StateStore::new(self.settings.history_limit);
        store.reset();
        store.record(HistoryEntry::new(Role::Task, describe_task(task)));
        let prompts = PromptBuilder::new(registry);
        let mut selectors: BTreeMap<String, String> = BTreeMap::new();
        let mut observation = INITIAL_OBSERVATION.to_string();

        for step in 1..=self.settings.max_steps {
            store.record(HistoryEntry::new(Role::Observation, observation.clone()));
            let prompt = prompts.build(task, store.history(), store.state(), &observation);

            self.emit(AgentEvent::Thinking { step });
            let raw = match brain.complete(&prompt).await {
                Ok(raw) if !raw.trim().is_empty() => raw,
                Ok(_) => {
                    return Terminal::synthetic(
                        FailureKind::ReasoningFailure,
                        "completion provider returned an empty response",
                    );
                }
                Err(e) => {
                    return Terminal::synthetic(
                        FailureKind::ReasoningFailure,
                        format!("completion provider failed: {e:#}"),
                    );
                }
            };

            let command = match parser::parse(&raw, registry) {
                Ok(command) => command,
                Err(failure) => {
                    warn!(task_id = %task.task_id, step, error = %failure, raw = %failure.raw, "unusable model reply");
                    return Terminal::synthetic(failure.kind(), failure.to_string());
                }
            };
            let action = command.action;
            info!(task_id = %task.task_id, step, action = %action, thought = %command.thought, "decision");
            store.record(HistoryEntry::new(Role::Decision, describe_command(&command)));
            self.emit(AgentEvent::Decision {
                step,
                action: action.to_string(),
                thought: command.thought.clone(),
            });

            let target: Option<ScrapedItem> = if action.is_interaction() {
                match store.resolve_target() {
                    Some(item) => Some(item.clone()),
                    None => {
                        info!(task_id = %task.task_id, step, action = %action, "no target left in working memory");
                        observation = NO_TARGET_OBSERVATION.to_string();
                        self.observe(step, &observation);
                        continue;
                    }
                }
            } else {
                None
            };

            let Some(operation) = registry.get(action) else {
                return Terminal::synthetic(
                    FailureKind::UnknownAction,
                    format!("no operation registered for {action}"),
                );
            };
            let params = assemble_parameters(
                &command,
                &task.payload,
                target.as_ref(),
                &selectors,
                self.settings.scrape_count,
            );

            let result = match AssertUnwindSafe(operation.run(page, &params))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => ActionResult::fail(format!(
                    "{action} panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };
            if !result.success {
                return Terminal::failed(FailureKind::OperationFailure, action.as_str(), result.message);
            }

            if let Some(hints) = &result.new_selectors {
                debug!(count = hints.len(), "carrying selector hints forward");
                selectors.extend(hints.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            let merge = match store.merge_result(action, target.as_ref().map(|t| t.url.as_str()), &result) {
                Ok(merge) => merge,
                Err(e) => {
                    return Terminal::failed(FailureKind::OperationFailure, action.as_str(), e.to_string());
                }
            };

            if action == ActionName::FinishTask {
                return Terminal::Finished {
                    steps: step,
                    message: result.message,
                    memory: store.state().clone(),
                };
            }
            observation = describe_outcome(action, &result, &merge);
            self.observe(step, &observation);
        }

        Terminal::synthetic(
            FailureKind::StepLimitExhausted,
            format!(
                "step limit of {} reached without finish_task",
                self.settings.max_steps
            ),
        )
    }

    fn observe(&self, step: usize, text: &str) {
        debug!(step, observation = text, "observation");
        self.emit(AgentEvent::Observation {
            step,
            text: text.to_string(),
        });
    }
}

/// Model parameters, overlaid by the task payload, overlaid by what the loop resolved.
fn assemble_parameters(
    command: &Command,
    payload: &Parameters,
    target: Option<&ScrapedItem>,
    selectors: &BTreeMap<String, String>,
    scrape_count: u64,
) -> Parameters {
    let action = command.action;
    let mut params = command.parameters.clone();
    for spec in action.params() {
        let Some(value) = payload.get(spec.name).filter(|v| !v.is_null()) else {
            continue;
        };
        if spec.kind.accepts(value) {
            params.insert(spec.name.to_string(), value.clone());
        } else {
            warn!(action = %action, param = spec.name, expected = %spec.kind, "ignoring mistyped payload value");
        }
    }

    if let Some(item) = target {
        params.insert("postUrl".into(), Value::from(item.url.clone()));
        params.insert("postText".into(), Value::from(item.text.clone()));
        match &item.author_profile_url {
            Some(author) => params.insert("authorProfileUrl".into(), Value::from(author.clone())),
            None => params.remove("authorProfileUrl"),
        };
    }

    match action {
        ActionName::ScrapePostsFromTarget => {
            params
                .entry("count")
                .or_insert_with(|| Value::from(scrape_count));
        }
        ActionName::CommentOnPost => {
            let has_text = params
                .get("commentText")
                .and_then(Value::as_str)
                .is_some_and(|t| !t.trim().is_empty());
            if !has_text {
                params.insert("generateSmartComment".into(), Value::Bool(true));
            }
        }
        ActionName::FinishTask => {
            params.entry("success").or_insert(Value::Bool(true));
            params
                .entry("message")
                .or_insert_with(|| Value::from(FINISH_MESSAGE));
        }
        _ => {}
    }

    if !selectors.is_empty() && action != ActionName::FinishTask {
        let hints: serde_json::Map<String, Value> = selectors
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.clone())))
            .collect();
        params.insert("selectors".into(), Value::Object(hints));
    }
    params
}

fn describe_task(task: &Task) -> String {
    format!(
        "Execute task {} with payload {}",
        task.kind,
        Value::Object(task.payload.clone())
    )
}

fn describe_command(command: &Command) -> String {
    format!(
        "thought: {} | action: {} | parameters: {}",
        command.thought,
        command.action,
        Value::Object(command.parameters.clone())
    )
}

fn describe_outcome(action: ActionName, result: &ActionResult, merge: &Merge) -> String {
    let mut text = format!("Action '{action}' completed. Outcome: {}", result.message);
    match merge {
        Merge::Scraped { count } => {
            text.push_str(&format!(" I have saved {count} posts to my memory."));
        }
        Merge::Interacted { id } => {
            text.push_str(&format!(" I will not act on {id} again."));
        }
        Merge::Unchanged => {}
    }
    text
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command(action: ActionName, params: Value) -> Command {
        Command {
            thought: "t".into(),
            action,
            parameters: serde_json::from_value(params).unwrap(),
        }
    }

    fn payload(v: Value) -> Parameters {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn loop_resolved_target_beats_model_and_payload() {
        let item = ScrapedItem {
            url: "https://fb/posts/1".into(),
            text: "hello".into(),
            author_profile_url: None,
        };
        let params = assemble_parameters(
            &command(
                ActionName::LikePost,
                json!({"postUrl": "https://evil", "authorProfileUrl": "x"}),
            ),
            &payload(json!({"postUrl": "https://payload", "groupName": "G"})),
            Some(&item),
            &BTreeMap::new(),
            5,
        );
        assert_eq!(params["postUrl"], "https://fb/posts/1");
        assert_eq!(params["postText"], "hello");
        assert!(!params.contains_key("authorProfileUrl"));
        assert!(!params.contains_key("groupName"));
    }

    #[test]
    fn payload_overrides_model_for_declared_parameters() {
        let params = assemble_parameters(
            &command(ActionName::NavigateToGroup, json!({"groupName": "model guess"})),
            &payload(json!({"groupName": "G"})),
            None,
            &BTreeMap::new(),
            5,
        );
        assert_eq!(params["groupName"], "G");
    }

    #[test]
    fn mistyped_payload_values_are_ignored() {
        let scrape = assemble_parameters(
            &command(ActionName::ScrapePostsFromTarget, json!({"count": 3})),
            &payload(json!({"count": "5"})),
            None,
            &BTreeMap::new(),
            5,
        );
        assert_eq!(scrape["count"], 3);

        let comment = assemble_parameters(
            &command(ActionName::CommentOnPost, json!({})),
            &payload(json!({"commentText": 7})),
            None,
            &BTreeMap::new(),
            5,
        );
        assert!(!comment.contains_key("commentText"));
        assert_eq!(comment["generateSmartComment"], true);
    }

    #[test]
    fn defaults_fill_missing_parameters() {
        let scrape = assemble_parameters(
            &command(ActionName::ScrapePostsFromTarget, json!({})),
            &Parameters::new(),
            None,
            &BTreeMap::new(),
            5,
        );
        assert_eq!(scrape["count"], 5);

        let finish = assemble_parameters(
            &command(ActionName::FinishTask, json!({})),
            &Parameters::new(),
            None,
            &BTreeMap::new(),
            5,
        );
        assert_eq!(finish["success"], true);
        assert_eq!(finish["message"], FINISH_MESSAGE);

        let comment = assemble_parameters(
            &command(ActionName::CommentOnPost, json!({})),
            &Parameters::new(),
            None,
            &BTreeMap::new(),
            5,
        );
        assert_eq!(comment["generateSmartComment"], true);
    }

    #[test]
    fn selector_hints_are_passed_down() {
        let hints = BTreeMap::from([("likeButton".to_string(), "#like".to_string())]);
        let params = assemble_parameters(
            &command(ActionName::LikePost, json!({"selectors": {"likeButton": "model"}})),
            &Parameters::new(),
            None,
            &hints,
            5,
        );
        assert_eq!(params["selectors"], json!({"likeButton": "#like"}));
    }

    #[test]
    fn observation_mentions_saved_posts() {
        let text = describe_outcome(
            ActionName::ScrapePostsFromTarget,
            &ActionResult::ok("Successfully scraped 3 posts."),
            &Merge::Scraped { count: 3 },
        );
        assert_eq!(
            text,
            "Action 'scrapePostsFromTarget' completed. Outcome: Successfully scraped 3 posts. I have saved 3 posts to my memory."
        );
    }

    #[test]
    fn panic_payloads_become_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }
}
