use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::actions::ActionName;

/// Parameters exchanged with the model and handed to operations.
pub type Parameters = Map<String, Value>;

/// One unit of work fetched from the backend. Never mutated once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Parameters,
    #[serde(default)]
    pub execution_context: ExecutionContext,
}

/// Which browser profile and which account/persona a task runs as.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub persona_id: Option<String>,
}

impl ExecutionContext {
    /// The browser profile to open, if the task names a non-blank one.
    pub fn profile(&self) -> Option<&str> {
        self.profile_id
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

/// A post captured by the scraping operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapedItem {
    #[serde(alias = "postUrl")]
    pub url: String,
    #[serde(default, alias = "textContent")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_profile_url: Option<String>,
}

/// Task-scoped working memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub scraped_items: Vec<ScrapedItem>,
    pub interacted_item_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Task,
    Decision,
    Observation,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Task => "TASK",
            Role::Decision => "DECISION",
            Role::Observation => "OBSERVATION",
        })
    }
}

/// A line in the transcript sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
}

impl HistoryEntry {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

/// The model's decision for one step, after structural validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub thought: String,
    pub action: ActionName,
    pub parameters: Parameters,
}

/// What every operation hands back to the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_selectors: Option<BTreeMap<String, String>>,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            new_selectors: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            new_selectors: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_selectors(mut self, selectors: BTreeMap<String, String>) -> Self {
        self.new_selectors = Some(selectors);
        self
    }
}

/// Forensic record submitted once when a task fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub account_id: Option<String>,
    pub persona_id: Option<String>,
    pub task: String,
    pub failed_action: String,
    pub error_message: String,
    pub page_url: String,
    pub html_snapshot: String,
    pub screenshot_base64: String,
}

pub const DEFAULT_MAX_STEPS: usize = 15;
pub const DEFAULT_HISTORY_LIMIT: usize = 10;
pub const DEFAULT_SCRAPE_COUNT: u64 = 5;
pub const NO_THOUGHT: &str = "No thought provided.";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_decodes_backend_shape() {
        let task: Task = serde_json::from_value(json!({
            "taskId": "t-1",
            "type": "SCRAPE_AND_LIKE",
            "payload": {"groupName": "G"},
            "executionContext": {"profileId": "k1470xgl", "accountId": "a", "personaId": "p"}
        }))
        .unwrap();

        assert_eq!(task.kind, "SCRAPE_AND_LIKE");
        assert_eq!(task.execution_context.profile(), Some("k1470xgl"));
        assert_eq!(task.payload["groupName"], "G");
    }

    #[test]
    fn blank_profile_counts_as_missing() {
        let ctx = ExecutionContext {
            profile_id: Some("   ".into()),
            ..Default::default()
        };
        assert_eq!(ctx.profile(), None);
    }

    #[test]
    fn scraped_item_accepts_post_field_names() {
        let item: ScrapedItem =
            serde_json::from_value(json!({"postUrl": "u", "textContent": "hi"})).unwrap();
        assert_eq!(item.url, "u");
        assert_eq!(item.text, "hi");

        let bare: ScrapedItem = serde_json::from_value(json!({"url": "a"})).unwrap();
        assert!(bare.text.is_empty());
    }

    #[test]
    fn action_result_omits_absent_fields() {
        let v = serde_json::to_value(ActionResult::ok("done")).unwrap();
        assert_eq!(v, json!({"success": true, "message": "done"}));
    }
}
