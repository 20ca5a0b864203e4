//! The closed set of operations the model may choose from, their parameter
//! schemas, and the registry that binds each name to an implementation.

pub mod data;
pub mod interaction;
pub mod navigation;
pub mod system;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::brain::CompletionProvider;
use crate::error::ParseError;
use crate::page::Page;
use crate::types::{ActionResult, Parameters};

pub use data::ScrapePosts;
pub use interaction::{CommentOnPost, LikePost, SendFriendRequest};
pub use navigation::NavigateToGroup;
pub use system::FinishTask;

/// Every operation the agent knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActionName {
    NavigateToGroup,
    ScrapePostsFromTarget,
    LikePost,
    CommentOnPost,
    SendFriendRequest,
    FinishTask,
}

impl ActionName {
    pub const ALL: [ActionName; 6] = [
        ActionName::NavigateToGroup,
        ActionName::ScrapePostsFromTarget,
        ActionName::LikePost,
        ActionName::CommentOnPost,
        ActionName::SendFriendRequest,
        ActionName::FinishTask,
    ];

    /// Wire name used in prompts and model replies.
    pub fn as_str(self) -> &'static str {
        match self {
            ActionName::NavigateToGroup => "navigateToGroup",
            ActionName::ScrapePostsFromTarget => "scrapePostsFromTarget",
            ActionName::LikePost => "likePost",
            ActionName::CommentOnPost => "commentOnPost",
            ActionName::SendFriendRequest => "sendFriendRequest",
            ActionName::FinishTask => "finish_task",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == name)
    }

    /// Actions whose target post is chosen by the loop from working memory.
    pub fn is_interaction(self) -> bool {
        matches!(
            self,
            ActionName::LikePost | ActionName::CommentOnPost | ActionName::SendFriendRequest
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            ActionName::NavigateToGroup => "Search for the task's group and open it.",
            ActionName::ScrapePostsFromTarget => {
                "Read the latest posts of the open group into memory."
            }
            ActionName::LikePost => "Like the next post in memory you have not interacted with.",
            ActionName::CommentOnPost => {
                "Comment on the next post in memory you have not interacted with."
            }
            ActionName::SendFriendRequest => {
                "Send a friend request to the author of the next untouched post."
            }
            ActionName::FinishTask => "Declare the task finished.",
        }
    }

    pub fn params(self) -> &'static [ParamSpec] {
        const GROUP: ParamSpec = ParamSpec::agent("groupName", ParamKind::String, "group to open");
        const COUNT: ParamSpec =
            ParamSpec::agent("count", ParamKind::PositiveInteger, "posts to read");
        const SELECTORS: ParamSpec =
            ParamSpec::agent("selectors", ParamKind::StringMap, "selector overrides");
        const POST_URL: ParamSpec =
            ParamSpec::agent("postUrl", ParamKind::String, "target post, chosen from memory");
        const COMMENT: ParamSpec =
            ParamSpec::model("commentText", ParamKind::String, "comment to write");
        const SUCCESS: ParamSpec =
            ParamSpec::model("success", ParamKind::Bool, "whether the task was achieved");
        const MESSAGE: ParamSpec =
            ParamSpec::model("message", ParamKind::String, "short summary");

        const GENERATE: ParamSpec = ParamSpec::agent(
            "generateSmartComment",
            ParamKind::Bool,
            "write a comment from the post text",
        );
        const POST_TEXT: ParamSpec =
            ParamSpec::agent("postText", ParamKind::String, "text of the target post");
        const AUTHOR: ParamSpec = ParamSpec::agent(
            "authorProfileUrl",
            ParamKind::String,
            "profile of the post author",
        );

        const NAVIGATE: &[ParamSpec] = &[GROUP];
        const SCRAPE: &[ParamSpec] = &[COUNT, SELECTORS];
        const LIKE: &[ParamSpec] = &[POST_URL, SELECTORS];
        const COMMENT_ON: &[ParamSpec] = &[POST_URL, COMMENT, GENERATE, POST_TEXT, SELECTORS];
        const BEFRIEND: &[ParamSpec] = &[POST_URL, AUTHOR, SELECTORS];
        const FINISH: &[ParamSpec] = &[SUCCESS, MESSAGE];

        match self {
            ActionName::NavigateToGroup => NAVIGATE,
            ActionName::ScrapePostsFromTarget => SCRAPE,
            ActionName::LikePost => LIKE,
            ActionName::CommentOnPost => COMMENT_ON,
            ActionName::SendFriendRequest => BEFRIEND,
            ActionName::FinishTask => FINISH,
        }
    }

    /// One example reply for the prompt.
    pub fn example(self) -> Value {
        let parameters = match self {
            ActionName::NavigateToGroup => json!({}),
            ActionName::ScrapePostsFromTarget => json!({}),
            ActionName::LikePost => json!({}),
            ActionName::CommentOnPost => json!({"commentText": "Thanks for sharing!"}),
            ActionName::SendFriendRequest => json!({}),
            ActionName::FinishTask => json!({"success": true, "message": "Engagement done."}),
        };
        json!({
            "thought": format!("The next step is {}.", self.as_str()),
            "action": self.as_str(),
            "parameters": parameters,
        })
    }

    /// Type-check the supplied parameters and drop keys this action does not know.
    pub fn validate(self, params: &Parameters) -> Result<Parameters, ParseError> {
        let mut accepted = Parameters::new();
        for spec in self.params() {
            let Some(value) = params.get(spec.name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            if !spec.kind.accepts(value) {
                return Err(ParseError::InvalidParameters {
                    action: self.as_str().to_string(),
                    message: format!("`{}` must be {}", spec.name, spec.kind),
                });
            }
            accepted.insert(spec.name.to_string(), value.clone());
        }
        Ok(accepted)
    }
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    PositiveInteger,
    Bool,
    StringMap,
}

impl ParamKind {
    pub(crate) fn accepts(self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::PositiveInteger => value.as_u64().is_some_and(|n| n > 0),
            ParamKind::Bool => value.is_boolean(),
            ParamKind::StringMap => value
                .as_object()
                .is_some_and(|m| m.values().all(Value::is_string)),
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParamKind::String => "a string",
            ParamKind::PositiveInteger => "a positive integer",
            ParamKind::Bool => "a boolean",
            ParamKind::StringMap => "an object of strings",
        })
    }
}

/// One parameter in an action's schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    /// Filled in by the agent itself; the model may leave it out.
    pub agent_supplied: bool,
    pub description: &'static str,
}

impl ParamSpec {
    const fn agent(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            agent_supplied: true,
            description,
        }
    }

    const fn model(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            agent_supplied: false,
            description,
        }
    }
}

/// A side-effecting step. Failures are reported in the result, never as `Err`.
#[async_trait]
pub trait Operation: Send + Sync {
    fn name(&self) -> ActionName;

    async fn run(&self, page: &dyn Page, params: &Parameters) -> ActionResult;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no operation registered for {0}")]
    Missing(ActionName),
    #[error("{0} registered twice")]
    Duplicate(ActionName),
}

/// Name → operation table, fixed once built.
pub struct ActionRegistry {
    operations: BTreeMap<ActionName, Box<dyn Operation>>,
}

impl ActionRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// The built-in operations. `comment_writer` backs smart comments when present.
    pub fn standard(pacing: Pacing, comment_writer: Option<Arc<dyn CompletionProvider>>) -> Self {
        let mut operations: BTreeMap<ActionName, Box<dyn Operation>> = BTreeMap::new();
        operations.insert(
            ActionName::NavigateToGroup,
            Box::new(NavigateToGroup::new(pacing)),
        );
        operations.insert(
            ActionName::ScrapePostsFromTarget,
            Box::new(ScrapePosts::new(pacing)),
        );
        operations.insert(ActionName::LikePost, Box::new(LikePost::new(pacing)));
        operations.insert(
            ActionName::CommentOnPost,
            Box::new(CommentOnPost::new(pacing, comment_writer)),
        );
        operations.insert(
            ActionName::SendFriendRequest,
            Box::new(SendFriendRequest::new(pacing)),
        );
        operations.insert(ActionName::FinishTask, Box::new(FinishTask));
        Self { operations }
    }

    /// Resolve a wire name; `None` is the "no such action" outcome.
    pub fn resolve(&self, name: &str) -> Option<ActionName> {
        ActionName::from_wire(name).filter(|a| self.operations.contains_key(a))
    }

    pub fn get(&self, name: ActionName) -> Option<&dyn Operation> {
        self.operations.get(&name).map(|op| op.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = ActionName> + '_ {
        self.operations.keys().copied()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    operations: BTreeMap<ActionName, Box<dyn Operation>>,
    duplicate: Option<ActionName>,
}

impl RegistryBuilder {
    pub fn register(mut self, op: impl Operation + 'static) -> Self {
        let name = op.name();
        if self.operations.insert(name, Box::new(op)).is_some() {
            self.duplicate.get_or_insert(name);
        }
        self
    }

    /// Fails unless every `ActionName` has exactly one operation.
    pub fn build(self) -> Result<ActionRegistry, RegistryError> {
        if let Some(name) = self.duplicate {
            return Err(RegistryError::Duplicate(name));
        }
        if let Some(missing) = ActionName::ALL
            .into_iter()
            .find(|a| !self.operations.contains_key(a))
        {
            return Err(RegistryError::Missing(missing));
        }
        Ok(ActionRegistry {
            operations: self.operations,
        })
    }
}

/// Random human-like pause between browser interactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub min: Duration,
    pub max: Duration,
}

impl Pacing {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn sample(&self) -> Duration {
        let spread = self.max.saturating_sub(self.min);
        self.min + spread.mul_f64(rand::random::<f64>())
    }

    pub async fn pause(&self) {
        let delay = self.sample();
        if delay.is_zero() {
            return;
        }
        debug!(delay_ms = delay.as_millis() as u64, "pacing pause");
        tokio::time::sleep(delay).await;
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(3000))
    }
}

/// Decode an operation's typed arguments out of its parameter map.
pub(crate) fn decode_args<T: DeserializeOwned>(
    action: ActionName,
    params: &Parameters,
) -> Result<T, String> {
    serde_json::from_value(Value::Object(params.clone()))
        .map_err(|e| format!("Action failed: invalid parameters for {action}: {e}"))
}

/// Selector overrides handed down by the vision fallback.
pub(crate) fn selector_or<'a>(
    hints: &'a Option<BTreeMap<String, String>>,
    key: &str,
    default: &'a str,
) -> &'a str {
    hints
        .as_ref()
        .and_then(|h| h.get(key))
        .map(String::as_str)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::NoopOperation;

    #[test]
    fn wire_names_round_trip() {
        for action in ActionName::ALL {
            assert_eq!(ActionName::from_wire(action.as_str()), Some(action));
        }
        assert_eq!(ActionName::from_wire("likepost"), None);
    }

    #[test]
    fn validate_rejects_wrong_types_and_drops_unknown_keys() {
        let params: Parameters = serde_json::from_value(json!({
            "count": 3,
            "whatever": "x"
        }))
        .unwrap();
        let accepted = ActionName::ScrapePostsFromTarget.validate(&params).unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted["count"], 3);

        let bad: Parameters = serde_json::from_value(json!({"count": "three"})).unwrap();
        let err = ActionName::ScrapePostsFromTarget.validate(&bad).unwrap_err();
        assert!(matches!(err, ParseError::InvalidParameters { .. }));

        let zero: Parameters = serde_json::from_value(json!({"count": 0})).unwrap();
        assert!(ActionName::ScrapePostsFromTarget.validate(&zero).is_err());
    }

    #[test]
    fn builder_requires_every_action() {
        let err = ActionRegistry::builder()
            .register(NoopOperation::new(ActionName::FinishTask))
            .build()
            .err()
            .unwrap();
        assert_eq!(err, RegistryError::Missing(ActionName::NavigateToGroup));

        let mut builder = ActionRegistry::builder();
        for action in ActionName::ALL {
            builder = builder.register(NoopOperation::new(action));
        }
        let registry = builder.build().unwrap();
        assert_eq!(registry.names().count(), ActionName::ALL.len());
        assert_eq!(registry.resolve("finish_task"), Some(ActionName::FinishTask));
        assert_eq!(registry.resolve("teleport"), None);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut builder = ActionRegistry::builder().register(NoopOperation::new(ActionName::LikePost));
        for action in ActionName::ALL {
            builder = builder.register(NoopOperation::new(action));
        }
        assert_eq!(
            builder.build().err(),
            Some(RegistryError::Duplicate(ActionName::LikePost))
        );
    }

    #[test]
    fn standard_registry_is_complete() {
        let registry = ActionRegistry::standard(Pacing::none(), None);
        for action in ActionName::ALL {
            assert_eq!(registry.get(action).map(|op| op.name()), Some(action));
        }
    }

    #[test]
    fn pacing_stays_in_range() {
        let pacing = Pacing::new(Duration::from_millis(10), Duration::from_millis(20));
        for _ in 0..50 {
            let d = pacing.sample();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
        assert_eq!(Pacing::none().sample(), Duration::ZERO);
    }
}
