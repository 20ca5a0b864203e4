//! Failure taxonomy for task execution and the polling transport.

use std::fmt;

use thiserror::Error;

/// Why a task ended in `FAILED`. Every kind is task-fatal and produces a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Task validation, AI configuration or browser acquisition failed.
    Initialization,
    /// The model returned nothing, or nothing parseable.
    ReasoningFailure,
    /// The model named an action that is not registered.
    UnknownAction,
    /// A registered operation reported `success: false`.
    OperationFailure,
    /// The step bound ran out before `finish_task`.
    StepLimitExhausted,
}

impl FailureKind {
    /// Synthetic `failedAction` label for failures that did not come from an invoked operation.
    pub fn label(self) -> &'static str {
        match self {
            FailureKind::Initialization => "INITIALIZATION",
            FailureKind::ReasoningFailure => "AI_REASONING_FAILURE",
            FailureKind::UnknownAction => "UNKNOWN_ACTION",
            FailureKind::OperationFailure => "OPERATION_FAILURE",
            FailureKind::StepLimitExhausted => "STEP_LIMIT_EXCEEDED",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Initialization => "initialization",
            FailureKind::ReasoningFailure => "reasoning failure",
            FailureKind::UnknownAction => "unknown action",
            FailureKind::OperationFailure => "operation failure",
            FailureKind::StepLimitExhausted => "step limit exhausted",
        })
    }
}

/// Structural problems with a model reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("no ```json fenced block in reply")]
    MissingJsonBlock,
    #[error("json block does not decode: {0}")]
    InvalidJson(String),
    #[error("decision is not a JSON object")]
    NotAnObject,
    #[error("`action` is missing or not a string")]
    MissingAction,
    #[error("unknown action `{0}`")]
    UnknownAction(String),
    #[error("`parameters` is missing")]
    MissingParameters,
    #[error("`parameters` must be an object")]
    ParametersNotObject,
    #[error("invalid parameters for {action}: {message}")]
    InvalidParameters { action: String, message: String },
}

/// A reply that could not become a `Command`, with the raw text kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}")]
pub struct ParseFailure {
    pub error: ParseError,
    pub raw: String,
}

impl ParseFailure {
    pub fn new(error: ParseError, raw: &str) -> Self {
        Self {
            error,
            raw: raw.to_string(),
        }
    }

    /// Unregistered action names escalate as `UnknownAction`, everything else as a reasoning failure.
    pub fn kind(&self) -> FailureKind {
        match self.error {
            ParseError::UnknownAction(_) => FailureKind::UnknownAction,
            _ => FailureKind::ReasoningFailure,
        }
    }
}

/// Errors talking to the task backend.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("backend rejected credentials ({status})")]
    Unauthorized { status: u16 },
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("could not decode backend response: {0}")]
    Decode(String),
    #[error("invalid backend url: {0}")]
    Url(#[from] url::ParseError),
}

impl TransportError {
    /// Authentication failures stop the whole process; everything else is retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Unauthorized { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("scrape returned malformed items: {0}")]
    MalformedItems(String),
    #[error("{action} succeeded without a resolved target")]
    MissingTarget { action: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_action_parse_failures_escalate_as_unknown_action() {
        let failure = ParseFailure::new(ParseError::UnknownAction("fly".into()), "raw");
        assert_eq!(failure.kind(), FailureKind::UnknownAction);

        let failure = ParseFailure::new(ParseError::MissingJsonBlock, "raw");
        assert_eq!(failure.kind(), FailureKind::ReasoningFailure);
    }

    #[test]
    fn only_auth_errors_are_fatal() {
        assert!(TransportError::Unauthorized { status: 401 }.is_fatal());
        assert!(
            !TransportError::Status {
                status: 502,
                body: String::new()
            }
            .is_fatal()
        );
        assert!(!TransportError::Decode("x".into()).is_fatal());
    }
}
