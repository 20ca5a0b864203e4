//! Turns raw model text into a validated `Command`.

use serde_json::Value;

use crate::actions::ActionRegistry;
use crate::error::{ParseError, ParseFailure};
use crate::types::{Command, NO_THOUGHT};

const FENCE: &str = "```";
const JSON_TAG: &str = "json";

/// Parse one reply. Total: every input yields a `Command` or a `ParseFailure`.
pub fn parse(raw: &str, registry: &ActionRegistry) -> Result<Command, ParseFailure> {
    parse_inner(raw, registry).map_err(|error| ParseFailure::new(error, raw))
}

fn parse_inner(raw: &str, registry: &ActionRegistry) -> Result<Command, ParseError> {
    let body = json_block(raw).ok_or(ParseError::MissingJsonBlock)?;
    let decoded: Value =
        serde_json::from_str(body).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    let Value::Object(mut decision) = decoded else {
        return Err(ParseError::NotAnObject);
    };

    let name = decision
        .get("action")
        .and_then(Value::as_str)
        .map(str::trim)
        .ok_or(ParseError::MissingAction)?;
    let action = registry
        .resolve(name)
        .ok_or_else(|| ParseError::UnknownAction(name.to_string()))?;

    let parameters = match decision.remove("parameters") {
        None => return Err(ParseError::MissingParameters),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(ParseError::ParametersNotObject),
    };
    let parameters = action.validate(&parameters)?;

    let thought = decision
        .get("thought")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(NO_THOUGHT)
        .to_string();

    Ok(Command {
        thought,
        action,
        parameters,
    })
}

/// Contents of the first fenced block tagged `json`.
fn json_block(raw: &str) -> Option<&str> {
    let mut rest = raw;
    while let Some(open) = rest.find(FENCE) {
        let after_fence = &rest[open + FENCE.len()..];
        let line_end = after_fence.find('\n')?;
        let tag = after_fence[..line_end].trim();
        let body_and_tail = &after_fence[line_end + 1..];
        let close = body_and_tail.find(FENCE)?;
        if tag == JSON_TAG {
            return Some(&body_and_tail[..close]);
        }
        rest = &body_and_tail[close + FENCE.len()..];
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionName, Pacing};

    fn registry() -> ActionRegistry {
        ActionRegistry::standard(Pacing::none(), None)
    }

    fn reply(json: &str) -> String {
        format!("Sure, here is my decision.\n```json\n{json}\n```\nDone.")
    }

    #[test]
    fn parses_a_well_formed_reply() {
        let raw = reply(
            r#"{"thought": "scrape first", "action": "scrapePostsFromTarget", "parameters": {"count": 3}}"#,
        );
        let cmd = parse(&raw, &registry()).unwrap();
        assert_eq!(cmd.action, ActionName::ScrapePostsFromTarget);
        assert_eq!(cmd.thought, "scrape first");
        assert_eq!(cmd.parameters["count"], 3);
    }

    #[test]
    fn missing_thought_gets_placeholder() {
        let raw = reply(r#"{"action": "likePost", "parameters": {}}"#);
        let cmd = parse(&raw, &registry()).unwrap();
        assert_eq!(cmd.thought, NO_THOUGHT);
        assert!(cmd.parameters.is_empty());
    }

    #[test]
    fn rejects_json_outside_a_fenced_block() {
        let raw = r#"{"thought": "t", "action": "likePost", "parameters": {}}"#;
        let err = parse(raw, &registry()).unwrap_err();
        assert_eq!(err.error, ParseError::MissingJsonBlock);
        assert_eq!(err.raw, raw);
    }

    #[test]
    fn rejects_blocks_with_other_tags() {
        let raw = "```js\n{\"action\": \"likePost\", \"parameters\": {}}\n```";
        assert_eq!(
            parse(raw, &registry()).unwrap_err().error,
            ParseError::MissingJsonBlock
        );
    }

    #[test]
    fn skips_untagged_block_before_json_block() {
        let raw = "```\nnot this\n```\n```json\n{\"action\": \"finish_task\", \"parameters\": {}}\n```";
        assert_eq!(
            parse(raw, &registry()).unwrap().action,
            ActionName::FinishTask
        );
    }

    #[test]
    fn rejects_unregistered_action() {
        let raw = reply(r#"{"action": "deleteAccount", "parameters": {}}"#);
        let err = parse(&raw, &registry()).unwrap_err();
        assert_eq!(err.error, ParseError::UnknownAction("deleteAccount".into()));
    }

    #[test]
    fn rejects_omitted_parameters() {
        let raw = reply(r#"{"thought": "t", "action": "likePost"}"#);
        assert_eq!(
            parse(&raw, &registry()).unwrap_err().error,
            ParseError::MissingParameters
        );

        let raw = reply(r#"{"action": "likePost", "parameters": null}"#);
        assert_eq!(
            parse(&raw, &registry()).unwrap_err().error,
            ParseError::ParametersNotObject
        );
    }

    #[test]
    fn rejects_undecodable_and_non_object_json() {
        let raw = reply(r#"{"action": "likePost", "parameters": {"#);
        assert!(matches!(
            parse(&raw, &registry()).unwrap_err().error,
            ParseError::InvalidJson(_)
        ));
        let raw = reply("[1, 2]");
        assert_eq!(
            parse(&raw, &registry()).unwrap_err().error,
            ParseError::NotAnObject
        );
        let raw = reply(r#"{"action": 7, "parameters": {}}"#);
        assert_eq!(
            parse(&raw, &registry()).unwrap_err().error,
            ParseError::MissingAction
        );
    }

    #[test]
    fn rejects_mistyped_parameters() {
        let raw = reply(r#"{"action": "commentOnPost", "parameters": {"commentText": 5}}"#);
        assert!(matches!(
            parse(&raw, &registry()).unwrap_err().error,
            ParseError::InvalidParameters { .. }
        ));
    }

    #[test]
    fn is_total_over_odd_inputs() {
        for raw in ["", "```", "```json", "```json\n", "```json\n{}", "\u{0}```json\n{}\n```"] {
            assert!(parse(raw, &registry()).is_err(), "{raw:?}");
        }
    }
}
