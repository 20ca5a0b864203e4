//! Renders the text the completion provider sees each step.

use std::fmt::Write as _;

use serde::Serialize;

use crate::actions::ActionRegistry;
use crate::state::History;
use crate::types::{AgentState, Task};

const PREAMBLE: &str = "You are a logical browser agent working on a social-media site. \
Your ONLY job is to choose the single next action to perform.";

const PLAN: &str = "Plan:
- If you need to be in the group and are not, choose navigateToGroup.
- If you are in the group but have no posts in memory, choose scrapePostsFromTarget.
- If memory holds posts you have not interacted with, choose the interaction the task asks for.
- If every post in memory has been handled, scrape again or finish.
- When the task is done, choose finish_task.";

const GRAMMAR: &str = "Reply with exactly one fenced code block tagged json, containing one object:
```json
{\"thought\": \"<why>\", \"action\": \"<one action name above>\", \"parameters\": {}}
```
\"parameters\" is required and may be empty. Parameters marked (agent) are filled in by the agent; leave them out.";

/// Deterministic prompt rendering over a fixed registry.
pub struct PromptBuilder<'a> {
    registry: &'a ActionRegistry,
}

impl<'a> PromptBuilder<'a> {
    pub fn new(registry: &'a ActionRegistry) -> Self {
        Self { registry }
    }

    /// Same inputs, same string. Nothing here reads clocks, randomness or I/O.
    pub fn build(
        &self,
        task: &Task,
        history: &History,
        state: &AgentState,
        last_observation: &str,
    ) -> String {
        let mut out = String::new();
        out.push_str(PREAMBLE);
        out.push_str("\n\n## STANDARD OPERATING PROCEDURE\nAvailable actions:\n");
        self.render_actions(&mut out);
        out.push('\n');
        out.push_str(PLAN);
        out.push_str("\n\n");
        out.push_str(GRAMMAR);

        let _ = write!(
            out,
            "\n\n## TASK\ntype: {}\npayload: {}\n",
            task.kind,
            to_json(&task.payload)
        );

        out.push_str("\n## HISTORY\n");
        if history.is_empty() {
            out.push_str("(empty)\n");
        }
        for (i, entry) in history.iter().enumerate() {
            let _ = writeln!(out, "{}. [{}] {}", i + 1, entry.role, entry.text);
        }

        let _ = write!(out, "\n## WORKING MEMORY\n{}\n", to_json(state));
        let _ = write!(out, "\n## LAST OBSERVATION\n{last_observation}\n");
        out.push_str("\n## YOUR RESPONSE\n");
        out
    }

    fn render_actions(&self, out: &mut String) {
        for action in self.registry.names() {
            let _ = writeln!(out, "- {}: {}", action, action.description());
            let params: Vec<String> = action
                .params()
                .iter()
                .map(|p| {
                    let origin = if p.agent_supplied { ", agent" } else { "" };
                    format!("{} ({}{}): {}", p.name, p.kind, origin, p.description)
                })
                .collect();
            if params.is_empty() {
                out.push_str("  parameters: none\n");
            } else {
                let _ = writeln!(out, "  parameters: {}", params.join("; "));
            }
            let _ = writeln!(out, "  example: {}", action.example());
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionName, Pacing};
    use crate::types::{HistoryEntry, Role, ScrapedItem};
    use serde_json::json;

    fn task() -> Task {
        serde_json::from_value(json!({
            "taskId": "t",
            "type": "SCRAPE_AND_LIKE",
            "payload": {"groupName": "G", "commentText": "hi"},
            "executionContext": {"profileId": "p"}
        }))
        .unwrap()
    }

    fn history() -> History {
        let mut h = History::new(10);
        h.record(HistoryEntry::new(Role::Task, "engage with G"));
        h.record(HistoryEntry::new(Role::Observation, "on the homepage"));
        h
    }

    #[test]
    fn identical_inputs_render_identically() {
        let registry = ActionRegistry::standard(Pacing::none(), None);
        let builder = PromptBuilder::new(&registry);
        let mut state = AgentState::default();
        state.scraped_items.push(ScrapedItem {
            url: "a".into(),
            text: "x".into(),
            author_profile_url: None,
        });
        state.interacted_item_ids.insert("b".into());
        state.interacted_item_ids.insert("a".into());

        let first = builder.build(&task(), &history(), &state, "obs");
        let second = builder.build(&task(), &history(), &state.clone(), "obs");
        assert_eq!(first, second);
    }

    #[test]
    fn sections_appear_in_order() {
        let registry = ActionRegistry::standard(Pacing::none(), None);
        let prompt =
            PromptBuilder::new(&registry).build(&task(), &history(), &AgentState::default(), "obs");

        let sop = prompt.find("## STANDARD OPERATING PROCEDURE").unwrap();
        let task_at = prompt.find("## TASK").unwrap();
        let hist = prompt.find("## HISTORY").unwrap();
        let mem = prompt.find("## WORKING MEMORY").unwrap();
        assert!(sop < task_at && task_at < hist && hist < mem);

        for action in ActionName::ALL {
            assert!(prompt.contains(&format!("- {action}: ")), "{action} missing");
        }
        assert!(prompt.contains("```json"));
        assert!(prompt.contains("type: SCRAPE_AND_LIKE"));
        assert!(prompt.contains(r#""groupName":"G""#));
        assert!(prompt.contains("1. [TASK] engage with G\n2. [OBSERVATION] on the homepage"));
    }
}
