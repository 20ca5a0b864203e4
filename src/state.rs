//! Task-scoped working memory and the bounded transcript.

use std::collections::VecDeque;

use tracing::debug;

use crate::actions::ActionName;
use crate::error::StateError;
use crate::types::{ActionResult, AgentState, HistoryEntry, ScrapedItem};

/// Most-recent-N transcript; the oldest entries fall off first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit),
            limit: limit.max(1),
        }
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// What folding a result into memory changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Merge {
    Unchanged,
    Scraped { count: usize },
    Interacted { id: String },
}

/// Owns `AgentState` and `History` for exactly one task execution.
#[derive(Debug, Clone)]
pub struct StateStore {
    state: AgentState,
    history: History,
}

impl StateStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: AgentState::default(),
            history: History::new(history_limit),
        }
    }

    /// Clear memory and transcript together.
    pub fn reset(&mut self) {
        self.state = AgentState::default();
        self.history.clear();
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        self.history.record(entry);
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// First scraped item, in scrape order, that has not been acted on yet.
    pub fn resolve_target(&self) -> Option<&ScrapedItem> {
        self.state
            .scraped_items
            .iter()
            .find(|item| !self.state.interacted_item_ids.contains(&item.url))
    }

    /// Fold a successful operation's outcome into memory.
    ///
    /// A scrape with a non-empty item list replaces `scraped_items` wholesale;
    /// a successful interaction marks `target` as handled. Nothing else mutates state.
    pub fn merge_result(
        &mut self,
        action: ActionName,
        target: Option<&str>,
        result: &ActionResult,
    ) -> Result<Merge, StateError> {
        if !result.success {
            return Ok(Merge::Unchanged);
        }
        match action {
            ActionName::ScrapePostsFromTarget => {
                let Some(data) = result.data.as_ref().filter(|d| !is_empty_data(d)) else {
                    return Ok(Merge::Unchanged);
                };
                let items: Vec<ScrapedItem> = serde_json::from_value(data.clone())
                    .map_err(|e| StateError::MalformedItems(e.to_string()))?;
                let count = items.len();
                self.state.scraped_items = items;
                debug!(count, "working memory replaced with scraped items");
                Ok(Merge::Scraped { count })
            }
            a if a.is_interaction() => {
                let id = target.ok_or_else(|| StateError::MissingTarget {
                    action: a.to_string(),
                })?;
                self.state.interacted_item_ids.insert(id.to_string());
                Ok(Merge::Interacted { id: id.to_string() })
            }
            _ => Ok(Merge::Unchanged),
        }
    }
}

fn is_empty_data(data: &serde_json::Value) -> bool {
    match data {
        serde_json::Value::Null => true,
        serde_json::Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use serde_json::json;

    fn scrape(urls: &[&str]) -> ActionResult {
        let data: Vec<_> = urls.iter().map(|u| json!({"url": u})).collect();
        ActionResult::ok("scraped").with_data(json!(data))
    }

    fn urls(store: &StateStore) -> Vec<&str> {
        store
            .state()
            .scraped_items
            .iter()
            .map(|i| i.url.as_str())
            .collect()
    }

    #[test]
    fn history_keeps_most_recent_entries_in_order() {
        let mut history = History::new(3);
        for i in 0..7 {
            history.record(HistoryEntry::new(Role::Observation, format!("e{i}")));
            assert!(history.len() <= 3);
        }
        let texts: Vec<_> = history.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["e4", "e5", "e6"]);
    }

    #[test]
    fn history_under_bound_is_untouched() {
        let mut history = History::new(5);
        history.record(HistoryEntry::new(Role::Task, "a"));
        history.record(HistoryEntry::new(Role::Decision, "b"));
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().next().unwrap().role, Role::Task);
    }

    #[test]
    fn scrape_replaces_items_wholesale() {
        let mut store = StateStore::new(10);
        store
            .merge_result(ActionName::ScrapePostsFromTarget, None, &scrape(&["old"]))
            .unwrap();
        let merge = store
            .merge_result(ActionName::ScrapePostsFromTarget, None, &scrape(&["a", "b"]))
            .unwrap();
        assert_eq!(merge, Merge::Scraped { count: 2 });
        assert_eq!(urls(&store), vec!["a", "b"]);
    }

    #[test]
    fn empty_or_failed_scrape_keeps_memory() {
        let mut store = StateStore::new(10);
        store
            .merge_result(ActionName::ScrapePostsFromTarget, None, &scrape(&["a"]))
            .unwrap();
        store
            .merge_result(ActionName::ScrapePostsFromTarget, None, &scrape(&[]))
            .unwrap();
        let mut failed = scrape(&["z"]);
        failed.success = false;
        store
            .merge_result(ActionName::ScrapePostsFromTarget, None, &failed)
            .unwrap();
        assert_eq!(urls(&store), vec!["a"]);
    }

    #[test]
    fn malformed_scrape_data_is_rejected() {
        let mut store = StateStore::new(10);
        let bad = ActionResult::ok("scraped").with_data(json!([{"text": "no url"}]));
        assert!(matches!(
            store.merge_result(ActionName::ScrapePostsFromTarget, None, &bad),
            Err(StateError::MalformedItems(_))
        ));
        assert!(store.state().scraped_items.is_empty());
    }

    #[test]
    fn target_resolution_skips_interacted_items() {
        let mut store = StateStore::new(10);
        store
            .merge_result(ActionName::ScrapePostsFromTarget, None, &scrape(&["a", "b"]))
            .unwrap();
        store
            .merge_result(ActionName::LikePost, Some("a"), &ActionResult::ok("liked"))
            .unwrap();
        assert_eq!(store.resolve_target().unwrap().url, "b");

        store
            .merge_result(ActionName::SendFriendRequest, Some("b"), &ActionResult::ok("sent"))
            .unwrap();
        assert!(store.resolve_target().is_none());
    }

    #[test]
    fn non_state_actions_and_failed_interactions_change_nothing() {
        let mut store = StateStore::new(10);
        assert_eq!(
            store
                .merge_result(ActionName::NavigateToGroup, None, &ActionResult::ok("ok"))
                .unwrap(),
            Merge::Unchanged
        );
        store
            .merge_result(ActionName::CommentOnPost, Some("a"), &ActionResult::fail("no"))
            .unwrap();
        assert!(store.state().interacted_item_ids.is_empty());
    }

    #[test]
    fn reset_clears_state_and_history() {
        let mut store = StateStore::new(10);
        store.record(HistoryEntry::new(Role::Task, "t"));
        store
            .merge_result(ActionName::ScrapePostsFromTarget, None, &scrape(&["a"]))
            .unwrap();
        store.reset();
        assert!(store.history().is_empty());
        assert_eq!(store.state(), &AgentState::default());
    }
}
