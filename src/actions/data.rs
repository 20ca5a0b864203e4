use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::{ActionName, Operation, Pacing, decode_args, selector_or};
use crate::page::{ElementSnapshot, Page};
use crate::types::{ActionResult, Parameters, ScrapedItem};

const DEFAULT_POST_CONTAINER: &str = r#"div[role="feed"] div[role="article"]"#;
const CONTAINER_TIMEOUT: Duration = Duration::from_secs(5);
const POST_TEXT_MAX_CHARS: usize = 500;

const POST_LINK_MARKERS: [&str; 3] = ["/posts/", "/permalink/", "story_fbid="];
const PROFILE_LINK_MARKERS: [&str; 3] = ["/user/", "profile.php", "/people/"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScrapeArgs {
    #[serde(default)]
    count: Option<u64>,
    #[serde(default)]
    selectors: Option<BTreeMap<String, String>>,
}

/// Reads posts from the open feed.
pub struct ScrapePosts {
    pacing: Pacing,
}

impl ScrapePosts {
    pub fn new(pacing: Pacing) -> Self {
        Self { pacing }
    }
}

#[async_trait]
impl Operation for ScrapePosts {
    fn name(&self) -> ActionName {
        ActionName::ScrapePostsFromTarget
    }

    async fn run(&self, page: &dyn Page, params: &Parameters) -> ActionResult {
        let args: ScrapeArgs = match decode_args(self.name(), params) {
            Ok(args) => args,
            Err(message) => return ActionResult::fail(message),
        };
        let count = match args.count {
            Some(n) if n > 0 => n as usize,
            _ => {
                return ActionResult::fail(
                    "Invalid parameter: count must be a positive number.",
                );
            }
        };
        let container = selector_or(&args.selectors, "postContainer", DEFAULT_POST_CONTAINER);
        info!(count, container, "scraping posts");

        if let Err(e) = page.wait_for(container, CONTAINER_TIMEOUT).await {
            warn!(container, error = %format!("{e:#}"), "post containers never appeared");
            return ActionResult::fail(format!(
                "Selector issue or critical error during scraping: {e:#}"
            ));
        }
        let snapshots = match page.snapshot_all(container, count).await {
            Ok(s) => s,
            Err(e) => {
                return ActionResult::fail(format!(
                    "Selector issue or critical error during scraping: {e:#}"
                ));
            }
        };
        if snapshots.is_empty() {
            return ActionResult::fail("Selector issue: No post containers found on the page.");
        }

        let items: Vec<ScrapedItem> = snapshots.iter().filter_map(to_item).collect();
        if items.is_empty() {
            return ActionResult::fail(format!(
                "Found {} post containers but none carried a post link.",
                snapshots.len()
            ));
        }
        self.pacing.pause().await;

        let data = match serde_json::to_value(&items) {
            Ok(v) => v,
            Err(e) => return ActionResult::fail(format!("Could not encode scraped posts: {e}")),
        };
        ActionResult::ok(format!("Successfully scraped {} posts.", items.len())).with_data(data)
    }
}

fn to_item(snapshot: &ElementSnapshot) -> Option<ScrapedItem> {
    let url = first_link_with(&snapshot.links, &POST_LINK_MARKERS)?;
    Some(ScrapedItem {
        url,
        text: snapshot
            .text
            .trim()
            .chars()
            .take(POST_TEXT_MAX_CHARS)
            .collect(),
        author_profile_url: first_link_with(&snapshot.links, &PROFILE_LINK_MARKERS),
    })
}

fn first_link_with(links: &[String], markers: &[&str]) -> Option<String> {
    links
        .iter()
        .find(|l| markers.iter().any(|m| l.contains(m)))
        .cloned()
}
