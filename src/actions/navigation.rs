use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use super::{ActionName, Operation, Pacing, decode_args};
use crate::page::Page;
use crate::types::{ActionResult, Parameters};

const GROUP_SEARCH_URL: &str = "https://www.facebook.com/groups/search/groups/";
const GROUP_LINK: &str = r#"div[role="main"] a[href*="/groups/"]"#;
const GROUP_TITLE: &str = "h1";
const PAGE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NavigateArgs {
    #[serde(default)]
    group_name: Option<String>,
}

/// Finds a group through the site search and opens it.
pub struct NavigateToGroup {
    pacing: Pacing,
}

impl NavigateToGroup {
    pub fn new(pacing: Pacing) -> Self {
        Self { pacing }
    }

    async fn open_group(&self, page: &dyn Page, group_name: &str) -> Result<()> {
        let search = group_search_url(group_name)?;
        info!(group = group_name, "navigating to group search");
        page.goto(search.as_str()).await.context("open group search")?;

        page.click_with_text(GROUP_LINK, group_name, PAGE_TIMEOUT)
            .await
            .context("group link not found in search results")?;
        self.pacing.pause().await;

        page.wait_for_text(GROUP_TITLE, group_name, PAGE_TIMEOUT)
            .await
            .context("group page did not load")?;
        self.pacing.pause().await;
        Ok(())
    }
}

#[async_trait]
impl Operation for NavigateToGroup {
    fn name(&self) -> ActionName {
        ActionName::NavigateToGroup
    }

    async fn run(&self, page: &dyn Page, params: &Parameters) -> ActionResult {
        let args: NavigateArgs = match decode_args(self.name(), params) {
            Ok(args) => args,
            Err(message) => return ActionResult::fail(message),
        };
        let Some(group_name) = args.group_name.filter(|g| !g.trim().is_empty()) else {
            return ActionResult::fail("Action failed: groupName parameter was not provided.");
        };
        let group_name = group_name.trim();

        match self.open_group(page, group_name).await {
            Ok(()) => ActionResult::ok(format!(
                "Successfully navigated to group: \"{group_name}\""
            )),
            Err(e) => {
                warn!(group = group_name, error = %format!("{e:#}"), "navigateToGroup failed");
                ActionResult::fail(format!("Error in navigateToGroup: {e:#}"))
            }
        }
    }
}

fn group_search_url(group_name: &str) -> Result<Url> {
    Url::parse_with_params(GROUP_SEARCH_URL, &[("q", group_name)])
        .context("build group search url")
}
