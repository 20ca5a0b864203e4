//! Operations that act on a single post chosen by the loop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::{ActionName, Operation, Pacing, decode_args, selector_or};
use crate::brain::CompletionProvider;
use crate::page::Page;
use crate::types::{ActionResult, Parameters};

const LIKE_BUTTON: &str = r#"div[aria-label="Like"]"#;
const COMMENT_BOX: &str = r#"div[role="textbox"][contenteditable="true"]"#;
const ADD_FRIEND_BUTTON: &str = r#"div[aria-label="Add friend"]"#;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
const COMMENT_MAX_CHARS: usize = 280;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostArgs {
    #[serde(default)]
    post_url: Option<String>,
    #[serde(default)]
    comment_text: Option<String>,
    #[serde(default)]
    generate_smart_comment: bool,
    #[serde(default)]
    post_text: Option<String>,
    #[serde(default)]
    author_profile_url: Option<String>,
    #[serde(default)]
    selectors: Option<BTreeMap<String, String>>,
}

impl PostArgs {
    fn decode(action: ActionName, params: &Parameters) -> Result<(Self, String), ActionResult> {
        let args: PostArgs = decode_args(action, params).map_err(ActionResult::fail)?;
        match args.post_url.clone().filter(|u| !u.trim().is_empty()) {
            Some(url) => Ok((args, url)),
            None => Err(ActionResult::fail(format!(
                "Action failed: {action} needs a postUrl."
            ))),
        }
    }
}

async fn press(page: &dyn Page, selector: &str, pacing: Pacing) -> Result<()> {
    page.wait_for(selector, CONTROL_TIMEOUT)
        .await
        .with_context(|| format!("control {selector} not found"))?;
    page.click(selector).await?;
    pacing.pause().await;
    Ok(())
}

pub struct LikePost {
    pacing: Pacing,
}

impl LikePost {
    pub fn new(pacing: Pacing) -> Self {
        Self { pacing }
    }
}

#[async_trait]
impl Operation for LikePost {
    fn name(&self) -> ActionName {
        ActionName::LikePost
    }

    async fn run(&self, page: &dyn Page, params: &Parameters) -> ActionResult {
        let (args, url) = match PostArgs::decode(self.name(), params) {
            Ok(decoded) => decoded,
            Err(result) => return result,
        };
        let like = selector_or(&args.selectors, "likeButton", LIKE_BUTTON);

        let outcome = async {
            page.goto(&url).await.context("open post")?;
            self.pacing.pause().await;
            press(page, like, self.pacing).await
        }
        .await;

        match outcome {
            Ok(()) => {
                info!(post = %url, "liked post");
                ActionResult::ok(format!("Liked post {url}"))
            }
            Err(e) => {
                warn!(post = %url, error = %format!("{e:#}"), "likePost failed");
                ActionResult::fail(format!("Error in likePost: {e:#}"))
            }
        }
    }
}

/// Writes a comment. Without explicit text it can draft one from the post body.
pub struct CommentOnPost {
    pacing: Pacing,
    writer: Option<Arc<dyn CompletionProvider>>,
}

impl CommentOnPost {
    pub fn new(pacing: Pacing, writer: Option<Arc<dyn CompletionProvider>>) -> Self {
        Self { pacing, writer }
    }

    async fn comment_text(&self, args: &PostArgs) -> Result<String> {
        if let Some(text) = args.comment_text.as_deref().map(str::trim)
            && !text.is_empty()
        {
            return Ok(text.to_string());
        }
        if !args.generate_smart_comment {
            return Err(anyhow!("no commentText given"));
        }
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| anyhow!("no completion provider for smart comments"))?;
        let post = args.post_text.as_deref().unwrap_or_default();
        let draft = writer
            .complete(&smart_comment_prompt(post))
            .await
            .context("draft smart comment")?;
        let line = draft
            .lines()
            .map(|l| l.trim().trim_matches('"'))
            .find(|l| !l.is_empty())
            .ok_or_else(|| anyhow!("smart comment came back empty"))?;
        Ok(line.chars().take(COMMENT_MAX_CHARS).collect())
    }
}

fn smart_comment_prompt(post_text: &str) -> String {
    format!(
        "Write one short, friendly comment (at most 20 words) replying to this social media post. \
         Reply with the comment text only.\n\nPost:\n{post_text}"
    )
}

#[async_trait]
impl Operation for CommentOnPost {
    fn name(&self) -> ActionName {
        ActionName::CommentOnPost
    }

    async fn run(&self, page: &dyn Page, params: &Parameters) -> ActionResult {
        let (args, url) = match PostArgs::decode(self.name(), params) {
            Ok(decoded) => decoded,
            Err(result) => return result,
        };
        let text = match self.comment_text(&args).await {
            Ok(text) => text,
            Err(e) => return ActionResult::fail(format!("Action failed: {e:#}")),
        };
        let comment_box = selector_or(&args.selectors, "commentBox", COMMENT_BOX);

        let outcome = async {
            page.goto(&url).await.context("open post")?;
            self.pacing.pause().await;
            press(page, comment_box, self.pacing).await?;
            page.type_text(comment_box, &text).await?;
            page.press_key("Enter").await?;
            self.pacing.pause().await;
            Ok::<_, anyhow::Error>(())
        }
        .await;

        match outcome {
            Ok(()) => {
                info!(post = %url, "commented on post");
                ActionResult::ok(format!("Commented on post {url}: \"{text}\""))
            }
            Err(e) => {
                warn!(post = %url, error = %format!("{e:#}"), "commentOnPost failed");
                ActionResult::fail(format!("Error in commentOnPost: {e:#}"))
            }
        }
    }
}

pub struct SendFriendRequest {
    pacing: Pacing,
}

impl SendFriendRequest {
    pub fn new(pacing: Pacing) -> Self {
        Self { pacing }
    }
}

#[async_trait]
impl Operation for SendFriendRequest {
    fn name(&self) -> ActionName {
        ActionName::SendFriendRequest
    }

    async fn run(&self, page: &dyn Page, params: &Parameters) -> ActionResult {
        let (args, url) = match PostArgs::decode(self.name(), params) {
            Ok(decoded) => decoded,
            Err(result) => return result,
        };
        let profile = args
            .author_profile_url
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(url);
        let button = selector_or(&args.selectors, "addFriendButton", ADD_FRIEND_BUTTON);

        let outcome = async {
            page.goto(&profile).await.context("open author profile")?;
            self.pacing.pause().await;
            press(page, button, self.pacing).await
        }
        .await;

        match outcome {
            Ok(()) => {
                info!(profile = %profile, "friend request sent");
                ActionResult::ok(format!("Sent friend request via {profile}"))
            }
            Err(e) => {
                warn!(profile = %profile, error = %format!("{e:#}"), "sendFriendRequest failed");
                ActionResult::fail(format!("Error in sendFriendRequest: {e:#}"))
            }
        }
    }
}
