use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::{ActionName, Operation, decode_args};
use crate::page::Page;
use crate::types::{ActionResult, Parameters};

#[derive(Debug, Deserialize)]
struct FinishArgs {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

fn default_success() -> bool {
    true
}

/// Ends the task with whatever verdict it was given.
pub struct FinishTask;

#[async_trait]
impl Operation for FinishTask {
    fn name(&self) -> ActionName {
        ActionName::FinishTask
    }

    async fn run(&self, _page: &dyn Page, params: &Parameters) -> ActionResult {
        let args: FinishArgs = match decode_args(self.name(), params) {
            Ok(args) => args,
            Err(message) => return ActionResult::fail(message),
        };
        let message = args
            .message
            .unwrap_or_else(|| "Task completed successfully.".to_string());
        info!(success = args.success, %message, "finish_task");
        ActionResult {
            success: args.success,
            message,
            data: None,
            new_selectors: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakePage;
    use serde_json::json;

    #[tokio::test]
    async fn echoes_verdict() {
        let page = FakePage::default();
        let params: Parameters =
            serde_json::from_value(json!({"success": false, "message": "group is private"}))
                .unwrap();
        let result = FinishTask.run(&page, &params).await;
        assert!(!result.success);
        assert_eq!(result.message, "group is private");

        let result = FinishTask.run(&page, &Parameters::new()).await;
        assert!(result.success);
        assert_eq!(result.message, "Task completed successfully.");
    }
}
