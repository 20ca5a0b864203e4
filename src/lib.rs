//! Autonomous browser agent that works through group-engagement tasks on a
//! social-media site, one task at a time.
//!
//! The [`agent::DecisionLoop`] asks a completion provider for the next action,
//! parses and validates the reply, runs the matching operation against a
//! browser page and folds the outcome into task-scoped memory. Any failure
//! ends the task and files a forensic report.

pub mod actions;
pub mod agent;
pub mod api;
pub mod brain;
pub mod config;
pub mod dom;
pub mod error;
pub mod face;
pub mod hands;
pub mod logging;
pub mod page;
pub mod parser;
pub mod prompt;
pub mod report;
pub mod state;
pub mod supervisor;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
