//! Hook into the host's self-learning subsystem.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LearnOutcome {
    pub learned: bool,
}

/// Receives failures worth learning from. Calls are fire-and-forget.
#[async_trait]
pub trait SelfLearning: Send + Sync {
    async fn quick_learn_from_error(
        &self,
        message: &str,
        original_query: &str,
        attempts: u32,
    ) -> Result<LearnOutcome>;
}

/// Learns nothing.
#[derive(Debug, Default)]
pub struct NoopLearning;

#[async_trait]
impl SelfLearning for NoopLearning {
    async fn quick_learn_from_error(&self, _: &str, _: &str, _: u32) -> Result<LearnOutcome> {
        Ok(LearnOutcome::default())
    }
}

/// Report a failure without waiting; errors are logged and dropped.
pub(crate) fn spawn_learn(
    learning: Arc<dyn SelfLearning>,
    message: String,
    original_query: String,
    attempts: u32,
) {
    tokio::spawn(async move {
        match learning
            .quick_learn_from_error(&message, &original_query, attempts)
            .await
        {
            Ok(outcome) => debug!(learned = outcome.learned, attempts, "self-learning notified"),
            Err(err) => warn!(error = %err, "self-learning failed"),
        }
    });
}
