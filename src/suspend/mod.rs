//! Suspend/resume coordination for steps that need a human.
//!
//! A task is `active`, or `suspended` until a manual resume, an automatic
//! resolution of its [`ResumeCondition`], or cancellation. At most one
//! suspension exists per task at a time.

pub mod detect;
pub mod predicate;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Result, StewardError};

pub use detect::{detect_suspension, RequestedCondition, SuspendRequest};
pub use predicate::ToolProbePredicate;

/// Why a task is waiting on a human.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SuspendReason {
    AuthenticationRequired,
    CaptchaRequired,
    InteractiveCommand,
    UserConfirmation,
    ExternalAction,
}

/// Asynchronous check that decides whether a suspended task may continue.
#[async_trait]
pub trait ResumePredicate: Send + Sync {
    async fn check(&self) -> bool;
}

/// How a suspension ends on its own, if at all.
#[derive(Clone)]
pub enum ResumeCondition {
    /// Only an explicit resume or cancel ends it.
    Manual,
    /// Re-check `predicate` every `interval`; true resumes, `max_wait` cancels.
    Poll {
        interval: Duration,
        max_wait: Duration,
        predicate: Arc<dyn ResumePredicate>,
    },
    /// Resume with reason `timeout` once `after` elapses.
    Timeout { after: Duration },
}

impl ResumeCondition {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Poll { .. } => "poll",
            Self::Timeout { .. } => "timeout",
        }
    }

    /// Longest the suspension can last without a human, if bounded.
    pub fn max_wait(&self) -> Option<Duration> {
        match self {
            Self::Manual => None,
            Self::Poll { max_wait, .. } => Some(*max_wait),
            Self::Timeout { after } => Some(*after),
        }
    }
}

impl fmt::Debug for ResumeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => f.write_str("Manual"),
            Self::Poll {
                interval, max_wait, ..
            } => f
                .debug_struct("Poll")
                .field("interval", interval)
                .field("max_wait", max_wait)
                .finish_non_exhaustive(),
            Self::Timeout { after } => f.debug_struct("Timeout").field("after", after).finish(),
        }
    }
}

/// The active suspension of a task.
#[derive(Debug, Clone)]
pub struct SuspendedTask {
    pub reason: SuspendReason,
    pub message: String,
    pub condition: ResumeCondition,
    pub created_at: DateTime<Utc>,
    pub metadata: Value,
}

/// Serializable summary of a suspension, as surfaced to the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuspendNotice {
    pub reason: SuspendReason,
    pub message: String,
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wait_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl From<&SuspendedTask> for SuspendNotice {
    fn from(task: &SuspendedTask) -> Self {
        Self {
            reason: task.reason,
            message: task.message.clone(),
            condition: task.condition.kind().to_string(),
            max_wait_ms: task.condition.max_wait().map(|d| d.as_millis() as u64),
            created_at: task.created_at,
            metadata: task.metadata.clone(),
        }
    }
}

/// How a suspension ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resumed { reason: String, elapsed: Duration },
    Cancelled { reason: String, elapsed: Duration },
}

struct ActiveSuspension {
    task: SuspendedTask,
    started: Instant,
    tx: watch::Sender<Option<Resolution>>,
}

/// Per-task suspend state machine.
pub struct SuspendCoordinator {
    task_id: String,
    current: Mutex<Option<ActiveSuspension>>,
}

impl SuspendCoordinator {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            current: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveSuspension>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enter the suspended state. Fails if a suspension is already active.
    pub fn suspend(
        &self,
        reason: SuspendReason,
        message: impl Into<String>,
        condition: ResumeCondition,
        metadata: Value,
    ) -> Result<SuspendNotice> {
        let mut current = self.lock();
        if current.is_some() {
            return Err(StewardError::AlreadySuspended(self.task_id.clone()));
        }
        let task = SuspendedTask {
            reason,
            message: message.into(),
            condition,
            created_at: Utc::now(),
            metadata,
        };
        let notice = SuspendNotice::from(&task);
        info!(
            task_id = %self.task_id,
            reason = %task.reason,
            condition = task.condition.kind(),
            "task suspended"
        );
        let (tx, _rx) = watch::channel(None);
        *current = Some(ActiveSuspension {
            task,
            started: Instant::now(),
            tx,
        });
        Ok(notice)
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().is_some()
    }

    pub fn suspension(&self) -> Option<SuspendedTask> {
        self.lock().as_ref().map(|active| active.task.clone())
    }

    /// Return to active. Fails when nothing is suspended.
    pub fn resume(&self, reason: impl Into<String>) -> Result<Resolution> {
        let reason = reason.into();
        self.settle(|elapsed| Resolution::Resumed { reason, elapsed })
            .ok_or_else(|| StewardError::InvalidState(format!("task {} is not suspended", self.task_id)))
    }

    /// Cancel the active suspension, if any.
    pub fn cancel(&self, reason: impl Into<String>) -> Option<Resolution> {
        let reason = reason.into();
        self.settle(|elapsed| Resolution::Cancelled { reason, elapsed })
    }

    fn settle(&self, make: impl FnOnce(Duration) -> Resolution) -> Option<Resolution> {
        let active = self.lock().take()?;
        let resolution = make(active.started.elapsed());
        debug!(task_id = %self.task_id, ?resolution, "suspension settled");
        active.tx.send_replace(Some(resolution.clone()));
        Some(resolution)
    }

    /// Wait until the active suspension resolves.
    ///
    /// Returns immediately with an error when nothing is suspended.
    pub async fn wait(&self) -> Result<Resolution> {
        let (mut rx, condition, started) = {
            let current = self.lock();
            let active = current.as_ref().ok_or_else(|| {
                StewardError::InvalidState(format!("task {} is not suspended", self.task_id))
            })?;
            (
                active.tx.subscribe(),
                active.task.condition.clone(),
                active.started,
            )
        };

        let automatic = async {
            match condition {
                ResumeCondition::Manual => std::future::pending::<()>().await,
                ResumeCondition::Timeout { after } => {
                    tokio::time::sleep_until(started + after).await;
                    self.settle(|elapsed| Resolution::Resumed {
                        reason: "timeout".into(),
                        elapsed,
                    });
                }
                ResumeCondition::Poll {
                    interval,
                    max_wait,
                    predicate,
                } => {
                    let satisfied =
                        poll_until(predicate.as_ref(), interval, started + max_wait).await;
                    if satisfied {
                        self.settle(|elapsed| Resolution::Resumed {
                            reason: "condition_met".into(),
                            elapsed,
                        });
                    } else {
                        self.settle(|elapsed| Resolution::Cancelled {
                            reason: format!(
                                "resume condition not met within {}s",
                                max_wait.as_secs()
                            ),
                            elapsed,
                        });
                    }
                }
            }
        };

        tokio::select! {
            resolution = next_resolution(&mut rx) => Ok(resolution),
            _ = automatic => {
                // `settle` already published, or a concurrent signal beat it.
                Ok(next_resolution(&mut rx).await)
            }
        }
    }
}

async fn next_resolution(rx: &mut watch::Receiver<Option<Resolution>>) -> Resolution {
    loop {
        if let Some(resolution) = rx.borrow_and_update().clone() {
            return resolution;
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone().unwrap_or(Resolution::Cancelled {
                reason: "suspension dropped".into(),
                elapsed: Duration::ZERO,
            });
        }
    }
}

async fn poll_until(predicate: &dyn ResumePredicate, interval: Duration, deadline: Instant) -> bool {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::time::sleep_until(deadline) => return false,
        }
        match tokio::time::timeout_at(deadline, predicate.check()).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(_) => return false,
        }
    }
}
