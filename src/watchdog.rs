//! Consecutive-failure tracking and recovery notification
//!
//! The tracker sits between the poll loop and the outside world: it counts
//! consecutive failed cycles, opens a persistent issue once the configured
//! threshold is crossed, optionally fires a recovery action exactly once per
//! failure episode, and reports downtime when the device comes back.
//!
//! The tracker itself never errors; it only mutates tracked state and
//! triggers side-effecting notifications.

use crate::error::AlfaError;
use crate::logging::get_logger;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Issue key used for connection-failure notifications
pub const ISSUE_CONNECTION_FAILED: &str = "connection_failed";

/// Failure classification reported in notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transport never reached the device
    Unreachable,
    /// Device reachable but the protocol conversation failed
    NotResponding,
}

impl FailureKind {
    /// Classify a cycle error
    pub fn from_error(error: &AlfaError) -> Self {
        if error.is_connection() {
            FailureKind::Unreachable
        } else {
            FailureKind::NotResponding
        }
    }

    /// Human-readable classification
    pub fn describe(&self) -> &'static str {
        match self {
            FailureKind::Unreachable => "unreachable",
            FailureKind::NotResponding => "not responding",
        }
    }
}

/// Tracker state, derived from the consecutive-failure count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    /// No consecutive failures
    Healthy,
    /// Failing, but below the threshold
    Degrading,
    /// Threshold crossed, failure episode active
    FailedOpenIssue,
}

/// Payload of a recovery notification
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    /// Display name of the device
    pub device_name: String,
    /// When the failure episode started
    pub started_at: DateTime<Utc>,
    /// When the device recovered
    pub ended_at: DateTime<Utc>,
    /// Compact downtime string, e.g. "5m 23s"
    pub downtime: String,
    /// Name of the recovery action, if one ran this episode
    pub action_name: Option<String>,
    /// When the recovery action ran, if it did
    pub action_ran_at: Option<DateTime<Utc>>,
}

/// Notification/issue sink: the user-visible side of failure tracking
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Open a persistent issue for `key`
    async fn open_issue(&self, key: &str, message: &str);

    /// Close the issue for `key`
    async fn close_issue(&self, key: &str);

    /// Surface a recovery notification
    async fn notify_recovery(&self, report: &RecoveryReport);
}

/// External recovery action, invoked fire-and-forget once per episode
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    /// Name shown in recovery notifications
    fn name(&self) -> String;

    /// Run the action; failures are logged by the tracker, never escalated
    async fn run(&self, device_name: &str, host: &str, port: u16) -> crate::error::Result<()>;
}

/// Per-device failure tracker, persists across poll cycles
pub struct FailureTracker {
    device_name: String,
    host: String,
    port: u16,
    threshold: u32,
    notifications_enabled: bool,
    consecutive_failures: u32,
    issue_open: bool,
    failure_started_at: Option<DateTime<Utc>>,
    action_ran_at: Option<DateTime<Utc>>,
    action_name: Option<String>,
    sink: Arc<dyn NotificationSink>,
    action: Option<Arc<dyn RecoveryAction>>,
    logger: crate::logging::StructuredLogger,
}

impl FailureTracker {
    /// Create a tracker for one device
    pub fn new(
        device_name: &str,
        host: &str,
        port: u16,
        threshold: u32,
        notifications_enabled: bool,
        sink: Arc<dyn NotificationSink>,
        action: Option<Arc<dyn RecoveryAction>>,
    ) -> Self {
        Self {
            device_name: device_name.to_string(),
            host: host.to_string(),
            port,
            threshold,
            notifications_enabled,
            consecutive_failures: 0,
            issue_open: false,
            failure_started_at: None,
            action_ran_at: None,
            action_name: None,
            sink,
            action,
            logger: get_logger("watchdog"),
        }
    }

    /// Current consecutive-failure count
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether a failure episode is currently open
    pub fn is_issue_open(&self) -> bool {
        self.issue_open
    }

    /// Current tracker state
    pub fn state(&self) -> TrackerState {
        if self.consecutive_failures == 0 {
            TrackerState::Healthy
        } else if self.issue_open {
            TrackerState::FailedOpenIssue
        } else {
            TrackerState::Degrading
        }
    }

    /// Record a failed poll cycle. Crossing the threshold opens the issue
    /// (if notifications are enabled) and fires the recovery action exactly
    /// once for this episode.
    pub async fn record_failure(&mut self, error: &AlfaError) {
        self.consecutive_failures += 1;
        let kind = FailureKind::from_error(error);

        self.logger.debug(&format!(
            "Poll failure {}/{} ({}): {}",
            self.consecutive_failures,
            self.threshold,
            kind.describe(),
            error
        ));

        if self.consecutive_failures < self.threshold || self.issue_open {
            return;
        }

        self.issue_open = true;
        self.failure_started_at = Some(Utc::now());
        self.logger.warn(&format!(
            "Device {} {} after {} consecutive failures",
            self.device_name,
            kind.describe(),
            self.consecutive_failures
        ));

        if self.notifications_enabled {
            let message = format!(
                "Device {} at {}:{} is {}",
                self.device_name,
                self.host,
                self.port,
                kind.describe()
            );
            self.sink.open_issue(ISSUE_CONNECTION_FAILED, &message).await;
        }

        if let Some(action) = self.action.clone() {
            self.action_ran_at = Some(Utc::now());
            self.action_name = Some(action.name());

            let device_name = self.device_name.clone();
            let host = self.host.clone();
            let port = self.port;
            let logger = self.logger.clone();
            tokio::spawn(async move {
                if let Err(e) = action.run(&device_name, &host, port).await {
                    logger.warn(&format!("Recovery action failed: {}", e));
                }
            });
        }
    }

    /// Record a successful poll cycle. Closes an open failure episode,
    /// emitting a recovery notification with the computed downtime.
    pub async fn record_success(&mut self) {
        if !self.issue_open {
            self.consecutive_failures = 0;
            return;
        }

        let ended_at = Utc::now();
        let started_at = self.failure_started_at.unwrap_or(ended_at);
        let downtime = format_downtime((ended_at - started_at).num_seconds());

        self.logger.info(&format!(
            "Device {} recovered after {}",
            self.device_name, downtime
        ));

        if self.notifications_enabled {
            self.sink.close_issue(ISSUE_CONNECTION_FAILED).await;
            let report = RecoveryReport {
                device_name: self.device_name.clone(),
                started_at,
                ended_at,
                downtime,
                action_name: self.action_name.clone(),
                action_ran_at: self.action_ran_at,
            };
            self.sink.notify_recovery(&report).await;
        }

        self.consecutive_failures = 0;
        self.issue_open = false;
        self.failure_started_at = None;
        self.action_ran_at = None;
        self.action_name = None;
    }
}

/// Compact downtime formatting: seconds below a minute, minutes (and
/// seconds) below an hour, hours (and minutes) beyond
pub fn format_downtime(total_seconds: i64) -> String {
    let total_seconds = total_seconds.max(0);
    if total_seconds < 60 {
        return format!("{}s", total_seconds);
    }
    if total_seconds < 3600 {
        let minutes = total_seconds / 60;
        let seconds = total_seconds % 60;
        return if seconds == 0 {
            format!("{}m", minutes)
        } else {
            format!("{}m {}s", minutes, seconds)
        };
    }
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    if minutes == 0 {
        format!("{}h", hours)
    } else {
        format!("{}h {}m", hours, minutes)
    }
}
