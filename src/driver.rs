//! Poll loop orchestration for the Sinapsi Alfa driver
//!
//! The driver owns one pollable device and its failure tracker, runs the
//! scan-interval loop, and publishes the latest device snapshot. Notification
//! and recovery concerns are injected through the watchdog traits so the loop
//! itself stays free of side effects.

use crate::client::{DeviceState, PollableDevice};
use crate::config::Config;
use crate::error::Result;
use crate::logging::get_logger;
use crate::watchdog::{FailureTracker, NotificationSink, RecoveryAction, RecoveryReport};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, interval};

/// Main driver state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverState {
    /// Driver is initializing
    Initializing,
    /// Driver is running normally
    Running,
    /// Driver is in error state
    Error(String),
    /// Driver is shutting down
    ShuttingDown,
}

/// Main driver for the Sinapsi Alfa poll loop
pub struct AlfaDriver<D: PollableDevice> {
    /// Polled device
    device: D,

    /// Per-device failure tracker
    tracker: FailureTracker,

    /// Seconds between poll cycles
    scan_interval: Duration,

    /// Current driver state
    state: watch::Sender<DriverState>,

    /// Shutdown signal
    shutdown_tx: mpsc::UnboundedSender<()>,

    /// Shutdown receiver
    shutdown_rx: mpsc::UnboundedReceiver<()>,

    /// Most recent successful device snapshot
    latest: Option<DeviceState>,

    /// Logger with context
    logger: crate::logging::StructuredLogger,
}

impl<D: PollableDevice> AlfaDriver<D> {
    /// Create a driver from a validated configuration and a device
    pub fn new(config: &Config, device: D, tracker: FailureTracker) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(DriverState::Initializing);

        Self {
            device,
            tracker,
            scan_interval: Duration::from_secs(config.device.scan_interval_s),
            state: state_tx,
            shutdown_tx,
            shutdown_rx,
            latest: None,
            logger: get_logger("driver"),
        }
    }

    /// Run the poll loop until a shutdown request arrives
    pub async fn run(&mut self) -> Result<()> {
        self.logger.info(&format!(
            "Starting poll loop for {} at {}:{} (interval {}s)",
            self.device.name(),
            self.device.host(),
            self.device.port(),
            self.scan_interval.as_secs()
        ));
        // send_replace: the state must update even while nobody subscribes
        self.state.send_replace(DriverState::Running);

        let mut poll_interval = interval(self.scan_interval);

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    self.poll_once().await;
                }
                _ = self.shutdown_rx.recv() => {
                    self.logger.info("Shutdown signal received");
                    break;
                }
            }
        }

        self.state.send_replace(DriverState::ShuttingDown);
        self.logger.info("Driver shutdown complete");
        Ok(())
    }

    /// Run a single poll cycle and feed the outcome to the tracker
    pub async fn poll_once(&mut self) {
        match self.device.poll().await {
            Ok(state) => {
                self.latest = Some(state);
                self.tracker.record_success().await;
                self.state.send_replace(DriverState::Running);
            }
            Err(e) => {
                self.logger.warn(&format!("Poll cycle failed: {}", e));
                self.tracker.record_failure(&e).await;
                self.state.send_replace(DriverState::Error(e.to_string()));
            }
        }
    }

    /// Latest successful snapshot as JSON, if any cycle has succeeded
    pub fn latest_snapshot(&self) -> Option<serde_json::Value> {
        self.latest.as_ref().and_then(|state| state.snapshot().ok())
    }

    /// Get current driver state
    pub fn get_state(&self) -> DriverState {
        self.state.borrow().clone()
    }

    /// Subscribe to driver state changes
    pub fn subscribe_state(&self) -> watch::Receiver<DriverState> {
        self.state.subscribe()
    }

    /// Request shutdown
    pub fn request_shutdown(&self) {
        self.shutdown_tx.send(()).ok();
    }

    /// Handle to request shutdown from another task
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<()> {
        self.shutdown_tx.clone()
    }

    /// Access the failure tracker (for diagnostics)
    pub fn tracker(&self) -> &FailureTracker {
        &self.tracker
    }
}

/// Notification sink that writes issues and recoveries to the log
pub struct LogNotifier {
    logger: crate::logging::StructuredLogger,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self {
            logger: get_logger("notify"),
        }
    }
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn open_issue(&self, key: &str, message: &str) {
        self.logger.error(&format!("Issue opened [{}]: {}", key, message));
    }

    async fn close_issue(&self, key: &str) {
        self.logger.info(&format!("Issue closed [{}]", key));
    }

    async fn notify_recovery(&self, report: &RecoveryReport) {
        match &report.action_name {
            Some(name) => self.logger.info(&format!(
                "Device {} recovered after {} (recovery action '{}' ran)",
                report.device_name, report.downtime, name
            )),
            None => self.logger.info(&format!(
                "Device {} recovered after {}",
                report.device_name, report.downtime
            )),
        }
    }
}

/// Recovery action that runs a shell command, e.g. a power-cycle script
pub struct CommandRecovery {
    command: String,
}

impl CommandRecovery {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }
}

#[async_trait]
impl RecoveryAction for CommandRecovery {
    fn name(&self) -> String {
        self.command.clone()
    }

    async fn run(&self, device_name: &str, host: &str, port: u16) -> Result<()> {
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("ALFA_DEVICE", device_name)
            .env("ALFA_HOST", host)
            .env("ALFA_PORT", port.to_string())
            .status()
            .await
            .map_err(|e| {
                crate::error::AlfaError::io(format!("Failed to run recovery command: {}", e))
            })?;

        if !status.success() {
            return Err(crate::error::AlfaError::generic(format!(
                "Recovery command exited with {}",
                status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AlfaError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeDevice {
        polls: Arc<AtomicU32>,
        fail_first: u32,
    }

    #[async_trait]
    impl PollableDevice for FakeDevice {
        async fn poll(&mut self) -> Result<DeviceState> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(AlfaError::connection("refused"))
            } else {
                let mut state = DeviceState::new("Alfa");
                state.serial = "AABBCCDDEEFF".to_string();
                Ok(state)
            }
        }

        fn name(&self) -> &str {
            "Alfa"
        }

        fn host(&self) -> &str {
            "192.168.1.50"
        }

        fn port(&self) -> u16 {
            502
        }
    }

    struct NullSink;

    #[async_trait]
    impl NotificationSink for NullSink {
        async fn open_issue(&self, _key: &str, _message: &str) {}
        async fn close_issue(&self, _key: &str) {}
        async fn notify_recovery(&self, _report: &RecoveryReport) {}
    }

    fn test_driver(fail_first: u32, polls: Arc<AtomicU32>) -> AlfaDriver<FakeDevice> {
        let config = Config::default();
        let tracker = FailureTracker::new("Alfa", "192.168.1.50", 502, 3, true, Arc::new(NullSink), None);
        AlfaDriver::new(&config, FakeDevice { polls, fail_first }, tracker)
    }

    #[tokio::test]
    async fn successful_cycle_publishes_snapshot() {
        let polls = Arc::new(AtomicU32::new(0));
        let mut driver = test_driver(0, polls.clone());

        assert!(driver.latest_snapshot().is_none());
        driver.poll_once().await;

        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert_eq!(driver.get_state(), DriverState::Running);
        let snapshot = driver.latest_snapshot().expect("snapshot after success");
        assert_eq!(snapshot["serial"], "AABBCCDDEEFF");
    }

    #[tokio::test]
    async fn failed_cycle_keeps_previous_snapshot() {
        let polls = Arc::new(AtomicU32::new(0));
        let mut driver = test_driver(0, polls.clone());

        driver.poll_once().await;
        let before = driver.latest_snapshot();

        driver.device.fail_first = u32::MAX;
        driver.poll_once().await;

        assert!(matches!(driver.get_state(), DriverState::Error(_)));
        assert_eq!(driver.latest_snapshot(), before);
        assert_eq!(driver.tracker().consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn recovery_resets_tracker() {
        let polls = Arc::new(AtomicU32::new(0));
        let mut driver = test_driver(2, polls.clone());

        driver.poll_once().await;
        driver.poll_once().await;
        assert_eq!(driver.tracker().consecutive_failures(), 2);

        driver.poll_once().await;
        assert_eq!(driver.tracker().consecutive_failures(), 0);
        assert_eq!(driver.get_state(), DriverState::Running);
    }

    #[tokio::test]
    async fn state_updates_land_without_any_subscriber() {
        let polls = Arc::new(AtomicU32::new(0));
        let mut driver = test_driver(u32::MAX, polls.clone());

        assert_eq!(driver.get_state(), DriverState::Initializing);
        driver.poll_once().await;
        assert!(matches!(driver.get_state(), DriverState::Error(_)));

        driver.device.fail_first = 0;
        driver.poll_once().await;
        assert_eq!(driver.get_state(), DriverState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown_request() {
        let polls = Arc::new(AtomicU32::new(0));
        let mut driver = test_driver(0, polls.clone());
        let shutdown = driver.shutdown_handle();
        let mut state_rx = driver.subscribe_state();

        let handle = tokio::spawn(async move { driver.run().await });

        // Wait for the first (immediate) poll tick to land
        state_rx.wait_for(|s| *s == DriverState::Running).await.ok();
        tokio::task::yield_now().await;

        shutdown.send(()).unwrap();
        let result = handle.await.unwrap();
        assert!(result.is_ok());
        assert!(polls.load(Ordering::SeqCst) >= 1);
    }
}
