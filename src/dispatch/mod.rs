//! Push dispatch engine.
//!
//! Moves stored notifications out of INPUT. Each notification is pushed to
//! every registered device concurrently; per-device failures are retried with
//! exponential backoff and then counted against the device, which is
//! deregistered once its consecutive-failure count reaches the threshold.
//!
//! A notification is marked SENT once every device has been attempted, even
//! if some deliveries failed for good. It is marked ERROR only when delivery
//! cannot start at all (payload cannot be built, devices cannot be listed).

mod transport;

pub use transport::*;

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::config::DispatchConfig;
use crate::db::{FailureOutcome, Repository};
use crate::errors::StoreError;
use crate::models::{Device, NotificationStatus, StoredNotification};

/// Largest serialized payload accepted by push services.
pub const MAX_PAYLOAD_BYTES: usize = 3500;

/// INPUT rows fetched per recovery sweep.
const SWEEP_BATCH: i64 = 100;

/// Capacity of the queue between the watcher and the dispatcher.
pub const QUEUE_CAPACITY: usize = 1024;

/// Payload construction failures.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// What a device receives.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload<'a> {
    pub notification_id: i64,
    pub topic: &'a str,
    pub message: &'a str,
    pub metadata: &'a std::collections::HashMap<String, String>,
    pub timestamp: &'a str,
}

impl<'a> PushPayload<'a> {
    pub fn from_notification(notif: &'a StoredNotification) -> Self {
        Self {
            notification_id: notif.notification_id,
            topic: &notif.topic_name,
            message: &notif.message,
            metadata: &notif.metadata,
            timestamp: &notif.timestamp,
        }
    }

    /// Serialize, enforcing the push size limit.
    pub fn encode(&self) -> Result<String, PayloadError> {
        let encoded = serde_json::to_string(self)?;
        if encoded.len() > MAX_PAYLOAD_BYTES {
            return Err(PayloadError::TooLarge {
                size: encoded.len(),
                limit: MAX_PAYLOAD_BYTES,
            });
        }
        Ok(encoded)
    }
}

/// Per-device result of one notification's dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOutcome {
    Delivered,
    Failed,
    Deregistered,
}

/// Summary of one notification's dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub notification_id: i64,
    pub devices: Vec<(String, DeviceOutcome)>,
    /// Status written by this dispatch; `None` if the notification was
    /// already terminal or the status update itself failed.
    pub status: Option<NotificationStatus>,
}

impl DispatchReport {
    pub fn count(&self, outcome: DeviceOutcome) -> usize {
        self.devices.iter().filter(|(_, o)| *o == outcome).count()
    }
}

/// Dispatch engine. Cheap to clone; clones share the in-flight set.
#[derive(Clone)]
pub struct Dispatcher {
    repo: Arc<Repository>,
    transport: Arc<dyn PushTransport>,
    config: DispatchConfig,
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

impl Dispatcher {
    pub fn new(
        repo: Arc<Repository>,
        transport: Arc<dyn PushTransport>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            repo,
            transport,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run the dispatch loop: ids arriving on `queue` are dispatched
    /// immediately, and INPUT rows are swept periodically. In-flight
    /// dispatches finish before the task returns.
    pub fn spawn(
        self,
        mut queue: mpsc::Receiver<i64>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tasks = JoinSet::new();
            let mut sweep = tokio::time::interval(self.config.sweep_interval);
            let mut queue_open = true;

            tracing::info!(
                attempts = self.config.delivery_attempts,
                threshold = self.config.failure_threshold,
                "Dispatcher started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    id = queue.recv(), if queue_open => match id {
                        Some(id) => self.spawn_dispatch(&mut tasks, id),
                        None => queue_open = false,
                    },
                    _ = sweep.tick() => {
                        match self.repo.list_pending(SWEEP_BATCH).await {
                            Ok(pending) => {
                                if !pending.is_empty() {
                                    tracing::debug!(count = pending.len(), "Sweeping pending notifications");
                                }
                                for notif in pending {
                                    self.spawn_dispatch(&mut tasks, notif.notification_id);
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "Pending sweep failed"),
                        }
                    }
                    Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                        if let Err(e) = done {
                            tracing::error!(error = %e, "Dispatch task failed");
                        }
                    }
                }
            }

            tracing::info!(in_flight = tasks.len(), "Dispatcher stopping");
            while tasks.join_next().await.is_some() {}
        })
    }

    fn spawn_dispatch(&self, tasks: &mut JoinSet<()>, id: i64) {
        let this = self.clone();
        let span = tracing::info_span!("dispatch", notification_id = id);
        tasks.spawn(
            async move {
                if let Some(report) = this.dispatch_by_id(id).await {
                    tracing::debug!(
                        notification_id = report.notification_id,
                        status = ?report.status,
                        "Dispatch finished"
                    );
                }
            }
            .instrument(span),
        );
    }

    /// Load and dispatch a notification. Returns `None` when it is unknown,
    /// already terminal, or being dispatched by another task.
    pub async fn dispatch_by_id(&self, id: i64) -> Option<DispatchReport> {
        // Claim before loading so a finished dispatch is seen as terminal
        if !self.in_flight.lock().await.insert(id) {
            tracing::debug!("Dispatch already in progress");
            return None;
        }
        let report = self.load_and_run(id).await;
        self.in_flight.lock().await.remove(&id);
        report
    }

    async fn load_and_run(&self, id: i64) -> Option<DispatchReport> {
        let notif = match self.repo.get_notification(id).await {
            Ok(Some(notif)) => notif,
            Ok(None) => {
                tracing::warn!("Notification not found");
                return None;
            }
            Err(e) => {
                // Left in INPUT; the sweep retries it
                tracing::warn!(error = %e, "Failed to load notification");
                return None;
            }
        };
        if notif.status.is_terminal() {
            tracing::debug!(status = notif.status.as_str(), "Already dispatched");
            return None;
        }
        Some(self.run(&notif).await)
    }

    async fn run(&self, notif: &StoredNotification) -> DispatchReport {
        let id = notif.notification_id;
        let mut report = DispatchReport {
            notification_id: id,
            devices: Vec::new(),
            status: None,
        };

        let payload = match PushPayload::from_notification(notif).encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Cannot build push payload");
                report.status = self.finish(id, NotificationStatus::Error).await;
                return report;
            }
        };

        let devices = match self.repo.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::error!(error = %e, "Cannot list devices");
                report.status = self.finish(id, NotificationStatus::Error).await;
                return report;
            }
        };

        let outcomes = join_all(
            devices
                .iter()
                .map(|device| self.deliver_and_record(device, &payload)),
        )
        .await;
        report.devices = devices
            .into_iter()
            .map(|d| d.device_id)
            .zip(outcomes)
            .collect();

        tracing::info!(
            devices = report.devices.len(),
            delivered = report.count(DeviceOutcome::Delivered),
            failed = report.count(DeviceOutcome::Failed),
            deregistered = report.count(DeviceOutcome::Deregistered),
            "Dispatch attempted for all devices"
        );

        report.status = self.finish(id, NotificationStatus::Sent).await;
        if report.status.is_none() {
            // SENT could not be written; fall back to ERROR if the store allows
            if let Ok(Some(current)) = self.repo.get_notification(id).await {
                if current.status == NotificationStatus::Input {
                    report.status = self.finish(id, NotificationStatus::Error).await;
                }
            }
        }
        report
    }

    /// Apply a terminal status, returning it if this call made the transition.
    async fn finish(&self, id: i64, status: NotificationStatus) -> Option<NotificationStatus> {
        let result = match status {
            NotificationStatus::Sent => self.repo.mark_sent(id).await,
            NotificationStatus::Error => self.repo.mark_error(id).await,
            NotificationStatus::Input => return None,
        };
        match result {
            Ok(true) => Some(status),
            Ok(false) => {
                tracing::debug!(status = status.as_str(), "Notification already terminal");
                None
            }
            Err(e) => {
                tracing::error!(status = status.as_str(), error = %e, "Failed to update notification status");
                None
            }
        }
    }

    async fn deliver_and_record(&self, device: &Device, payload: &str) -> DeviceOutcome {
        match self.deliver_with_retry(device, payload).await {
            Ok(()) => {
                if let Err(e) = self.repo.record_delivery_success(&device.device_id).await {
                    log_counter_error(&device.device_id, &e);
                }
                DeviceOutcome::Delivered
            }
            Err(e) => {
                tracing::warn!(device = %device.device_id, error = %e, "Delivery failed");
                match self
                    .repo
                    .record_delivery_failure(&device.device_id, self.config.failure_threshold)
                    .await
                {
                    Ok(FailureOutcome::Deregistered) => {
                        tracing::info!(
                            device = %device.device_id,
                            threshold = self.config.failure_threshold,
                            "Device deregistered after consecutive failures"
                        );
                        DeviceOutcome::Deregistered
                    }
                    Ok(FailureOutcome::Counted(failures)) => {
                        tracing::debug!(device = %device.device_id, failures, "Failure counted");
                        DeviceOutcome::Failed
                    }
                    Ok(FailureOutcome::UnknownDevice) => DeviceOutcome::Failed,
                    Err(e) => {
                        log_counter_error(&device.device_id, &e);
                        DeviceOutcome::Failed
                    }
                }
            }
        }
    }

    async fn deliver_with_retry(&self, device: &Device, payload: &str) -> Result<(), DeliveryError> {
        let mut delay = self.config.retry_delay;
        let mut attempt = 1;
        loop {
            match self.transport.deliver(&device.public_key, payload).await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() || attempt >= self.config.delivery_attempts => {
                    return Err(e)
                }
                Err(e) => {
                    tracing::debug!(device = %device.device_id, attempt, error = %e, "Retrying delivery");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }
}

fn log_counter_error(device_id: &str, err: &StoreError) {
    tracing::warn!(device = %device_id, error = %err, "Failed to update device failure counter");
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::db::init_database;
    use crate::models::Notification;

    /// Scripted behaviour per public key.
    #[derive(Clone)]
    enum Script {
        Ok,
        FailTimes(usize),
        AlwaysFail,
        Gone,
    }

    #[derive(Default)]
    struct MockTransport {
        scripts: StdMutex<HashMap<String, Script>>,
        calls: StdMutex<HashMap<String, usize>>,
    }

    impl MockTransport {
        fn script(&self, key: &str, script: Script) {
            self.scripts.lock().unwrap().insert(key.to_string(), script);
        }

        fn calls(&self, key: &str) -> usize {
            self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl PushTransport for MockTransport {
        async fn deliver(&self, public_key: &str, _payload: &str) -> Result<(), DeliveryError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(public_key.to_string()).or_insert(0);
                *n += 1;
                *n
            };
            let script = self
                .scripts
                .lock()
                .unwrap()
                .get(public_key)
                .cloned()
                .unwrap_or(Script::Ok);
            match script {
                Script::Ok => Ok(()),
                Script::FailTimes(n) if call <= n => {
                    Err(DeliveryError::Transient("flaky".to_string()))
                }
                Script::FailTimes(_) => Ok(()),
                Script::AlwaysFail => Err(DeliveryError::Transient("down".to_string())),
                Script::Gone => Err(DeliveryError::Gone(410)),
            }
        }
    }

    struct Fixture {
        repo: Arc<Repository>,
        transport: Arc<MockTransport>,
        dispatcher: Dispatcher,
        _temp_dir: TempDir,
    }

    fn test_config() -> DispatchConfig {
        DispatchConfig {
            delivery_attempts: 3,
            retry_delay: Duration::from_millis(1),
            failure_threshold: 3,
            sweep_interval: Duration::from_millis(50),
        }
    }

    impl Fixture {
        async fn new() -> Self {
            let temp_dir = TempDir::new().expect("Failed to create temp dir");
            let pool = init_database(&temp_dir.path().join("test.sqlite"))
                .await
                .expect("Failed to init DB");
            let repo = Arc::new(Repository::new(pool));
            let transport = Arc::new(MockTransport::default());
            let dispatcher = Dispatcher::new(
                Arc::clone(&repo),
                Arc::clone(&transport) as Arc<dyn PushTransport>,
                test_config(),
            );
            Fixture {
                repo,
                transport,
                dispatcher,
                _temp_dir: temp_dir,
            }
        }

        async fn notify(&self, message: &str) -> i64 {
            self.repo
                .insert_notification(&Notification {
                    topic: "alerts".to_string(),
                    metadata: HashMap::from([("host".to_string(), "web-1".to_string())]),
                    message: message.to_string(),
                })
                .await
                .unwrap()
        }

        async fn status(&self, id: i64) -> NotificationStatus {
            self.repo.get_notification(id).await.unwrap().unwrap().status
        }
    }

    #[tokio::test]
    async fn test_delivers_to_every_device_and_marks_sent() {
        let fx = Fixture::new().await;
        fx.repo.register_device("a", "key-a").await.unwrap();
        fx.repo.register_device("b", "key-b").await.unwrap();
        let id = fx.notify("hello").await;

        let report = fx.dispatcher.dispatch_by_id(id).await.unwrap();
        assert_eq!(report.count(DeviceOutcome::Delivered), 2);
        assert_eq!(report.status, Some(NotificationStatus::Sent));
        assert_eq!(fx.status(id).await, NotificationStatus::Sent);
        assert_eq!(fx.transport.calls("key-a"), 1);
        assert_eq!(fx.transport.calls("key-b"), 1);

        // Terminal notifications are not dispatched again
        assert!(fx.dispatcher.dispatch_by_id(id).await.is_none());
        assert_eq!(fx.transport.calls("key-a"), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let fx = Fixture::new().await;
        fx.repo.register_device("flaky", "key-flaky").await.unwrap();
        fx.transport.script("key-flaky", Script::FailTimes(2));
        let id = fx.notify("retry me").await;

        let report = fx.dispatcher.dispatch_by_id(id).await.unwrap();
        assert_eq!(report.devices, vec![("flaky".to_string(), DeviceOutcome::Delivered)]);
        assert_eq!(fx.transport.calls("key-flaky"), 3);
        let device = fx.repo.get_device("flaky").await.unwrap().unwrap();
        assert_eq!(device.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_permanent_device_failure_still_marks_sent() {
        let fx = Fixture::new().await;
        fx.repo.register_device("good", "key-good").await.unwrap();
        fx.repo.register_device("bad", "key-bad").await.unwrap();
        fx.repo.register_device("gone", "key-gone").await.unwrap();
        fx.transport.script("key-bad", Script::AlwaysFail);
        fx.transport.script("key-gone", Script::Gone);
        let id = fx.notify("partial").await;

        let report = fx.dispatcher.dispatch_by_id(id).await.unwrap();
        assert_eq!(report.count(DeviceOutcome::Delivered), 1);
        assert_eq!(report.count(DeviceOutcome::Failed), 2);
        assert_eq!(fx.status(id).await, NotificationStatus::Sent);

        assert_eq!(fx.transport.calls("key-bad"), 3);
        // Gone is not retried
        assert_eq!(fx.transport.calls("key-gone"), 1);
        let bad = fx.repo.get_device("bad").await.unwrap().unwrap();
        assert_eq!(bad.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_device_deregistered_at_threshold() {
        let fx = Fixture::new().await;
        let threshold = test_config().failure_threshold;
        fx.repo.register_device("phone", "key-phone").await.unwrap();
        fx.repo.register_device("steady", "key-steady").await.unwrap();

        // One success, then threshold - 1 failures: still registered
        let id = fx.notify("first").await;
        fx.dispatcher.dispatch_by_id(id).await.unwrap();
        fx.transport.script("key-phone", Script::AlwaysFail);
        for n in 1..threshold {
            let id = fx.notify(&format!("failing {n}")).await;
            let report = fx.dispatcher.dispatch_by_id(id).await.unwrap();
            assert!(report.devices.contains(&("phone".to_string(), DeviceOutcome::Failed)));
        }
        assert!(fx.repo.get_device("phone").await.unwrap().is_some());

        let id = fx.notify("last straw").await;
        let report = fx.dispatcher.dispatch_by_id(id).await.unwrap();
        assert!(report
            .devices
            .contains(&("phone".to_string(), DeviceOutcome::Deregistered)));
        assert!(fx.repo.get_device("phone").await.unwrap().is_none());
        assert!(fx.repo.get_device("steady").await.unwrap().is_some());
        assert_eq!(fx.status(id).await, NotificationStatus::Sent);

        // Later notifications skip the removed device
        let calls_before = fx.transport.calls("key-phone");
        let id = fx.notify("after").await;
        let report = fx.dispatcher.dispatch_by_id(id).await.unwrap();
        assert_eq!(report.devices.len(), 1);
        assert_eq!(fx.transport.calls("key-phone"), calls_before);
    }

    #[tokio::test]
    async fn test_no_devices_marks_sent() {
        let fx = Fixture::new().await;
        let id = fx.notify("nobody listening").await;

        let report = fx.dispatcher.dispatch_by_id(id).await.unwrap();
        assert!(report.devices.is_empty());
        assert_eq!(fx.status(id).await, NotificationStatus::Sent);
    }

    #[tokio::test]
    async fn test_oversized_payload_marks_error() {
        let fx = Fixture::new().await;
        fx.repo.register_device("a", "key-a").await.unwrap();
        let id = fx.notify(&"x".repeat(MAX_PAYLOAD_BYTES + 1)).await;

        let report = fx.dispatcher.dispatch_by_id(id).await.unwrap();
        assert_eq!(report.status, Some(NotificationStatus::Error));
        assert_eq!(fx.status(id).await, NotificationStatus::Error);
        assert_eq!(fx.transport.calls("key-a"), 0);
    }

    #[tokio::test]
    async fn test_unknown_notification_is_skipped() {
        let fx = Fixture::new().await;
        assert!(fx.dispatcher.dispatch_by_id(424242).await.is_none());
    }

    #[test]
    fn test_payload_shape() {
        let notif = StoredNotification {
            notification_id: 7,
            topic_id: 1,
            topic_name: "Updates".to_string(),
            timestamp: "2024-11-29T10:00:00+00:00".to_string(),
            message: "Server down".to_string(),
            metadata: HashMap::from([("Date".to_string(), "2024-11-29".to_string())]),
            status: NotificationStatus::Input,
        };
        let encoded = PushPayload::from_notification(&notif).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["notificationId"], 7);
        assert_eq!(value["topic"], "Updates");
        assert_eq!(value["message"], "Server down");
        assert_eq!(value["metadata"]["Date"], "2024-11-29");
    }

    #[tokio::test]
    async fn test_loop_handles_queue_and_sweep() {
        let fx = Fixture::new().await;
        fx.repo.register_device("a", "key-a").await.unwrap();

        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = fx.dispatcher.clone().spawn(queue_rx, shutdown_rx);

        let queued = fx.notify("queued").await;
        queue_tx.send(queued).await.unwrap();
        // Never queued: only the sweep can find it
        let orphan = fx.notify("orphan").await;

        let mut done = false;
        for _ in 0..100 {
            if fx.status(queued).await == NotificationStatus::Sent
                && fx.status(orphan).await == NotificationStatus::Sent
            {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(done);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        // Both paths may race for the same row; the device still gets each once
        assert_eq!(fx.transport.calls("key-a"), 2);
    }
}
