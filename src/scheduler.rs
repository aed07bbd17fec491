//! Periodic polling of every configured device.
//!
//! Each device gets its own task, so polls of one device never overlap while
//! different devices are polled concurrently, up to `max_concurrent_polls`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::backoff::BackoffPolicy;
use crate::bridge::PublishingBridge;
use crate::device::{DeviceRecord, PollResult};
use crate::driver::{DeviceDriver, SensorValues};
use crate::error::{ErrorClass, GatewayError, Result};
use crate::frame::{self, DecodedFrame};
use crate::manager::{ConnectionManager, SessionHandle};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub response_timeout: Duration,
    /// Pause before repeating a request the device answered with busy/acknowledge.
    pub busy_retry_delay: Duration,
    pub max_busy_retries: u32,
    pub backoff: BackoffPolicy,
    pub max_concurrent_polls: usize,
    /// How long in-flight polls may run on after shutdown starts.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(5),
            busy_retry_delay: Duration::from_millis(500),
            max_busy_retries: 2,
            backoff: BackoffPolicy::default(),
            max_concurrent_polls: 3,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// When a device should be polled next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextPoll {
    After(Duration),
    /// Permanently failed, wait for the device to be reconfigured.
    Parked,
}

struct Shared {
    manager: Arc<ConnectionManager>,
    bridge: Arc<dyn PublishingBridge>,
    config: SchedulerConfig,
    permits: Semaphore,
    shutdown: watch::Sender<bool>,
}

pub struct PollScheduler {
    shared: Arc<Shared>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PollScheduler {
    pub fn new(manager: Arc<ConnectionManager>, bridge: Arc<dyn PublishingBridge>, config: SchedulerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let permits = Semaphore::new(config.max_concurrent_polls.max(1));
        Self {
            shared: Arc::new(Shared { manager, bridge, config, permits, shutdown }),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start polling `record`. A device already registered under the same
    /// address is stopped and its session invalidated first.
    pub async fn add_device(&self, record: DeviceRecord) {
        let address = record.address.clone();
        let mut tasks = self.tasks.lock().await;
        if let Some(previous) = tasks.remove(&address) {
            previous.abort();
            self.shared.manager.invalidate(&address).await;
        }
        info!("{address}: polling as {} every {:?}", record.profile.name(), record.poll_interval);
        let task = tokio::spawn(device_loop(self.shared.clone(), record));
        tasks.insert(address, task);
    }

    /// Stop polling `address` and close its session. Returns false if it was not registered.
    pub async fn remove_device(&self, address: &str) -> bool {
        let removed = self.tasks.lock().await.remove(address);
        let Some(task) = removed else {
            return false;
        };
        task.abort();
        self.shared.manager.invalidate(address).await;
        info!("{address}: removed");
        true
    }

    pub async fn devices(&self) -> Vec<String> {
        self.tasks.lock().await.keys().cloned().collect()
    }

    /// Run a single poll cycle for `record` without publishing the result.
    pub async fn poll_once(&self, record: &mut DeviceRecord) -> (PollResult, NextPoll) {
        let driver = record.profile.driver();
        self.shared.poll_cycle(record, driver.as_ref()).await
    }

    /// Stop scheduling polls. In-flight polls get `shutdown_grace` to finish
    /// before they are abandoned.
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain().map(|(_, task)| task).collect();
        let aborts: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();
        if timeout(self.shared.config.shutdown_grace, join_all(tasks)).await.is_err() {
            warn!("Polls still running after {:?}, abandoning them", self.shared.config.shutdown_grace);
            for abort in aborts {
                abort.abort();
            }
        }
        info!("Poll scheduler stopped");
    }
}

async fn device_loop(shared: Arc<Shared>, mut record: DeviceRecord) {
    let driver = record.profile.driver();
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        if *shutdown.borrow() {
            break;
        }

        let (result, next) = shared.poll_cycle(&mut record, driver.as_ref()).await;
        shared.bridge.publish(result).await;

        let delay = match next {
            NextPoll::After(delay) => delay,
            NextPoll::Parked => {
                info!("{}: offline until reconfigured", record.address);
                let _ = shutdown.wait_for(|stop| *stop).await;
                break;
            }
        };
        debug!("{}: next poll in {delay:?}", record.address);

        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
    }
}

impl Shared {
    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn poll_cycle(&self, record: &mut DeviceRecord, driver: &dyn DeviceDriver) -> (PollResult, NextPoll) {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return (PollResult::failure(&record.address, GatewayError::ShuttingDown), NextPoll::Parked),
        };

        let err = match self.poll_windows(record, driver).await {
            Ok(values) => {
                if record.consecutive_failures > 0 {
                    info!("{}: recovered after {} failures", record.address, record.consecutive_failures);
                }
                record.consecutive_failures = 0;
                return (PollResult::success(&record.address, values), NextPoll::After(record.poll_interval));
            }
            Err(err) => err,
        };

        if err.requires_reconnect() {
            self.manager.invalidate(&record.address).await;
        }

        let next = match err.class() {
            ErrorClass::Transient => {
                record.consecutive_failures = record.consecutive_failures.saturating_add(1);
                let delay = self.config.backoff.next_delay(record.consecutive_failures, record.poll_interval);
                warn!(
                    "{}: poll failed ({} in a row), retrying in {delay:?}: {err}",
                    record.address, record.consecutive_failures
                );
                NextPoll::After(delay)
            }
            ErrorClass::Permanent => {
                error!("{}: poll failed permanently: {err}", record.address);
                NextPoll::Parked
            }
        };
        (PollResult::failure(&record.address, err), next)
    }

    /// Read every window of the driver's poll sequence over one session.
    ///
    /// Windows that come back garbled or rejected are reported as `None`
    /// values, the poll only fails if no window could be read at all.
    async fn poll_windows(&self, record: &DeviceRecord, driver: &dyn DeviceDriver) -> Result<SensorValues> {
        let session = self.manager.acquire(&record.address).await?;

        let mut values = SensorValues::new();
        let mut decoded_any = false;
        let mut window_error = None;
        for window in driver.build_poll_sequence() {
            let request = frame::encode_read_request(record.modbus_unit_id, window.start_address, window.word_count)?;
            match self.request_with_busy_retry(&session, &record.address, &request).await {
                Ok(response) => {
                    values.extend(driver.interpret(&response.payload, &window));
                    decoded_any = true;
                }
                Err(err) if err.is_window_local() => {
                    warn!("{}: window 0x{:04x}+{} unreadable: {err}", record.address, window.start_address, window.word_count);
                    values.extend(driver.interpret(&[], &window));
                    window_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        match window_error {
            Some(err) if !decoded_any => Err(err),
            _ => Ok(values),
        }
    }

    async fn request_with_busy_retry(
        &self,
        session: &SessionHandle,
        address: &str,
        request: &[u8],
    ) -> Result<DecodedFrame> {
        let mut retries = 0;
        loop {
            match session.request(request, self.config.response_timeout).await {
                Err(GatewayError::DeviceBusy(exception))
                    if retries < self.config.max_busy_retries && !self.is_shutting_down() =>
                {
                    retries += 1;
                    debug!("{address}: device busy ({exception}), retry {retries} in {:?}", self.config.busy_retry_delay);
                    sleep(self.config.busy_retry_delay).await;
                }
                other => return other,
            }
        }
    }
}
