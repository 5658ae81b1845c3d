//! Bounded, deduplicated device scanning.
//!
//! A scan collects the identifiers of advertising trainers until a fixed
//! timeout expires or the user finishes it early. Each scan starts from an
//! empty set; nothing carries over between scans.
//!
//! [`DiscoveryController`] is the synchronous state machine. [`run_discovery`]
//! drives it from a command channel and owns the timeout, so a scan that was
//! stopped can never be completed by a late timer.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::{MonitorError, Result};

/// Default scan duration.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest scan a controller will run.
pub const MAX_SCAN_TIMEOUT: Duration = Duration::from_secs(300);

/// One advertisement reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Platform identifier of the peripheral.
    pub id: String,

    /// Advertised local name, if any.
    pub name: Option<String>,

    /// Signal strength in dBm, if reported.
    pub rssi: Option<i16>,
}

impl Advertisement {
    /// Advertisement carrying only an identifier.
    pub fn from_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            rssi: None,
        }
    }
}

/// Power state of the local Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    /// State not yet reported.
    Unknown,
    /// Adapter is restarting.
    Resetting,
    /// No BLE support on this host.
    Unsupported,
    /// The app lacks Bluetooth permission.
    Unauthorized,
    /// Adapter is off.
    PoweredOff,
    /// Adapter is on and able to scan.
    PoweredOn,
}

impl AdapterState {
    /// Whether scanning is possible in this state.
    #[must_use]
    pub const fn can_scan(self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

/// Identifies one scan so stale timeouts can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanId(u64);

/// Why a scan delivered its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The scan ran for its full duration.
    Timeout,
    /// The user finished the scan early.
    Manual,
}

/// Result of a scan handed to connection setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOutcome {
    /// The scan that produced these results.
    pub scan_id: ScanId,

    /// Distinct identifiers in first-seen order.
    pub device_ids: Vec<String>,

    /// What ended the scan.
    pub reason: StopReason,
}

/// Devices seen during one active scan.
#[derive(Debug, Clone)]
pub struct DiscoveryState {
    scan_id: ScanId,
    seen: HashSet<String>,
    order: Vec<String>,
    deadline: Instant,
}

impl DiscoveryState {
    fn new(scan_id: ScanId, deadline: Instant) -> Self {
        Self {
            scan_id,
            seen: HashSet::new(),
            order: Vec::new(),
            deadline,
        }
    }

    /// Record `id`; returns `true` if it had not been seen in this scan.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_owned());
        self.order.push(id.to_owned());
        true
    }

    fn into_outcome(self, reason: StopReason) -> ScanOutcome {
        ScanOutcome {
            scan_id: self.scan_id,
            device_ids: self.order,
            reason,
        }
    }

    /// The scan this state belongs to.
    #[must_use]
    pub const fn scan_id(&self) -> ScanId {
        self.scan_id
    }

    /// Identifiers seen so far, in first-seen order.
    #[must_use]
    pub fn device_ids(&self) -> &[String] {
        &self.order
    }

    /// Number of distinct devices seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no device has been seen yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// When this scan times out.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Idle/scanning state machine for device discovery.
#[derive(Debug)]
pub struct DiscoveryController {
    timeout: Duration,
    service_uuids: Vec<String>,
    next_scan: u64,
    state: Option<DiscoveryState>,
}

impl DiscoveryController {
    /// Create an idle controller whose scans last `timeout`, capped at
    /// [`MAX_SCAN_TIMEOUT`].
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: timeout.min(MAX_SCAN_TIMEOUT),
            service_uuids: Vec::new(),
            next_scan: 0,
            state: None,
        }
    }

    /// Create an idle controller using the configured duration and
    /// advertisement filter.
    #[must_use]
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            service_uuids: config.service_uuids.clone(),
            ..Self::new(config.scan_timeout())
        }
    }

    /// Begin a scan at `now` with an empty discovery set.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::ScanAlreadyActive`] if a scan is running.
    pub fn start(&mut self, now: Instant) -> Result<ScanId> {
        if self.state.is_some() {
            return Err(MonitorError::ScanAlreadyActive);
        }
        let scan_id = ScanId(self.next_scan);
        self.next_scan += 1;
        self.state = Some(DiscoveryState::new(scan_id, now + self.timeout));
        info!(scan = scan_id.0, timeout_secs = self.timeout.as_secs(), "Scan started");
        Ok(scan_id)
    }

    /// Handle one advertisement.
    ///
    /// Returns the new set size when the device was not seen before in this
    /// scan. Advertisements outside a scan are ignored.
    pub fn observe(&mut self, advertisement: &Advertisement) -> Option<usize> {
        let state = self.state.as_mut()?;
        if !state.insert(&advertisement.id) {
            return None;
        }
        debug!(
            id = %advertisement.id,
            name = advertisement.name.as_deref().unwrap_or(""),
            rssi = ?advertisement.rssi,
            "Discovered device"
        );
        Some(state.len())
    }

    /// The pending timeout of the active scan.
    #[must_use]
    pub fn pending_timeout(&self) -> Option<(ScanId, Instant)> {
        self.state.as_ref().map(|s| (s.scan_id, s.deadline))
    }

    /// Complete the scan because its timer fired.
    ///
    /// A timer belonging to a scan that already stopped is ignored.
    pub fn expire(&mut self, scan_id: ScanId) -> Option<ScanOutcome> {
        if self.state.as_ref()?.scan_id != scan_id {
            debug!(scan = scan_id.0, "Ignoring stale scan timeout");
            return None;
        }
        self.stop(StopReason::Timeout)
    }

    /// Complete the scan early at the user's request.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::NoActiveScan`] if no scan is running.
    pub fn finish(&mut self) -> Result<ScanOutcome> {
        self.stop(StopReason::Manual).ok_or(MonitorError::NoActiveScan)
    }

    /// Abandon the active scan without delivering results.
    ///
    /// Returns `true` if a scan was running.
    pub fn cancel(&mut self) -> bool {
        let cancelled = self.state.take();
        if let Some(state) = &cancelled {
            info!(scan = state.scan_id.0, found = state.len(), "Scan cancelled");
        }
        cancelled.is_some()
    }

    fn stop(&mut self, reason: StopReason) -> Option<ScanOutcome> {
        let outcome = self.state.take()?.into_outcome(reason);
        info!(
            scan = outcome.scan_id.0,
            found = outcome.device_ids.len(),
            ?reason,
            "Scan completed"
        );
        Some(outcome)
    }

    /// Whether a scan is running.
    #[must_use]
    pub const fn is_scanning(&self) -> bool {
        self.state.is_some()
    }

    /// The active scan, if any.
    #[must_use]
    pub const fn state(&self) -> Option<&DiscoveryState> {
        self.state.as_ref()
    }

    /// Configured scan duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Services the transport should filter advertisements by. Empty means
    /// report everything.
    #[must_use]
    pub fn service_uuids(&self) -> &[String] {
        &self.service_uuids
    }
}

impl Default for DiscoveryController {
    fn default() -> Self {
        Self::new(DEFAULT_SCAN_TIMEOUT)
    }
}

/// What connection setup should do with a scan result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "devices", rename_all = "snake_case")]
pub enum DeviceSelection {
    /// Nothing was found; offer a rescan.
    NoneFound,
    /// Exactly one trainer was found; connect to it directly.
    AutoConnect(String),
    /// Several trainers were found; let the user pick.
    Choose(Vec<String>),
}

impl DeviceSelection {
    /// Decide how to proceed from the identifiers a scan delivered.
    #[must_use]
    pub fn from_discovered(mut device_ids: Vec<String>) -> Self {
        match device_ids.len() {
            0 => Self::NoneFound,
            1 => Self::AutoConnect(device_ids.remove(0)),
            _ => Self::Choose(device_ids),
        }
    }
}

// =============================================================================
// DRIVER
// =============================================================================

/// Input to the discovery driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanCommand {
    /// The adapter changed power state. Powering on starts a scan; any other
    /// state cancels the running one.
    AdapterStateChanged(AdapterState),
    /// Start a scan explicitly.
    Start,
    /// The transport saw an advertisement.
    DeviceDiscovered(Advertisement),
    /// Stop early and deliver what was found.
    Finish,
    /// Leave discovery without delivering anything.
    Cancel,
}

/// Output of the discovery driver for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryUpdate {
    /// A scan began.
    Started {
        /// The new scan.
        scan_id: ScanId,
        /// How long it will run.
        timeout: Duration,
        /// Advertisement filter for the transport.
        service_uuids: Vec<String>,
    },
    /// The number of distinct devices grew.
    Progress {
        /// Distinct devices seen so far.
        count: usize,
    },
    /// The scan delivered its results.
    Completed(ScanOutcome),
    /// The scan was abandoned.
    Cancelled,
}

/// Process scan commands and timeouts one at a time until either channel
/// closes.
pub async fn run_discovery(
    mut controller: DiscoveryController,
    mut commands: mpsc::Receiver<ScanCommand>,
    updates: mpsc::Sender<DiscoveryUpdate>,
) {
    loop {
        let pending = controller.pending_timeout();
        let timer = async move {
            match pending {
                Some((scan_id, deadline)) => {
                    sleep_until(deadline).await;
                    scan_id
                }
                None => std::future::pending::<ScanId>().await,
            }
        };

        let update = tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(command) => handle_command(&mut controller, command),
                None => break,
            },
            scan_id = timer => controller.expire(scan_id).map(DiscoveryUpdate::Completed),
        };

        if let Some(update) = update {
            if updates.send(update).await.is_err() {
                debug!("Discovery listener dropped, stopping driver");
                break;
            }
        }
    }
    controller.cancel();
}

fn handle_command(
    controller: &mut DiscoveryController,
    command: ScanCommand,
) -> Option<DiscoveryUpdate> {
    match command {
        ScanCommand::AdapterStateChanged(state) if state.can_scan() => start_scan(controller),
        ScanCommand::AdapterStateChanged(state) => {
            debug!(?state, "Adapter unavailable");
            controller.cancel().then_some(DiscoveryUpdate::Cancelled)
        }
        ScanCommand::Start => start_scan(controller),
        ScanCommand::DeviceDiscovered(advertisement) => controller
            .observe(&advertisement)
            .map(|count| DiscoveryUpdate::Progress { count }),
        ScanCommand::Finish => match controller.finish() {
            Ok(outcome) => Some(DiscoveryUpdate::Completed(outcome)),
            Err(e) => {
                warn!(error = %e, "Ignoring finish request");
                None
            }
        },
        ScanCommand::Cancel => controller.cancel().then_some(DiscoveryUpdate::Cancelled),
    }
}

fn start_scan(controller: &mut DiscoveryController) -> Option<DiscoveryUpdate> {
    match controller.start(Instant::now()) {
        Ok(scan_id) => Some(DiscoveryUpdate::Started {
            scan_id,
            timeout: controller.timeout(),
            service_uuids: controller.service_uuids().to_vec(),
        }),
        Err(e) => {
            warn!(error = %e, "Ignoring start request");
            None
        }
    }
}
