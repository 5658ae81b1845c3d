//! Workout session tracking.
//!
//! The trainer never says when a workout starts or stops. A new workout is
//! inferred when its duration counter goes backwards, which happens when the
//! device resets its internal timer. This rule is defined by the peripheral's
//! firmware and is kept exactly as the device behaves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::frame::Sample;
use crate::window::{RollingWindow, DEFAULT_WINDOW_CAPACITY};

/// Ticks per displayed unit for duration (seconds) and rotation counters.
pub const TICKS_PER_UNIT: f64 = 10.0;

/// Estimated resistance in kilograms for a given rotational speed.
///
/// Fixed quadratic calibration curve of the trainer, clamped at zero for low
/// speeds.
#[must_use]
pub fn strength(rpm: f64) -> f64 {
    let x = rpm / 1000.0;
    0.2f64.mul_add(x * x, 0.3 * x - 1.0).max(0.0)
}

fn ticks_to_units(ticks: u16) -> f64 {
    f64::from(ticks) / TICKS_PER_UNIT
}

/// The workout currently in progress.
#[derive(Debug, Clone, PartialEq)]
pub struct RunInfo {
    device_id: String,
    latest_metric1: u8,
    latest_rpm: u16,
    rpm_window: RollingWindow,
    max_rpm: u16,
    duration_ticks: u16,
    rotation_ticks: u16,
}

impl RunInfo {
    fn start(device_id: &str, sample: &Sample, window_capacity: usize) -> Self {
        let mut rpm_window = RollingWindow::new(window_capacity);
        rpm_window.push(sample.rpm());
        Self {
            device_id: device_id.to_owned(),
            latest_metric1: sample.device_metric1(),
            latest_rpm: sample.rpm(),
            rpm_window,
            max_rpm: sample.rpm(),
            duration_ticks: sample.duration_ticks(),
            rotation_ticks: sample.rotation_ticks(),
        }
    }

    fn fold(&mut self, sample: &Sample) {
        self.rpm_window.push(sample.rpm());
        self.max_rpm = self.max_rpm.max(sample.rpm());
        self.latest_metric1 = sample.device_metric1();
        self.latest_rpm = sample.rpm();
        self.duration_ticks = sample.duration_ticks();
        self.rotation_ticks = sample.rotation_ticks();
    }

    /// Snapshot this run as a completed record.
    ///
    /// # Errors
    ///
    /// Returns [`crate::MonitorError::EmptyWindow`] if the window holds no
    /// readings, which a run built from samples never does.
    pub fn freeze(&self) -> Result<RunRecord> {
        Ok(RunRecord {
            id: Uuid::new_v4(),
            device_id: self.device_id.clone(),
            device_metric1: self.latest_metric1,
            latest_rpm: self.latest_rpm,
            average_rpm: self.rpm_window.average()?,
            max_rpm: self.max_rpm,
            duration_ticks: self.duration_ticks,
            rotation_ticks: self.rotation_ticks,
            recorded_at_utc: Some(Utc::now()),
        })
    }

    /// Identifier of the connected trainer.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Auxiliary metric from the latest reading.
    #[must_use]
    pub const fn latest_metric1(&self) -> u8 {
        self.latest_metric1
    }

    /// RPM from the latest reading.
    #[must_use]
    pub const fn latest_rpm(&self) -> u16 {
        self.latest_rpm
    }

    /// Recent RPM readings.
    #[must_use]
    pub const fn rpm_window(&self) -> &RollingWindow {
        &self.rpm_window
    }

    /// Peak RPM of the whole run, including evicted readings.
    #[must_use]
    pub const fn max_rpm(&self) -> u16 {
        self.max_rpm
    }

    /// Duration counter from the latest reading.
    #[must_use]
    pub const fn duration_ticks(&self) -> u16 {
        self.duration_ticks
    }

    /// Rotation counter from the latest reading.
    #[must_use]
    pub const fn rotation_ticks(&self) -> u16 {
        self.rotation_ticks
    }

    /// Average RPM over the rolling window.
    ///
    /// # Errors
    ///
    /// Returns [`crate::MonitorError::EmptyWindow`] if the window is empty.
    pub fn average_rpm(&self) -> Result<f64> {
        self.rpm_window.average()
    }

    /// Strength at the latest reading.
    #[must_use]
    pub fn current_strength(&self) -> f64 {
        strength(f64::from(self.latest_rpm))
    }

    /// Strength at the peak RPM.
    #[must_use]
    pub fn max_strength(&self) -> f64 {
        strength(f64::from(self.max_rpm))
    }

    /// Elapsed workout time in seconds.
    #[must_use]
    pub fn duration_secs(&self) -> f64 {
        ticks_to_units(self.duration_ticks)
    }

    /// Completed rotations.
    #[must_use]
    pub fn rotations(&self) -> f64 {
        ticks_to_units(self.rotation_ticks)
    }
}

/// A completed workout, frozen when the next one began.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    id: Uuid,
    device_id: String,
    device_metric1: u8,
    latest_rpm: u16,
    average_rpm: f64,
    max_rpm: u16,
    duration_ticks: u16,
    rotation_ticks: u16,
    #[serde(default)]
    recorded_at_utc: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// Rebuild a record from data stored by an older format.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        device_id: String,
        device_metric1: u8,
        latest_rpm: u16,
        average_rpm: f64,
        max_rpm: u16,
        duration_ticks: u16,
        rotation_ticks: u16,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id,
            device_metric1,
            latest_rpm,
            average_rpm,
            max_rpm,
            duration_ticks,
            rotation_ticks,
            recorded_at_utc: None,
        }
    }

    /// Unique identifier of this record.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Identifier of the trainer that produced this run.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Auxiliary metric at the end of the run.
    #[must_use]
    pub const fn device_metric1(&self) -> u8 {
        self.device_metric1
    }

    /// RPM at the end of the run.
    #[must_use]
    pub const fn latest_rpm(&self) -> u16 {
        self.latest_rpm
    }

    /// Rolling-window average at freeze time; the ranking key.
    #[must_use]
    pub const fn average_rpm(&self) -> f64 {
        self.average_rpm
    }

    /// Peak RPM of the run.
    #[must_use]
    pub const fn max_rpm(&self) -> u16 {
        self.max_rpm
    }

    /// Final duration counter.
    #[must_use]
    pub const fn duration_ticks(&self) -> u16 {
        self.duration_ticks
    }

    /// Final rotation counter.
    #[must_use]
    pub const fn rotation_ticks(&self) -> u16 {
        self.rotation_ticks
    }

    /// When the run was frozen, if known.
    #[must_use]
    pub const fn recorded_at_utc(&self) -> Option<DateTime<Utc>> {
        self.recorded_at_utc
    }

    /// Strength at the average RPM.
    #[must_use]
    pub fn average_strength(&self) -> f64 {
        strength(self.average_rpm)
    }

    /// Strength at the peak RPM.
    #[must_use]
    pub fn max_strength(&self) -> f64 {
        strength(f64::from(self.max_rpm))
    }

    /// Workout time in seconds.
    #[must_use]
    pub fn duration_secs(&self) -> f64 {
        ticks_to_units(self.duration_ticks)
    }

    /// Completed rotations.
    #[must_use]
    pub fn rotations(&self) -> f64 {
        ticks_to_units(self.rotation_ticks)
    }
}

/// Splits the sample stream of one connection into workouts.
#[derive(Debug, Clone)]
pub struct SessionSegmenter {
    device_id: String,
    window_capacity: usize,
    current: Option<RunInfo>,
}

impl SessionSegmenter {
    /// Create a segmenter for the trainer identified by `device_id`.
    #[must_use]
    pub fn new(device_id: impl Into<String>) -> Self {
        Self::with_window_capacity(device_id, DEFAULT_WINDOW_CAPACITY)
    }

    /// Create a segmenter whose runs average over `window_capacity` readings.
    #[must_use]
    pub fn with_window_capacity(device_id: impl Into<String>, window_capacity: usize) -> Self {
        Self {
            device_id: device_id.into(),
            window_capacity,
            current: None,
        }
    }

    /// Fold one reading into the current run.
    ///
    /// Returns the completed record when the reading starts a new workout. The
    /// record reflects the run as it stood before this reading.
    ///
    /// # Errors
    ///
    /// Returns [`crate::MonitorError::EmptyWindow`] only if a run without any
    /// reading is frozen, which cannot happen through this method.
    pub fn apply_sample(&mut self, sample: &Sample) -> Result<Option<RunRecord>> {
        let Some(current) = self.current.as_mut() else {
            debug!(device_id = %self.device_id, "First sample, starting run");
            self.current = Some(RunInfo::start(&self.device_id, sample, self.window_capacity));
            return Ok(None);
        };

        if sample.duration_ticks() >= current.duration_ticks {
            current.fold(sample);
            return Ok(None);
        }

        let record = current.freeze()?;
        info!(
            device_id = %self.device_id,
            previous_duration = current.duration_ticks,
            new_duration = sample.duration_ticks(),
            average_rpm = record.average_rpm(),
            "Duration counter reset, starting new run"
        );
        *current = RunInfo::start(&self.device_id, sample, self.window_capacity);
        Ok(Some(record))
    }

    /// Drop the in-progress run without recording it.
    ///
    /// Returns the discarded run, if any.
    pub fn disconnect(&mut self) -> Option<RunInfo> {
        let discarded = self.current.take();
        if let Some(run) = &discarded {
            info!(
                device_id = %self.device_id,
                duration_ticks = run.duration_ticks,
                "Disconnected, discarding unfinished run"
            );
        }
        discarded
    }

    /// The run in progress, if any.
    #[must_use]
    pub const fn current(&self) -> Option<&RunInfo> {
        self.current.as_ref()
    }

    /// Identifier of the trainer this segmenter tracks.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(rpm: u16, duration: u16, rotation: u16) -> Sample {
        Sample::new(1, rpm, duration, rotation)
    }

    #[test]
    fn test_first_sample_starts_run() {
        let mut seg = SessionSegmenter::new("dev-1");
        let emitted = seg.apply_sample(&sample(1200, 5, 2)).unwrap();

        assert!(emitted.is_none());
        let run = seg.current().unwrap();
        assert_eq!(run.device_id(), "dev-1");
        assert_eq!(run.rpm_window().iter().collect::<Vec<_>>(), vec![1200]);
        assert_eq!(run.max_rpm(), 1200);
        assert_eq!(run.duration_ticks(), 5);
        assert_eq!(run.rotation_ticks(), 2);
    }

    #[test]
    fn test_duration_drop_emits_one_record() {
        let mut seg = SessionSegmenter::new("dev-1");
        let mut emitted = Vec::new();
        for (i, duration) in [5u16, 10, 15, 3, 8].into_iter().enumerate() {
            let rotation = duration * 2 + u16::try_from(i).unwrap();
            if let Some(record) = seg.apply_sample(&sample(1000, duration, rotation)).unwrap() {
                emitted.push(record);
            }
        }

        assert_eq!(emitted.len(), 1);
        let record = &emitted[0];
        assert_eq!(record.duration_ticks(), 15);
        assert_eq!(record.rotation_ticks(), 32);
        assert_eq!(seg.current().unwrap().duration_ticks(), 8);
    }

    #[test]
    fn test_record_average_excludes_boundary_sample() {
        let mut seg = SessionSegmenter::new("dev-1");
        seg.apply_sample(&sample(1000, 1, 0)).unwrap();
        seg.apply_sample(&sample(2000, 2, 0)).unwrap();
        let record = seg.apply_sample(&sample(9000, 0, 0)).unwrap().unwrap();

        assert!((record.average_rpm() - 1500.0).abs() < f64::EPSILON);
        assert_eq!(record.max_rpm(), 2000);
        assert_eq!(seg.current().unwrap().max_rpm(), 9000);
    }

    #[test]
    fn test_equal_duration_continues_run() {
        let mut seg = SessionSegmenter::new("dev-1");
        seg.apply_sample(&sample(100, 7, 0)).unwrap();
        let emitted = seg.apply_sample(&sample(300, 7, 1)).unwrap();

        assert!(emitted.is_none());
        assert_eq!(seg.current().unwrap().rpm_window().len(), 2);
        assert_eq!(seg.current().unwrap().latest_rpm(), 300);
    }

    #[test]
    fn test_peak_survives_window_eviction() {
        let mut seg = SessionSegmenter::with_window_capacity("dev-1", 3);
        seg.apply_sample(&sample(5000, 0, 0)).unwrap();
        for t in 1..=5 {
            seg.apply_sample(&sample(100, t, 0)).unwrap();
        }

        let run = seg.current().unwrap();
        assert_eq!(run.max_rpm(), 5000);
        assert_eq!(run.rpm_window().max(), Some(100));
        assert!(run.max_rpm() >= run.latest_rpm());
    }

    #[test]
    fn test_oversized_window_capacity_still_runs() {
        let mut seg = SessionSegmenter::with_window_capacity("dev-1", usize::MAX / 2);
        assert!(seg.apply_sample(&sample(1200, 1, 1)).unwrap().is_none());
        assert_eq!(seg.current().unwrap().rpm_window().len(), 1);
    }

    #[test]
    fn test_disconnect_discards_run() {
        let mut seg = SessionSegmenter::new("dev-1");
        seg.apply_sample(&sample(100, 7, 0)).unwrap();

        assert!(seg.disconnect().is_some());
        assert!(seg.current().is_none());
        assert!(seg.disconnect().is_none());
    }

    #[test]
    fn test_strength_is_clamped_and_monotonic() {
        assert!(strength(0.0).abs() < f64::EPSILON);
        assert!(strength(1000.0).abs() < f64::EPSILON);

        let mut previous = 0.0;
        for rpm in (0..20_000).step_by(50) {
            let s = strength(f64::from(rpm));
            assert!(s >= 0.0);
            assert!(s >= previous);
            previous = s;
        }
    }

    #[test]
    fn test_strength_reference_value() {
        // 0.2 * 25 + 0.3 * 5 - 1
        assert!((strength(5000.0) - 5.5).abs() < 1e-9);
    }

    #[test]
    fn test_unit_conversions() {
        let mut seg = SessionSegmenter::new("dev-1");
        seg.apply_sample(&sample(100, 125, 40)).unwrap();
        let run = seg.current().unwrap();

        assert!((run.duration_secs() - 12.5).abs() < f64::EPSILON);
        assert!((run.rotations() - 4.0).abs() < f64::EPSILON);
    }
}
