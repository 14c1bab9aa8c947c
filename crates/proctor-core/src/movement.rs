//! Head-movement monitoring across consecutive webcam frames.
//!
//! Each session compares its newest frame with the previous one. A single
//! noisy frame pair should not raise an alarm, so the raw movement value is
//! smoothed against a short history, detections are debounced in time, and
//! the warning is edge-triggered on a decaying consecutive-detection score:
//!
//! ```text
//! raw      = 1 - similarity(frame, last_frame)
//! smoothed = alpha * raw + (1 - alpha) * mean(history)
//! detected = smoothed > threshold && (no detection within debounce)
//! score    = detected ? score + 1 : max(0, score - 0.5)
//! warn     = score >= max_consecutive   (then score := 0)
//! ```

use std::sync::{Arc, PoisonError};

use chrono::{DateTime, Duration, Utc};
use image::DynamicImage;

use crate::session::{SessionMovementState, SessionStore};
use crate::similarity::SimilarityEngine;
use crate::types::{MovementReport, Warning};
use crate::variations::working_copy;

/// Frames below this size on either side cannot contain a usable face.
const MIN_FRAME_EDGE: u32 = 10;
/// Amount the consecutive score decays on a frame without detection.
const SCORE_DECAY: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Smoothed movement above this counts as a detection.
    pub threshold: f64,
    /// Consecutive score at which `excessive_movement` fires.
    pub max_consecutive: f64,
    /// Capacity of the raw movement history.
    pub history: usize,
    /// Weight of the raw value in the smoothed movement.
    pub alpha: f64,
    /// Minimum interval between two detections.
    pub debounce: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            threshold: 0.15,
            max_consecutive: 3.0,
            history: 5,
            alpha: 0.4,
            debounce: Duration::milliseconds(1000),
        }
    }
}

/// Per-session movement state machine over a pluggable similarity engine.
pub struct MovementMonitor {
    engine: Arc<dyn SimilarityEngine>,
    sessions: Arc<dyn SessionStore>,
    config: MonitorConfig,
}

impl MovementMonitor {
    pub fn new(
        engine: Arc<dyn SimilarityEngine>,
        sessions: Arc<dyn SessionStore>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            engine,
            sessions,
            config,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Feed the next frame of a session, stamped with the current time.
    pub fn detect(&self, session_id: &str, frame: &DynamicImage) -> MovementReport {
        self.observe(session_id, frame, Utc::now())
    }

    /// Feed the next frame of a session at time `now`.
    ///
    /// Concurrent calls for the same session are serialized on the session
    /// lock; calls for different sessions proceed independently.
    pub fn observe(&self, session_id: &str, frame: &DynamicImage, now: DateTime<Utc>) -> MovementReport {
        let mut report = MovementReport {
            success: true,
            session_id: session_id.to_string(),
            threshold: self.config.threshold,
            ..Default::default()
        };

        if frame.width() < MIN_FRAME_EDGE || frame.height() < MIN_FRAME_EDGE {
            report.warning = Some(Warning::FaceMissing);
            report.message = Some("frame too small to contain a face".to_string());
            return report;
        }

        let frame = working_copy(frame);
        let session = self.sessions.entry(session_id, now);
        let mut state = session.lock().unwrap_or_else(PoisonError::into_inner);

        if !state.is_tracking() {
            state.recent_scores.clear();
            state.consecutive_score = 0.0;
            state.last_detection_at = None;
            state.last_frame = Some(frame);
            state.last_frame_at = Some(now);
            report.similarity = 1.0;
            tracing::debug!(session_id, "movement tracking started");
            return report;
        }

        self.step(&mut state, &frame, now, &mut report);
        state.last_frame = Some(frame);
        state.last_frame_at = Some(now);

        if let Some(warning) = report.warning {
            tracing::warn!(
                session_id,
                warning = %warning,
                consecutive = report.consecutive_movements,
                "movement warning"
            );
        }
        report
    }

    /// One Tracking-state transition. Leaves `last_frame` to the caller.
    fn step(
        &self,
        state: &mut SessionMovementState,
        frame: &DynamicImage,
        now: DateTime<Utc>,
        report: &mut MovementReport,
    ) {
        let similarity = match &state.last_frame {
            Some(last) => self.engine.compare(frame, last),
            None => 1.0,
        };
        let raw = (1.0 - similarity).max(0.0);

        state.push_score(raw, self.config.history);
        let avg = state.average_score();
        let smoothed = self.config.alpha * raw + (1.0 - self.config.alpha) * avg;

        let since_last = state
            .last_detection_at
            .map(|at| now.signed_duration_since(at));
        let debounced = since_last.is_some_and(|elapsed| elapsed < self.config.debounce);
        let detected = smoothed > self.config.threshold && !debounced;

        if detected {
            state.consecutive_score += 1.0;
            state.last_detection_at = Some(now);
        } else {
            state.consecutive_score = (state.consecutive_score - SCORE_DECAY).max(0.0);
        }

        report.similarity = similarity;
        report.raw_movement = raw;
        report.avg_movement = avg;
        report.movement = smoothed;
        report.movement_detected = detected;
        report.consecutive_movements = state.consecutive_score;
        report.history_size = state.recent_scores.len();
        report.seconds_since_last_detection =
            since_last.map(|elapsed| elapsed.num_milliseconds() as f64 / 1000.0);

        if state.consecutive_score >= self.config.max_consecutive {
            report.warning = Some(Warning::ExcessiveMovement);
            report.message = Some("excessive head movement detected".to_string());
            state.consecutive_score = 0.0;
        }

        tracing::debug!(
            similarity,
            raw,
            smoothed,
            detected,
            debounced,
            consecutive = state.consecutive_score,
            "movement frame scored"
        );
    }

    /// Forget a session. Its next frame starts a fresh Uninitialized session.
    pub fn end_session(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id)
    }
}
