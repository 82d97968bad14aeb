//! Frame quality gate.
//!
//! Maps one detection sample plus the previous gate state to the next gate
//! state. Gates are checked in strict priority order; the first failing gate
//! decides the message and clears the stability timer. A sample that passes
//! every gate only enables capture once all-clear samples have been arriving
//! continuously for the dwell duration.

use crate::types::{DetectionSample, Distance, GateState, IndicatorColor, Lighting};
use std::time::{Duration, Instant};

// --- Named constants ---
pub const DEFAULT_DWELL: Duration = Duration::from_millis(800);

pub const MSG_NO_FACE: &str = "No face detected";
pub const MSG_MULTIPLE_FACES: &str = "Multiple faces detected. Only one person allowed";
pub const MSG_TOO_FAR: &str = "Move closer to camera";
pub const MSG_TOO_CLOSE: &str = "Move back from camera";
pub const MSG_TOO_DARK: &str = "Lighting too dark";
pub const MSG_TOO_BRIGHT: &str = "Lighting too bright";
pub const MSG_HOLD_STILL: &str = "Hold still";
pub const MSG_READY: &str = "Face detected – ready to capture";

/// Stateless classifier holding only the dwell threshold.
#[derive(Debug, Clone, Copy)]
pub struct QualityGate {
    dwell: Duration,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::new(DEFAULT_DWELL)
    }
}

impl QualityGate {
    pub fn new(dwell: Duration) -> Self {
        Self { dwell }
    }

    pub fn dwell(&self) -> Duration {
        self.dwell
    }

    /// Classify `sample` observed at `now`, threading the stability timer
    /// through from `previous`.
    pub fn classify(
        &self,
        sample: &DetectionSample,
        previous: &GateState,
        now: Instant,
    ) -> GateState {
        if let Some((message, indicator)) = first_failing_gate(sample) {
            return GateState::blocked(message, indicator);
        }

        let Some(started) = previous.stability_started_at else {
            return GateState {
                stability_started_at: Some(now),
                allow_capture: false,
                message: MSG_HOLD_STILL.to_string(),
                indicator: IndicatorColor::Amber,
                progress: 0,
            };
        };

        let elapsed = now.saturating_duration_since(started);
        if elapsed < self.dwell {
            let pct = (100.0 * elapsed.as_secs_f64() / self.dwell.as_secs_f64()).round() as u8;
            GateState {
                stability_started_at: Some(started),
                allow_capture: false,
                message: format!("{MSG_HOLD_STILL}… {pct}%"),
                indicator: IndicatorColor::Amber,
                progress: pct,
            }
        } else {
            GateState {
                stability_started_at: Some(started),
                allow_capture: true,
                message: MSG_READY.to_string(),
                indicator: IndicatorColor::Green,
                progress: 100,
            }
        }
    }
}

/// Returns the message and colour of the highest-priority failing gate.
fn first_failing_gate(sample: &DetectionSample) -> Option<(&'static str, IndicatorColor)> {
    match sample.face_count {
        0 => return Some((MSG_NO_FACE, IndicatorColor::Red)),
        1 => {}
        _ => return Some((MSG_MULTIPLE_FACES, IndicatorColor::Orange)),
    }
    match sample.distance {
        Distance::Far => return Some((MSG_TOO_FAR, IndicatorColor::Red)),
        Distance::Close => return Some((MSG_TOO_CLOSE, IndicatorColor::Red)),
        Distance::Perfect | Distance::Unknown => {}
    }
    match sample.lighting {
        Lighting::Dark => Some((MSG_TOO_DARK, IndicatorColor::Red)),
        Lighting::Bright => Some((MSG_TOO_BRIGHT, IndicatorColor::Red)),
        Lighting::Good | Lighting::Unknown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_no_face() {
        let gate = QualityGate::default();
        let out = gate.classify(&DetectionSample::faces(0), &GateState::default(), Instant::now());
        assert!(!out.allow_capture);
        assert_eq!(out.message, MSG_NO_FACE);
        assert_eq!(out.stability_started_at, None);
    }

    #[test]
    fn test_too_far() {
        let gate = QualityGate::default();
        let sample = DetectionSample {
            distance: Distance::Far,
            ..DetectionSample::faces(1)
        };
        let out = gate.classify(&sample, &GateState::default(), Instant::now());
        assert!(!out.allow_capture);
        assert_eq!(out.message, MSG_TOO_FAR);
    }

    #[test]
    fn test_multiple_faces_outranks_everything() {
        let gate = QualityGate::default();
        for distance in [Distance::Far, Distance::Perfect, Distance::Close, Distance::Unknown] {
            for lighting in [Lighting::Dark, Lighting::Good, Lighting::Bright, Lighting::Unknown] {
                let sample = DetectionSample { face_count: 2, distance, lighting };
                let out = gate.classify(&sample, &GateState::default(), Instant::now());
                assert!(!out.allow_capture);
                assert_eq!(out.message, MSG_MULTIPLE_FACES);
                assert_eq!(out.indicator, IndicatorColor::Orange);
            }
        }
    }

    #[test]
    fn test_distance_outranks_lighting() {
        let gate = QualityGate::default();
        let sample = DetectionSample {
            face_count: 1,
            distance: Distance::Close,
            lighting: Lighting::Dark,
        };
        let out = gate.classify(&sample, &GateState::default(), Instant::now());
        assert_eq!(out.message, MSG_TOO_CLOSE);

        let sample = DetectionSample {
            distance: Distance::Perfect,
            lighting: Lighting::Bright,
            ..sample
        };
        let out = gate.classify(&sample, &GateState::default(), Instant::now());
        assert_eq!(out.message, MSG_TOO_BRIGHT);
    }

    #[test]
    fn test_unknown_hints_pass_the_gates() {
        let gate = QualityGate::default();
        let out = gate.classify(&DetectionSample::faces(1), &GateState::default(), Instant::now());
        assert_eq!(out.message, MSG_HOLD_STILL);
        assert!(out.stability_started_at.is_some());
    }

    #[test]
    fn test_dwell_progress_then_ready() {
        let gate = QualityGate::default();
        let t0 = Instant::now();
        let s0 = gate.classify(&DetectionSample::clear(), &GateState::default(), t0);
        assert!(!s0.allow_capture);
        assert_eq!(s0.progress, 0);

        let s1 = gate.classify(&DetectionSample::clear(), &s0, t0 + ms(400));
        assert!(!s1.allow_capture);
        assert_eq!(s1.progress, 50);
        assert_eq!(s1.message, "Hold still… 50%");

        let s2 = gate.classify(&DetectionSample::clear(), &s1, t0 + ms(800));
        assert!(s2.allow_capture);
        assert_eq!(s2.message, MSG_READY);
        assert_eq!(s2.indicator, IndicatorColor::Green);
    }

    #[test]
    fn test_samples_spaced_a_third_of_dwell() {
        let gate = QualityGate::default();
        let t0 = Instant::now();
        let mut state = GateState::default();
        let mut allowed = Vec::new();
        for i in 0..5u64 {
            state = gate.classify(&DetectionSample::clear(), &state, t0 + ms(267 * i));
            allowed.push(state.allow_capture);
        }
        // 0, 267, 534, 801 (crosses 800ms), 1068
        assert_eq!(allowed, vec![false, false, false, true, true]);
    }

    #[test]
    fn test_gate_failure_resets_dwell() {
        let gate = QualityGate::default();
        let t0 = Instant::now();
        let mut state = gate.classify(&DetectionSample::clear(), &GateState::default(), t0);
        state = gate.classify(&DetectionSample::clear(), &state, t0 + ms(900));
        assert!(state.allow_capture);

        state = gate.classify(&DetectionSample::faces(0), &state, t0 + ms(1000));
        assert!(!state.allow_capture);
        assert_eq!(state.stability_started_at, None);

        // A fresh all-clear run must earn the full dwell again.
        state = gate.classify(&DetectionSample::clear(), &state, t0 + ms(1100));
        assert!(!state.allow_capture);
        state = gate.classify(&DetectionSample::clear(), &state, t0 + ms(1800));
        assert!(!state.allow_capture);
        state = gate.classify(&DetectionSample::clear(), &state, t0 + ms(1900));
        assert!(state.allow_capture);
    }
}
