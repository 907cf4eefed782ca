//! Steady-state detectors.
//!
//! Each detector is a switching function over the trajectory whose zero
//! crossing marks the onset of a steady state.

use crate::events::bisect;
use crate::solver::Step;
use crate::system::Equations;
use serde::{Deserialize, Serialize};

// Bracket width, relative to the check interval, at which a plane crossing is located.
const CROSSING_CONVERGENCE: f64 = 1e-9;
const CROSSING_ITERATIONS: usize = 100;

/// Why a simulation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopEvent {
    /// Ran to the full horizon.
    #[default]
    None,
    ConstantSteadyState,
    OscillatingSteadyState,
}

/// Fires when the relative rate of change drops below a threshold.
#[derive(Debug, Clone)]
pub struct ConstantDetector {
    threshold: f64,
    time_stopped: Option<f64>,
}

impl ConstantDetector {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            time_stopped: None,
        }
    }
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    state: Vec<f64>,
    velocity: Vec<f64>,
    norm: f64,
    // Largest distance the trajectory has moved away from this state.
    excursion: f64,
}

impl HistoryEntry {
    /// Signed offset of `state` along the recorded direction of motion.
    fn along(&self, state: &[f64]) -> f64 {
        state
            .iter()
            .zip(&self.state)
            .zip(&self.velocity)
            .map(|((y, h), v)| (y - h) * v)
            .sum()
    }

    fn distance(&self, state: &[f64]) -> f64 {
        state
            .iter()
            .zip(&self.state)
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

/// Fires when the trajectory closes on itself.
///
/// A recorded state is revisited when the trajectory crosses the hyperplane
/// through it normal to its recorded velocity, in the direction of motion,
/// within `tolerance` times the largest distance the trajectory had moved
/// away from it. Spirals converging to a fixed point cross that plane
/// further in on every turn and never match.
#[derive(Debug, Clone)]
pub struct OscillatingDetector {
    tolerance: f64,
    excursion_factor: f64,
    capacity: usize,
    interval: f64,
    stride: usize,
    next_record: Option<f64>,
    norm_floor: f64,
    history: Vec<HistoryEntry>,
    // Earliest revisit inside the step being scanned.
    closure: Option<f64>,
    time_stopped: Option<f64>,
}

impl OscillatingDetector {
    /// `interval` is the spacing of recorded states and of the crossing
    /// checks; `norm_floor` keeps the candidate gate meaningful for states
    /// near zero.
    pub fn new(
        tolerance: f64,
        excursion_factor: f64,
        capacity: usize,
        interval: f64,
        norm_floor: f64,
    ) -> Self {
        Self {
            tolerance,
            excursion_factor,
            capacity: capacity.max(2),
            interval,
            stride: 1,
            next_record: None,
            norm_floor: norm_floor.max(f64::MIN_POSITIVE),
            history: Vec::new(),
            closure: None,
            time_stopped: None,
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn is_candidate(&self, entry: &HistoryEntry) -> bool {
        entry.excursion > self.excursion_factor * self.tolerance * entry.norm
    }

    /// Time of the first revisit of a candidate state in `t_a..=t_b`, given
    /// the interpolated states `a` and `b` at both ends.
    fn first_revisit(
        &self,
        step: &Step<'_>,
        t_a: f64,
        a: &[f64],
        t_b: f64,
        b: &[f64],
    ) -> Option<f64> {
        let mut state = vec![0.0; a.len()];
        let mut earliest: Option<f64> = None;
        for entry in self.history.iter().filter(|entry| self.is_candidate(entry)) {
            let s_a = entry.along(a);
            let s_b = entry.along(b);
            if !(s_a < 0.0 && s_b >= 0.0) {
                continue;
            }

            let crossing = bisect(
                |t| {
                    step.interpolate(t, &mut state);
                    entry.along(&state)
                },
                t_a,
                t_b,
                s_a,
                s_b,
                CROSSING_CONVERGENCE * (t_b - t_a),
                CROSSING_ITERATIONS,
            );
            let Ok(t_cross) = crossing else {
                continue;
            };

            step.interpolate(t_cross, &mut state);
            if entry.distance(&state) <= self.tolerance * entry.excursion
                && earliest.is_none_or(|t| t_cross < t)
            {
                earliest = Some(t_cross);
            }
        }
        earliest
    }

    /// Look for a revisit inside `step`, checking at most every `interval`.
    fn scan(&mut self, step: &Step<'_>) {
        self.closure = None;
        let span = step.t1 - step.t0;
        if span <= 0.0 || !self.history.iter().any(|entry| self.is_candidate(entry)) {
            return;
        }

        let n_checks = (span / self.interval).ceil().max(1.0) as usize;
        let mut a = vec![0.0; step.dimension()];
        let mut b = vec![0.0; step.dimension()];
        step.interpolate(step.t0, &mut a);
        let mut t_a = step.t0;
        for i in 1..=n_checks {
            let t_b = if i == n_checks {
                step.t1
            } else {
                step.t0 + span * i as f64 / n_checks as f64
            };
            step.interpolate(t_b, &mut b);
            if let Some(t) = self.first_revisit(step, t_a, &a, t_b, &b) {
                self.closure = Some(t);
                return;
            }
            std::mem::swap(&mut a, &mut b);
            t_a = t_b;
        }
    }

    /// Signed time to the revisit found by the last scan.
    fn g(&self, t: f64) -> f64 {
        self.closure.map_or(1.0, |t_closure| t_closure - t)
    }

    fn record(&mut self, state: Vec<f64>, velocity: Vec<f64>) {
        for entry in &mut self.history {
            entry.excursion = entry.excursion.max(entry.distance(&state));
        }

        let norm = state.iter().map(|v| v * v).sum::<f64>().sqrt().max(self.norm_floor);
        self.history.push(HistoryEntry {
            state,
            velocity,
            norm,
            excursion: 0.0,
        });

        if self.history.len() > self.capacity {
            // Keep every other entry and record half as often from now on.
            let mut index = 0;
            self.history.retain(|_| {
                index += 1;
                index % 2 == 1
            });
            self.stride *= 2;
        }
    }

    fn record_step(&mut self, step: &Step<'_>) -> bool {
        let mut next = self.next_record.unwrap_or(step.t0);
        let mut recorded = false;
        while next <= step.t1 {
            let mut state = vec![0.0; step.dimension()];
            let mut velocity = vec![0.0; step.dimension()];
            step.interpolate(next, &mut state);
            step.velocity(next, &mut velocity);
            self.record(state, velocity);
            recorded = true;
            next += self.interval * self.stride as f64;
        }
        self.next_record = Some(next);
        recorded
    }
}

/// The detectors the integration driver can arm.
#[derive(Debug, Clone)]
pub enum SteadyStateDetector {
    Constant(ConstantDetector),
    Oscillating(OscillatingDetector),
}

impl SteadyStateDetector {
    /// Switching function; its sign change marks the steady state.
    pub fn g<E: Equations>(&self, t: f64, state: &[f64], equations: &E) -> f64 {
        match self {
            SteadyStateDetector::Constant(d) => {
                equations.steady_state_indicator(t, state) - d.threshold
            }
            SteadyStateDetector::Oscillating(d) => d.g(t),
        }
    }

    /// Prepare for evaluating the switching function inside `step`.
    pub fn scan_step(&mut self, step: &Step<'_>) {
        if let SteadyStateDetector::Oscillating(d) = self {
            d.scan(step);
        }
    }

    /// Feed an accepted step. Returns true when the switching function may
    /// have changed shape.
    pub fn record_step(&mut self, step: &Step<'_>) -> bool {
        match self {
            SteadyStateDetector::Constant(_) => false,
            SteadyStateDetector::Oscillating(d) => d.record_step(step),
        }
    }

    pub fn stop_at(&mut self, t: f64) {
        match self {
            SteadyStateDetector::Constant(d) => d.time_stopped = Some(t),
            SteadyStateDetector::Oscillating(d) => d.time_stopped = Some(t),
        }
    }

    pub fn time_stopped(&self) -> Option<f64> {
        match self {
            SteadyStateDetector::Constant(d) => d.time_stopped,
            SteadyStateDetector::Oscillating(d) => d.time_stopped,
        }
    }

    pub fn stopped(&self) -> bool {
        self.time_stopped().is_some()
    }

    pub fn stop_event(&self) -> StopEvent {
        match self {
            SteadyStateDetector::Constant(_) => StopEvent::ConstantSteadyState,
            SteadyStateDetector::Oscillating(_) => StopEvent::OscillatingSteadyState,
        }
    }
}
