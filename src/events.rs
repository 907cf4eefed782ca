//! Event handling: sign-change detection of a switching function and
//! bisection search for the crossing time.

use crate::detector::SteadyStateDetector;
use crate::solver::Step;
use crate::system::Equations;
use thiserror::Error;

/// Which zero crossings of the switching function count as events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDirection {
    /// From positive to negative.
    Decreasing,
    /// From negative to positive.
    Increasing,
    Both,
}

impl EventDirection {
    fn accepts(self, g_before: f64) -> bool {
        match self {
            EventDirection::Decreasing => g_before > 0.0,
            EventDirection::Increasing => g_before < 0.0,
            EventDirection::Both => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventSettings {
    /// Longest interval between two evaluations of the switching function.
    pub max_check_interval: f64,
    /// Width of the bracket at which the search stops.
    pub convergence: f64,
    pub max_iterations: usize,
    pub direction: EventDirection,
}

#[derive(Debug, Error, PartialEq)]
pub enum RootError {
    #[error("function values at t = {lower} and t = {upper} do not bracket a root")]
    NoBracketing { lower: f64, upper: f64 },

    #[error("bisection did not converge within {iterations} iterations")]
    Diverged { iterations: usize },
}

/// Locate a root of `f` in `[lower, upper]` by bisection.
///
/// `f_lower` and `f_upper` must be finite and of opposite sign (or zero).
/// Returns the end of the final bracket that lies past the crossing.
pub fn bisect<F>(
    mut f: F,
    mut lower: f64,
    mut upper: f64,
    mut f_lower: f64,
    f_upper: f64,
    convergence: f64,
    max_iterations: usize,
) -> Result<f64, RootError>
where
    F: FnMut(f64) -> f64,
{
    let no_bracketing = RootError::NoBracketing { lower, upper };
    if !f_lower.is_finite() || !f_upper.is_finite() || f_lower * f_upper > 0.0 {
        return Err(no_bracketing);
    }
    if f_upper == 0.0 {
        return Ok(upper);
    }
    if f_lower == 0.0 {
        return Ok(lower);
    }

    for _ in 0..max_iterations {
        if (upper - lower).abs() <= convergence {
            return Ok(upper);
        }
        let mid = 0.5 * (lower + upper);
        let f_mid = f(mid);
        if !f_mid.is_finite() {
            return Err(no_bracketing);
        }
        if f_mid == 0.0 {
            return Ok(mid);
        }
        if f_lower * f_mid < 0.0 {
            upper = mid;
        } else {
            lower = mid;
            f_lower = f_mid;
        }
    }

    Err(RootError::Diverged {
        iterations: max_iterations,
    })
}

/// A steady-state detector registered with the integrator.
#[derive(Debug, Clone)]
pub struct EventHandler {
    detector: SteadyStateDetector,
    settings: EventSettings,
    // Switching function at the start of the next step, when still valid.
    g_last: Option<f64>,
}

impl EventHandler {
    pub fn new(detector: SteadyStateDetector, settings: EventSettings) -> Self {
        Self {
            detector,
            settings,
            g_last: None,
        }
    }

    pub fn detector(&self) -> &SteadyStateDetector {
        &self.detector
    }

    /// Forget the cached switching value; called at the start of every integration.
    pub fn reset(&mut self) {
        self.g_last = None;
    }

    /// Scan `step` for an accepted crossing and return its time.
    pub fn find_event<E: Equations>(
        &mut self,
        equations: &E,
        step: &Step<'_>,
    ) -> Result<Option<f64>, RootError> {
        self.detector.scan_step(step);
        let mut state = vec![0.0; step.dimension()];
        let mut g_at = |t: f64| {
            step.interpolate(t, &mut state);
            self.detector.g(t, &state, equations)
        };

        let mut t_a = step.t0;
        let mut g_a = match self.g_last {
            Some(g) => g,
            None => g_at(t_a),
        };

        let span = step.t1 - step.t0;
        let n_checks = (span / self.settings.max_check_interval).ceil().max(1.0) as usize;

        for i in 1..=n_checks {
            let t_b = if i == n_checks {
                step.t1
            } else {
                step.t0 + span * i as f64 / n_checks as f64
            };
            let g_b = g_at(t_b);
            if !g_a.is_finite() || !g_b.is_finite() {
                return Err(RootError::NoBracketing {
                    lower: t_a,
                    upper: t_b,
                });
            }

            let crossed = (g_a > 0.0 && g_b <= 0.0) || (g_a < 0.0 && g_b >= 0.0);
            if crossed && self.settings.direction.accepts(g_a) {
                let root = bisect(
                    &mut g_at,
                    t_a,
                    t_b,
                    g_a,
                    g_b,
                    self.settings.convergence,
                    self.settings.max_iterations,
                )?;
                return Ok(Some(root));
            }

            t_a = t_b;
            g_a = g_b;
        }

        self.g_last = Some(g_a);
        Ok(None)
    }

    /// Mark the detector as having stopped the integration at `t`.
    pub fn stop_at(&mut self, t: f64) {
        self.detector.stop_at(t);
    }

    pub fn step_accepted(&mut self, step: &Step<'_>) {
        if self.detector.record_step(step) {
            self.g_last = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bisection_finds_sqrt_two() {
        let root = bisect(|x| x * x - 2.0, 0.0, 2.0, -2.0, 2.0, 1e-12, 200).unwrap();
        assert!((root - 2f64.sqrt()).abs() < 1e-11);
    }

    #[test]
    fn bisection_returns_point_past_decreasing_crossing() {
        let root = bisect(|x| 1.0 - x, 0.0, 4.0, 1.0, -3.0, 1e-3, 100).unwrap();
        assert!(root >= 1.0 && root - 1.0 <= 1e-3);
    }

    #[test]
    fn same_signs_do_not_bracket() {
        let err = bisect(|x| x * x + 1.0, -1.0, 1.0, 2.0, 2.0, 1e-6, 100).unwrap_err();
        assert_eq!(
            err,
            RootError::NoBracketing {
                lower: -1.0,
                upper: 1.0
            }
        );
    }

    #[test]
    fn nan_inside_bracket_is_a_bracketing_failure() {
        let err = bisect(
            |x| if x > 0.2 { f64::NAN } else { x - 0.5 },
            0.0,
            1.0,
            -0.5,
            0.5,
            1e-9,
            100,
        )
        .unwrap_err();
        assert!(matches!(err, RootError::NoBracketing { .. }));
    }

    #[test]
    fn iteration_limit_is_enforced() {
        let err = bisect(|x| x - 0.3, 0.0, 1.0, -0.3, 0.7, 0.0, 5).unwrap_err();
        assert_eq!(err, RootError::Diverged { iterations: 5 });
    }

    #[test]
    fn direction_filter() {
        assert!(EventDirection::Decreasing.accepts(1.0));
        assert!(!EventDirection::Decreasing.accepts(-1.0));
        assert!(EventDirection::Increasing.accepts(-1.0));
        assert!(EventDirection::Both.accepts(1.0));
    }
}
