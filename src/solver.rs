//! Event-aware integration on top of the `ode_solvers` Dormand-Prince 5(4) stepper.
//!
//! The stepper reports every accepted step through `solout`. Consecutive
//! reports are joined by a cubic Hermite interpolant, which is what observers,
//! event handlers and detectors see.

use crate::config::{ExtinctionPolicy, IntegratorSettings};
use crate::events::{EventHandler, RootError};
use crate::system::Equations;
use ode_solvers::dop_shared::{IntegrationError as StepperError, OutputType};
use ode_solvers::dopri5::Dopri5;
use ode_solvers::{DVector, System};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use thiserror::Error;

type State = DVector<f64>;

const SAFETY_FACTOR: f64 = 0.9;
const BETA: f64 = 0.04;
const FAC_MIN: f64 = 0.2;
const FAC_MAX: f64 = 10.0;
const NO_STIFFNESS_CHECK: u32 = u32::MAX;

#[derive(Debug, Error, PartialEq)]
pub enum IntegrationError {
    #[error("no sign change bracketed for an event between t = {lower} and t = {upper}")]
    NoBracketing { lower: f64, upper: f64 },

    #[error("event time search did not converge within {iterations} iterations")]
    EventSearchDiverged { iterations: usize },

    #[error("step size fell below the minimum at t = {t}")]
    StepSizeUnderflow { t: f64 },

    #[error("state became non-finite at t = {t}")]
    NonFinite { t: f64 },

    #[error("exceeded {steps} steps at t = {t}")]
    TooManySteps { t: f64, steps: usize },

    #[error("integrator failed at t = {t}: {reason}")]
    Stepper { t: f64, reason: String },

    #[error("integration cancelled at t = {t}")]
    Cancelled { t: f64 },
}

impl IntegrationError {
    /// Failures of the event time search, as opposed to the integration itself.
    pub fn is_root_finding_failure(&self) -> bool {
        matches!(
            self,
            IntegrationError::NoBracketing { .. } | IntegrationError::EventSearchDiverged { .. }
        )
    }
}

impl From<RootError> for IntegrationError {
    fn from(err: RootError) -> Self {
        match err {
            RootError::NoBracketing { lower, upper } => {
                IntegrationError::NoBracketing { lower, upper }
            }
            RootError::Diverged { iterations } => {
                IntegrationError::EventSearchDiverged { iterations }
            }
        }
    }
}

/// One accepted step with its continuous extension.
///
/// `t0..=t1` is the interval handed to observers; it is shorter than the
/// stepper's step when an event stopped the integration inside it.
#[derive(Clone, Copy)]
pub struct Step<'a> {
    pub t0: f64,
    pub t1: f64,
    h: f64,
    y0: &'a [f64],
    y1: &'a [f64],
    f0: &'a [f64],
    f1: &'a [f64],
}

impl<'a> Step<'a> {
    /// The step from `(t0, y0)` to `(t1, y1)` with derivatives `f0` and `f1`.
    pub fn new(
        t0: f64,
        t1: f64,
        y0: &'a [f64],
        y1: &'a [f64],
        f0: &'a [f64],
        f1: &'a [f64],
    ) -> Self {
        Self {
            t0,
            t1,
            h: t1 - t0,
            y0,
            y1,
            f0,
            f1,
        }
    }

    pub fn dimension(&self) -> usize {
        self.y0.len()
    }

    /// Cubic Hermite interpolation of the state at `t`.
    pub fn interpolate(&self, t: f64, out: &mut [f64]) {
        let h = self.h;
        if h == 0.0 {
            out.copy_from_slice(self.y1);
            return;
        }
        let s = (t - self.t0) / h;
        let s2 = s * s;
        let s3 = s2 * s;
        let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
        let h10 = s3 - 2.0 * s2 + s;
        let h01 = -2.0 * s3 + 3.0 * s2;
        let h11 = s3 - s2;
        for i in 0..out.len() {
            out[i] = h00 * self.y0[i]
                + h10 * h * self.f0[i]
                + h01 * self.y1[i]
                + h11 * h * self.f1[i];
        }
    }

    /// Time derivative of the interpolant at `t`.
    pub fn velocity(&self, t: f64, out: &mut [f64]) {
        let h = self.h;
        if h == 0.0 {
            out.copy_from_slice(self.f1);
            return;
        }
        let s = (t - self.t0) / h;
        let s2 = s * s;
        let d00 = 6.0 * s2 - 6.0 * s;
        let d10 = 3.0 * s2 - 4.0 * s + 1.0;
        let d11 = 3.0 * s2 - 2.0 * s;
        for i in 0..out.len() {
            out[i] = d00 * (self.y0[i] - self.y1[i]) / h + d10 * self.f0[i] + d11 * self.f1[i];
        }
    }
}

/// Receives every accepted step, truncated at a stopping event.
pub trait StepObserver {
    fn observe(&mut self, step: &Step<'_>);
}

/// How an integration call ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Completed { t: f64 },
    /// Handler `handler` stopped the integration at `t`.
    Stopped { t: f64, handler: usize },
}

/// Dormand-Prince 5(4) integration with steady-state event handlers.
pub struct Integrator {
    max_step: f64,
    atol: f64,
    rtol: f64,
    max_steps: usize,
    output_interval: f64,
    policy: ExtinctionPolicy,
    threshold: f64,
    handlers: Vec<EventHandler>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Integrator {
    /// `output_interval` is the spacing of the stepper's dense output.
    pub fn new<E: Equations>(
        equations: &E,
        settings: &IntegratorSettings,
        output_interval: f64,
    ) -> Self {
        let threshold = equations.extinction_threshold();
        Self {
            max_step: settings.max_step,
            atol: settings
                .absolute_tolerance
                .unwrap_or(threshold)
                .max(f64::MIN_POSITIVE),
            rtol: settings.relative_tolerance,
            max_steps: settings.max_steps_per_chunk,
            output_interval,
            policy: equations.extinction_policy(),
            threshold,
            handlers: Vec::new(),
            cancel: None,
        }
    }

    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = Some(flag);
    }

    pub fn add_event_handler(&mut self, handler: EventHandler) {
        self.handlers.push(handler);
    }

    pub fn clear_event_handlers(&mut self) {
        self.handlers.clear();
    }

    /// Registered handlers, in registration order.
    pub fn event_handlers(&self) -> &[EventHandler] {
        &self.handlers
    }

    /// Integrate from `(t0, y0)` to `t_end`, or until an event handler stops it.
    pub fn integrate<E, O>(
        &mut self,
        equations: &E,
        t0: f64,
        y0: &[f64],
        t_end: f64,
        observer: &mut O,
    ) -> Result<Outcome, IntegrationError>
    where
        E: Equations,
        O: StepObserver,
    {
        for handler in &mut self.handlers {
            handler.reset();
        }

        let mut tracker = Tracker {
            handlers: &mut self.handlers,
            observer,
            cancel: self.cancel.as_deref(),
            policy: self.policy,
            threshold: self.threshold,
            t: t0,
            y: y0.to_vec(),
            f: vec![0.0; y0.len()],
            y_new: vec![0.0; y0.len()],
            f_new: vec![0.0; y0.len()],
            stop: None,
        };
        if tracker.policy == ExtinctionPolicy::ClampToZero {
            clamp_extinct(&mut tracker.y, tracker.threshold);
        }
        equations.derivative(t0, &tracker.y, &mut tracker.f);
        if !all_finite(&tracker.y) || !all_finite(&tracker.f) {
            return Err(IntegrationError::NonFinite { t: t0 });
        }

        let n_max = u32::try_from(self.max_steps).unwrap_or(u32::MAX);
        let t_done = t_end - 1e-12 * t_end.abs().max(1.0);
        loop {
            if tracker.cancelled() {
                return Err(IntegrationError::Cancelled { t: tracker.t });
            }
            if tracker.t >= t_done {
                return Ok(Outcome::Completed { t: t_end });
            }

            let t_start = tracker.t;
            let y_start = State::from_column_slice(&tracker.y);
            let result = {
                let driver = Driver {
                    equations,
                    tracker: &mut tracker,
                };
                let mut stepper = Dopri5::from_param(
                    driver,
                    t_start,
                    t_end,
                    self.output_interval,
                    y_start,
                    self.rtol,
                    self.atol,
                    SAFETY_FACTOR,
                    BETA,
                    FAC_MIN,
                    FAC_MAX,
                    self.max_step.min(t_end - t_start),
                    0.0,
                    n_max,
                    NO_STIFFNESS_CHECK,
                    OutputType::Dense,
                );
                stepper.integrate()
            };

            match tracker.stop.take() {
                Some(Stop::Event { t, handler }) => return Ok(Outcome::Stopped { t, handler }),
                Some(Stop::Cancelled) => {
                    return Err(IntegrationError::Cancelled { t: tracker.t });
                }
                Some(Stop::Failed(err)) => return Err(err),
                Some(Stop::Clamped) => continue,
                None => {}
            }

            return match result {
                Ok(_) => Ok(Outcome::Completed { t: t_end }),
                Err(err) => Err(stepper_error(err, tracker.t, self.max_steps)),
            };
        }
    }
}

/// Why `solout` asked the stepper to stop.
enum Stop {
    Event { t: f64, handler: usize },
    Cancelled,
    Failed(IntegrationError),
    /// The state was clamped; the stepper restarts from it.
    Clamped,
}

/// Integration state shared between the stepper callbacks and [`Integrator::integrate`].
struct Tracker<'a, O> {
    handlers: &'a mut [EventHandler],
    observer: &'a mut O,
    cancel: Option<&'a AtomicBool>,
    policy: ExtinctionPolicy,
    threshold: f64,
    // Last accepted point and its derivative.
    t: f64,
    y: Vec<f64>,
    f: Vec<f64>,
    y_new: Vec<f64>,
    f_new: Vec<f64>,
    stop: Option<Stop>,
}

impl<O: StepObserver> Tracker<'_, O> {
    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Handle an accepted step ending at `(t1, y1)`. Returns true to stop the stepper.
    fn accept<E: Equations>(&mut self, equations: &E, t1: f64, y1: &[f64]) -> bool {
        if self.cancelled() {
            self.stop = Some(Stop::Cancelled);
            return true;
        }
        if t1 <= self.t {
            return false;
        }

        self.y_new.copy_from_slice(y1);
        let clamped = self.policy == ExtinctionPolicy::ClampToZero
            && clamp_extinct(&mut self.y_new, self.threshold);
        equations.derivative(t1, &self.y_new, &mut self.f_new);
        if !all_finite(&self.y_new) || !all_finite(&self.f_new) {
            self.stop = Some(Stop::Failed(IntegrationError::NonFinite { t: self.t }));
            return true;
        }

        let step = Step::new(self.t, t1, &self.y, &self.y_new, &self.f, &self.f_new);

        match locate_event(self.handlers, equations, &step) {
            Err(err) => {
                self.stop = Some(Stop::Failed(err));
                return true;
            }
            Ok(Some((t_event, index))) => {
                let truncated = Step {
                    t1: t_event,
                    ..step
                };
                self.observer.observe(&truncated);
                self.handlers[index].stop_at(t_event);
                self.stop = Some(Stop::Event {
                    t: t_event,
                    handler: index,
                });
                return true;
            }
            Ok(None) => {}
        }

        self.observer.observe(&step);
        for handler in self.handlers.iter_mut() {
            handler.step_accepted(&step);
        }

        self.t = t1;
        std::mem::swap(&mut self.y, &mut self.y_new);
        std::mem::swap(&mut self.f, &mut self.f_new);

        if clamped {
            self.stop = Some(Stop::Clamped);
        }
        clamped
    }
}

/// Adapter exposing [`Equations`] to the stepper.
struct Driver<'d, 't, E, O> {
    equations: &'d E,
    tracker: &'d mut Tracker<'t, O>,
}

impl<E: Equations, O: StepObserver> System<f64, State> for Driver<'_, '_, E, O> {
    fn system(&self, t: f64, y: &State, dy: &mut State) {
        self.equations
            .derivative(t, y.as_slice(), dy.as_mut_slice());
    }

    fn solout(&mut self, t: f64, y: &State, _dy: &State) -> bool {
        self.tracker.accept(self.equations, t, y.as_slice())
    }
}

fn stepper_error(err: StepperError, t: f64, max_steps: usize) -> IntegrationError {
    match err {
        StepperError::MaxNumStepReached { .. } => IntegrationError::TooManySteps {
            t,
            steps: max_steps,
        },
        StepperError::StepSizeUnderflow { .. } => IntegrationError::StepSizeUnderflow { t },
        other => IntegrationError::Stepper {
            t,
            reason: other.to_string(),
        },
    }
}

fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite())
}

fn clamp_extinct(state: &mut [f64], threshold: f64) -> bool {
    let mut changed = false;
    for value in state.iter_mut() {
        if *value < threshold && *value != 0.0 {
            *value = 0.0;
            changed = true;
        }
    }
    changed
}

/// Find the earliest event inside `step`. Ties go to the handler registered first.
fn locate_event<E: Equations>(
    handlers: &mut [EventHandler],
    equations: &E,
    step: &Step<'_>,
) -> Result<Option<(f64, usize)>, IntegrationError> {
    let mut earliest: Option<(f64, usize)> = None;
    for (index, handler) in handlers.iter_mut().enumerate() {
        if let Some(t_event) = handler.find_event(equations, step)? {
            if earliest.is_none_or(|(t, _)| t_event < t) {
                earliest = Some((t_event, index));
            }
        }
    }
    Ok(earliest)
}
