use crate::config::{DetectorSettings, IntegratorSettings, SimulationParameters};
use crate::detector::{ConstantDetector, OscillatingDetector, SteadyStateDetector, StopEvent};
use crate::events::{EventDirection, EventHandler, EventSettings};
use crate::sampler::Sampler;
use crate::solver::{IntegrationError, Integrator};
use crate::system::Equations;
use anyhow::Context;
use rmp_serde::{decode, encode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
    sync::{Arc, atomic::AtomicBool},
};
use thiserror::Error;

/// End index of the first integration chunk; later chunks double it.
const FIRST_CHUNK_END: usize = 1000;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("initial biomass has {actual} entries, but the model has {expected} species")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid simulation parameters: {0}")]
    InvalidParameters(String),

    #[error(transparent)]
    Integration(#[from] IntegrationError),
}

/// Output of one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResults<P> {
    pub parameters: SimulationParameters,
    pub model_parameters: P,
    /// Row `i` is the biomass at `t = i * step_size`. Empty when biomass
    /// recording is disabled.
    pub biomass: Vec<Vec<f64>>,
    pub timesteps_simulated: usize,
    pub stop_event: StopEvent,
}

impl<P: Serialize> SimulationResults<P> {
    pub fn save<Q: AsRef<Path>>(&self, file: Q) -> anyhow::Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);
        encode::write_named(&mut writer, self).context("failed to serialize results")?;
        writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }
}

impl<P: DeserializeOwned> SimulationResults<P> {
    pub fn load<Q: AsRef<Path>>(file: Q) -> anyhow::Result<Self> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut reader = BufReader::new(file);
        let results = decode::from_read(&mut reader).context("failed to deserialize results")?;
        Ok(results)
    }
}

/// A single run of `E` from a fixed initial condition.
///
/// The horizon is integrated in chunks whose end doubles each time, so
/// that a run reaching a steady state early stops early, while the
/// oscillation detector gets successively longer windows to find a period.
pub struct Simulation<E> {
    parameters: SimulationParameters,
    equations: E,
    initial_biomass: Vec<f64>,
    integrator: IntegratorSettings,
    detectors: DetectorSettings,
    cancel: Option<Arc<AtomicBool>>,
}

impl<E: Equations> Simulation<E> {
    pub fn new(
        parameters: SimulationParameters,
        equations: E,
        initial_biomass: Vec<f64>,
    ) -> Result<Self, SimulationError> {
        if initial_biomass.len() != equations.dimension() {
            return Err(SimulationError::DimensionMismatch {
                expected: equations.dimension(),
                actual: initial_biomass.len(),
            });
        }
        parameters
            .validate()
            .map_err(|err| SimulationError::InvalidParameters(format!("{err:#}")))?;

        Ok(Self {
            parameters,
            equations,
            initial_biomass,
            integrator: IntegratorSettings::default(),
            detectors: DetectorSettings::default(),
            cancel: None,
        })
    }

    pub fn with_settings(
        mut self,
        integrator: IntegratorSettings,
        detectors: DetectorSettings,
    ) -> Self {
        self.integrator = integrator;
        self.detectors = detectors;
        self
    }

    /// Abort the run with [`IntegrationError::Cancelled`] once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn run(&self) -> Result<SimulationResults<E::Parameters>, SimulationError> {
        let SimulationParameters {
            timesteps,
            step_size,
            stop_on_steady_state,
            record_biomass,
        } = self.parameters;

        let mut sampler = Sampler::new(step_size, timesteps + 1, self.equations.dimension());
        sampler.set_row(0, &self.initial_biomass);

        let mut solver = Integrator::new(&self.equations, &self.integrator, step_size);
        if let Some(flag) = &self.cancel {
            solver.set_cancel_flag(flag.clone());
        }
        if stop_on_steady_state {
            solver.add_event_handler(self.constant_handler());
        }

        let mut start = 0;
        let mut prev_start = None;
        let mut end = timesteps.min(FIRST_CHUNK_END);
        let mut chunk = 0;
        let mut stop = None;

        while start < timesteps && prev_start.is_none_or(|prev| start > prev) {
            // Give the trajectory one chunk to leave its initial transient.
            // No handlers left means detection was dropped after a failure.
            if stop_on_steady_state && chunk == 1 && !solver.event_handlers().is_empty() {
                solver.add_event_handler(self.oscillating_handler());
            }

            log::debug!("integrating timesteps {start} to {end}");
            self.integrate_chunk(&mut solver, &mut sampler, start, end)?;

            stop = first_stop(&solver);
            if stop.is_some() {
                break;
            }

            prev_start = Some(start);
            start = sampler.last_handled().unwrap_or(start);
            end = timesteps.min(end * 2);
            chunk += 1;
        }

        let (stop_event, timesteps_simulated) = match stop {
            Some((event, t)) => (event, (t / step_size).floor() as usize),
            None => (StopEvent::None, timesteps),
        };
        let timesteps_simulated = timesteps_simulated.min(sampler.rows());

        let biomass = if record_biomass {
            sampler.into_series()
        } else {
            Vec::new()
        };

        Ok(SimulationResults {
            parameters: self.parameters,
            model_parameters: self.equations.parameters(),
            biomass,
            timesteps_simulated,
            stop_event,
        })
    }

    /// Integrate from row `start` to row `end`.
    ///
    /// When an event search fails, all detectors are dropped and the rest
    /// of the chunk is integrated again from the last sampled row.
    fn integrate_chunk(
        &self,
        solver: &mut Integrator,
        sampler: &mut Sampler,
        start: usize,
        end: usize,
    ) -> Result<(), SimulationError> {
        let t_end = sampler.time_of(end);
        let t_start = sampler.time_of(start);
        let y0 = sampler.row(start).to_vec();
        sampler.begin(start);

        match solver.integrate(&self.equations, t_start, &y0, t_end, sampler) {
            Ok(_) => Ok(()),
            Err(err) if err.is_root_finding_failure() => {
                log::warn!("{err}; removing steady-state detectors");
                solver.clear_event_handlers();

                let resume = sampler.last_handled().unwrap_or(start);
                let t_resume = sampler.time_of(resume);
                let y = sampler.row(resume).to_vec();
                sampler.begin(resume);
                solver.integrate(&self.equations, t_resume, &y, t_end, sampler)?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn constant_handler(&self) -> EventHandler {
        let d = &self.detectors;
        EventHandler::new(
            SteadyStateDetector::Constant(ConstantDetector::new(d.constant_threshold)),
            EventSettings {
                max_check_interval: d.constant_max_check_interval,
                convergence: d.convergence,
                max_iterations: d.max_iterations,
                direction: EventDirection::Decreasing,
            },
        )
    }

    fn oscillating_handler(&self) -> EventHandler {
        let d = &self.detectors;
        let step_size = self.parameters.step_size;
        EventHandler::new(
            SteadyStateDetector::Oscillating(OscillatingDetector::new(
                d.oscillation_tolerance,
                d.oscillation_excursion_factor,
                d.oscillation_history_capacity,
                step_size,
                self.equations.extinction_threshold(),
            )),
            EventSettings {
                max_check_interval: step_size,
                convergence: d.convergence,
                max_iterations: d.max_iterations,
                direction: EventDirection::Both,
            },
        )
    }
}

/// The first detector, in registration order, that stopped the integration.
fn first_stop(solver: &Integrator) -> Option<(StopEvent, f64)> {
    solver.event_handlers().iter().find_map(|handler| {
        let detector = handler.detector();
        detector
            .time_stopped()
            .map(|t| (detector.stop_event(), t))
    })
}
