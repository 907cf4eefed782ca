use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Parameters of a single simulation run.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct SimulationParameters {
    /// Number of sampling intervals to simulate.
    pub timesteps: usize,
    /// Time between consecutive samples.
    pub step_size: f64,
    /// Stop early when a steady state is detected.
    pub stop_on_steady_state: bool,
    /// Keep the biomass time series in the written results.
    pub record_biomass: bool,
}

impl SimulationParameters {
    pub fn validate(&self) -> Result<()> {
        check_num(self.timesteps, 1..=100_000_000).context("invalid number of timesteps")?;
        check_num(self.step_size, f64::MIN_POSITIVE..=1.0e6).context("invalid step size")?;
        Ok(())
    }
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            timesteps: 1000,
            step_size: 0.1,
            stop_on_steady_state: true,
            record_biomass: true,
        }
    }
}

/// What happens to biomass values that fall below the extinction threshold.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtinctionPolicy {
    /// Values are left untouched; they only stop contributing to predation.
    #[default]
    Retain,
    /// Values are set to exactly zero after every accepted integration step.
    ClampToZero,
}

/// Allometric constants of the bioenergetic model.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConstants {
    pub extinction_threshold: f64,
    pub extinction_policy: ExtinctionPolicy,

    /// Metabolic scaling coefficient `a_x` of consumers.
    pub consumer_metabolic_coefficient: f64,
    /// Metabolic scaling coefficient `a_x` of producers.
    pub producer_metabolic_coefficient: f64,
    /// Exponent of the body-mass scaling law.
    pub metabolic_exponent: f64,
    /// Body mass all other masses are measured against.
    pub reference_body_mass: f64,

    pub growth_rate: f64,
    pub carrying_capacity: f64,
    pub max_ingestion_rate: f64,
    pub half_saturation: f64,
    /// Exponent `q` turning the type II response into a type III one.
    pub functional_response_control: f64,
    pub predator_interference: f64,

    pub producer_assimilation_efficiency: f64,
    pub consumer_assimilation_efficiency: f64,
}

impl Default for ModelConstants {
    fn default() -> Self {
        Self {
            extinction_threshold: 1.0e-15,
            extinction_policy: ExtinctionPolicy::Retain,
            consumer_metabolic_coefficient: 0.314,
            producer_metabolic_coefficient: 0.138,
            metabolic_exponent: -0.25,
            reference_body_mass: 1.0,
            growth_rate: 1.0,
            carrying_capacity: 5000.0,
            max_ingestion_rate: 8.0,
            half_saturation: 1500.0,
            functional_response_control: 0.2,
            predator_interference: 0.0,
            producer_assimilation_efficiency: 0.45,
            consumer_assimilation_efficiency: 0.85,
        }
    }
}

/// Step-size control of the adaptive integrator.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntegratorSettings {
    pub max_step: f64,
    /// Absolute tolerance; the extinction threshold when unset.
    pub absolute_tolerance: Option<f64>,
    pub relative_tolerance: f64,
    pub max_steps_per_chunk: usize,
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        Self {
            max_step: 100.0,
            absolute_tolerance: None,
            relative_tolerance: 1.0e-10,
            max_steps_per_chunk: 10_000_000,
        }
    }
}

/// Thresholds of the steady-state detectors.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorSettings {
    /// Relative rate of change below which the system counts as constant.
    pub constant_threshold: f64,
    /// Longest interval between two checks of the constant detector.
    pub constant_max_check_interval: f64,
    /// Largest distance at which a return counts as a revisit, relative to
    /// how far the trajectory had moved away from the revisited state.
    pub oscillation_tolerance: f64,
    /// How far (in tolerances, relative to the state's norm) the trajectory
    /// must leave a state before it may return.
    pub oscillation_excursion_factor: f64,
    pub oscillation_history_capacity: usize,
    pub convergence: f64,
    pub max_iterations: usize,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            constant_threshold: 1.0e-6,
            constant_max_check_interval: 1.0,
            oscillation_tolerance: 1.0e-4,
            oscillation_excursion_factor: 10.0,
            oscillation_history_capacity: 2048,
            convergence: 1.0e-4,
            max_iterations: 1000,
        }
    }
}

/// Model configuration.
///
/// Every section and key is optional. Loaded from a TOML file and validated
/// before use. See [`ModelConfig::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub model: ModelConstants,
    pub integrator: IntegratorSettings,
    pub detectors: DetectorSettings,
}

impl ModelConfig {
    /// Load a [`ModelConfig`] from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: ModelConfig =
            toml::from_str(contents).context("failed to deserialize model config")?;

        config.validate().context("failed to validate model config")?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.model;
        check_num(m.extinction_threshold, 0.0..1.0).context("invalid extinction threshold")?;
        check_num(m.consumer_metabolic_coefficient, 0.0..=100.0)
            .context("invalid consumer metabolic coefficient")?;
        check_num(m.producer_metabolic_coefficient, 0.0..=100.0)
            .context("invalid producer metabolic coefficient")?;
        check_num(m.metabolic_exponent, -2.0..=0.0).context("invalid metabolic exponent")?;
        check_num(m.reference_body_mass, f64::MIN_POSITIVE..f64::INFINITY)
            .context("invalid reference body mass")?;
        check_num(m.growth_rate, 0.0..=100.0).context("invalid growth rate")?;
        check_num(m.carrying_capacity, f64::MIN_POSITIVE..f64::INFINITY)
            .context("invalid carrying capacity")?;
        check_num(m.max_ingestion_rate, 0.0..=1000.0).context("invalid max ingestion rate")?;
        check_num(m.half_saturation, f64::MIN_POSITIVE..f64::INFINITY)
            .context("invalid half saturation density")?;
        check_num(m.functional_response_control, 0.0..=2.0)
            .context("invalid functional response control")?;
        check_num(m.predator_interference, 0.0..=100.0)
            .context("invalid predator interference")?;
        check_num(m.producer_assimilation_efficiency, f64::MIN_POSITIVE..=1.0)
            .context("invalid producer assimilation efficiency")?;
        check_num(m.consumer_assimilation_efficiency, f64::MIN_POSITIVE..=1.0)
            .context("invalid consumer assimilation efficiency")?;

        let i = &self.integrator;
        check_num(i.max_step, f64::MIN_POSITIVE..f64::INFINITY)
            .context("invalid maximal step")?;
        if let Some(atol) = i.absolute_tolerance {
            check_num(atol, f64::MIN_POSITIVE..1.0).context("invalid absolute tolerance")?;
        }
        check_num(i.relative_tolerance, f64::MIN_POSITIVE..1.0)
            .context("invalid relative tolerance")?;
        check_num(i.max_steps_per_chunk, 1..=u32::MAX as usize)
            .context("invalid max steps per chunk")?;

        let d = &self.detectors;
        check_num(d.constant_threshold, f64::MIN_POSITIVE..1.0)
            .context("invalid constant steady-state threshold")?;
        check_num(d.constant_max_check_interval, f64::MIN_POSITIVE..f64::INFINITY)
            .context("invalid constant detector check interval")?;
        check_num(d.oscillation_tolerance, f64::MIN_POSITIVE..1.0)
            .context("invalid oscillation tolerance")?;
        check_num(d.oscillation_excursion_factor, 1.0..=1.0e6)
            .context("invalid oscillation excursion factor")?;
        check_num(d.oscillation_history_capacity, 2..=1_000_000)
            .context("invalid oscillation history capacity")?;
        check_num(d.convergence, f64::MIN_POSITIVE..1.0).context("invalid event convergence")?;
        check_num(d.max_iterations, 1..=100_000).context("invalid event iteration limit")?;

        Ok(())
    }
}

pub fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}
