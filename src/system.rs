use crate::config::ExtinctionPolicy;
use serde::{Serialize, de::DeserializeOwned};

/// A system of first-order ODEs over a biomass vector.
pub trait Equations {
    /// Model parameters copied into the simulation results.
    type Parameters: Clone + Serialize + DeserializeOwned;

    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// t: current time
    /// biomass: current state
    /// out: buffer receiving dB/dt
    fn derivative(&self, t: f64, biomass: &[f64], out: &mut [f64]);

    /// Biomass below which a species no longer interacts.
    fn extinction_threshold(&self) -> f64;

    /// Whether the integrator zeroes values below the extinction threshold.
    fn extinction_policy(&self) -> ExtinctionPolicy {
        ExtinctionPolicy::Retain
    }

    fn parameters(&self) -> Self::Parameters;

    /// Scalar measure of how far the system is from a fixed point.
    ///
    /// Defaults to the largest relative rate of change `|dB_i/dt| / B_i`
    /// over the species that are not extinct. Zero when all are extinct.
    fn steady_state_indicator(&self, t: f64, biomass: &[f64]) -> f64 {
        let mut rates = vec![0.0; biomass.len()];
        self.derivative(t, biomass, &mut rates);

        let threshold = self.extinction_threshold();
        biomass
            .iter()
            .zip(&rates)
            .filter(|&(&b, _)| b >= threshold && b > 0.0)
            .map(|(&b, &rate)| (rate / b).abs())
            .fold(0.0, f64::max)
    }
}
