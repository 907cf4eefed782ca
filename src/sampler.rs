use crate::solver::{Step, StepObserver};

/// Writes the continuous solution into a fixed-cadence time series.
///
/// Row `i` holds the state at `t = i * step_size`. Every row that falls
/// inside an accepted step is written from the step's dense output.
#[derive(Debug, Clone)]
pub struct Sampler {
    step_size: f64,
    series: Vec<Vec<f64>>,
    next: usize,
    last_handled: Option<usize>,
}

impl Sampler {
    /// A series of `rows` rows of `dimension` zeros.
    pub fn new(step_size: f64, rows: usize, dimension: usize) -> Self {
        Self {
            step_size,
            series: vec![vec![0.0; dimension]; rows],
            next: 0,
            last_handled: None,
        }
    }

    /// Start a new integration chunk at row `start`.
    pub fn begin(&mut self, start: usize) {
        self.next = start;
    }

    pub fn row(&self, index: usize) -> &[f64] {
        &self.series[index]
    }

    pub fn set_row(&mut self, index: usize, values: &[f64]) {
        self.series[index].copy_from_slice(values);
    }

    pub fn time_of(&self, index: usize) -> f64 {
        index as f64 * self.step_size
    }

    /// Index of the last row written.
    pub fn last_handled(&self) -> Option<usize> {
        self.last_handled
    }

    pub fn rows(&self) -> usize {
        self.series.len()
    }

    pub fn into_series(self) -> Vec<Vec<f64>> {
        self.series
    }
}

impl StepObserver for Sampler {
    fn observe(&mut self, step: &Step<'_>) {
        let slack = 1e-9 * self.step_size;
        while self.next < self.series.len() && self.time_of(self.next) <= step.t1 + slack {
            let t = self.time_of(self.next).clamp(step.t0, step.t1);
            step.interpolate(t, &mut self.series[self.next]);
            self.last_handled = Some(self.next);
            self.next += 1;
        }
    }
}
