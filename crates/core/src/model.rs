//! Least-squares linear map from an observed memory reading to the integer a
//! probe submission encoded.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("need at least 2 samples to fit a line, got {0}")]
    NotEnoughSamples(usize),
    #[error("all sample x values are identical, fit is degenerate")]
    Degenerate,
    #[error("model has not been fitted")]
    NotFitted,
}

/// Fitted coefficients of the memory-to-integer map.
///
/// These two numbers are the only model state that survives a checkpoint;
/// rehydration does not need the original samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coefficients {
    pub slope: f64,
    pub intercept: f64,
}

impl Coefficients {
    pub fn is_finite(&self) -> bool {
        self.slope.is_finite() && self.intercept.is_finite()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LinearModel {
    samples: Vec<(f64, f64)>,
    coefficients: Option<Coefficients>,
}

impl LinearModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rehydrate a fitted model from checkpointed coefficients.
    pub fn from_coefficients(coefficients: Coefficients) -> Self {
        Self {
            samples: Vec::new(),
            coefficients: Some(coefficients),
        }
    }

    /// Append a calibration sample. Invalidates any previous fit.
    pub fn add_point(&mut self, x: f64, y: f64) {
        self.samples.push((x, y));
        self.coefficients = None;
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Fit slope and intercept over all accumulated samples.
    pub fn fit(&mut self) -> Result<Coefficients, ModelError> {
        if self.samples.len() < 2 {
            return Err(ModelError::NotEnoughSamples(self.samples.len()));
        }

        let n = self.samples.len() as f64;
        let x_mean = self.samples.iter().map(|(x, _)| x).sum::<f64>() / n;
        let y_mean = self.samples.iter().map(|(_, y)| y).sum::<f64>() / n;

        let numerator: f64 = self
            .samples
            .iter()
            .map(|(x, y)| (x - x_mean) * (y - y_mean))
            .sum();
        let denominator: f64 = self
            .samples
            .iter()
            .map(|(x, _)| (x - x_mean) * (x - x_mean))
            .sum();
        if denominator == 0.0 {
            return Err(ModelError::Degenerate);
        }

        let slope = numerator / denominator;
        let coefficients = Coefficients {
            slope,
            intercept: y_mean - slope * x_mean,
        };
        self.coefficients = Some(coefficients);
        Ok(coefficients)
    }

    pub fn coefficients(&self) -> Option<Coefficients> {
        self.coefficients
    }

    /// Evaluate the fitted line. `None` before a fit.
    pub fn predict(&self, x: f64) -> Option<f64> {
        let c = self.coefficients?;
        Some(c.slope * x + c.intercept)
    }

    /// Decode a raw memory reading into the encoded integer.
    ///
    /// Rounds to nearest with ties away from zero; the convention is fixed
    /// for the lifetime of an extraction because every run and resume decodes
    /// through this same path.
    pub fn decode(&self, x: f64) -> Result<i64, ModelError> {
        let value = self.predict(x).ok_or(ModelError::NotFitted)?;
        Ok(value.round() as i64)
    }
}
