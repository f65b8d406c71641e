use std::f64::consts::PI;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::sequence::fold_digest;
use crate::TrendError;

/// Largest digit count that still yields an epsilon above f64 resolution for
/// values around 1.0.
pub const MAX_TOLERANCE_DIGITS: u32 = 15;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToleranceMode {
    /// `10^-digits` in the measure's own unit.
    Absolute,
    /// `10^-digits` scaled by the observed span of the measure.
    Relative,
}

impl Default for ToleranceMode {
    fn default() -> Self {
        ToleranceMode::Absolute
    }
}

/// Precision used to decide whether a step is flat.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tolerance {
    pub digits: u32,
    pub mode: ToleranceMode,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            digits: 3,
            mode: ToleranceMode::Absolute,
        }
    }
}

impl Tolerance {
    pub fn absolute(digits: u32) -> Self {
        Self {
            digits,
            mode: ToleranceMode::Absolute,
        }
    }

    pub fn relative(digits: u32) -> Self {
        Self {
            digits,
            mode: ToleranceMode::Relative,
        }
    }

    /// Epsilon for a measure whose finite values cover `span`.
    pub fn epsilon(&self, span: f64) -> f64 {
        let base = 10f64.powi(-(self.digits.min(MAX_TOLERANCE_DIGITS) as i32));
        match self.mode {
            ToleranceMode::Absolute => base,
            ToleranceMode::Relative if span.is_finite() && span > 0.0 => base * span,
            ToleranceMode::Relative => base,
        }
    }
}

/// How the value axis is cut into trend boundary buckets.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Bucketing {
    /// Observed span divided into this many buckets, anchored at the minimum.
    Count(u32),
    /// Fixed bucket width, anchored at zero.
    Step(f64),
}

impl Default for Bucketing {
    fn default() -> Self {
        Bucketing::Count(10)
    }
}

impl Bucketing {
    pub fn validate(&self) -> Result<(), TrendError> {
        match *self {
            Bucketing::Count(0) => Err(TrendError::invalid_input("bucket count must be >= 1")),
            Bucketing::Step(step) if !step.is_finite() || step <= 0.0 => Err(
                TrendError::invalid_input(format!("bucket step must be finite and > 0, got {step}")),
            ),
            _ => Ok(()),
        }
    }
}

/// Shape of the moving-average window.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Triangular,
    Hanning,
    Gaussian,
}

impl WindowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Triangular => "triangular",
            WindowKind::Hanning => "hanning",
            WindowKind::Gaussian => "gaussian",
        }
    }
}

impl FromStr for WindowKind {
    type Err = TrendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "triangular" => Ok(WindowKind::Triangular),
            "hanning" | "hann" => Ok(WindowKind::Hanning),
            "gaussian" => Ok(WindowKind::Gaussian),
            other => Err(TrendError::invalid_input(format!("unknown window kind {other:?}"))),
        }
    }
}

/// Weighted moving average applied to a measure before segmentation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Smoothing {
    pub window: WindowKind,
    /// Odd number of samples, at least [`Smoothing::MIN_SIZE`].
    pub size: usize,
}

impl Smoothing {
    pub const MIN_SIZE: usize = 3;

    pub fn new(window: WindowKind, size: usize) -> Self {
        Self { window, size }
    }

    pub fn validate(&self) -> Result<(), TrendError> {
        if self.size < Self::MIN_SIZE || self.size % 2 == 0 {
            return Err(TrendError::invalid_input(format!(
                "smoothing window must be odd and >= {}, got {}",
                Self::MIN_SIZE,
                self.size
            )));
        }
        Ok(())
    }

    /// Window weights normalized to sum to one, centre at `size / 2`.
    pub fn weights(&self) -> Vec<f64> {
        let last = (self.size - 1) as f64;
        let center = last / 2.0;
        let mut weights: Vec<f64> = (0..self.size)
            .map(|n| {
                let n = n as f64;
                match self.window {
                    WindowKind::Triangular => 1.0 - (n - center).abs() / center,
                    WindowKind::Hanning => 0.5 - 0.5 * (2.0 * PI * n / last).cos(),
                    WindowKind::Gaussian => {
                        let sigma = 0.4 + 0.1 * (self.size as f64 / 25.0);
                        let x = (n - center) / (sigma * center);
                        (-0.5 * x * x).exp()
                    }
                }
            })
            .collect();
        let sum: f64 = weights.iter().sum();
        for w in &mut weights {
            *w /= sum;
        }
        weights
    }
}

/// Segment detector settings.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DetectorConfig {
    pub tolerance: Tolerance,
    /// Rising/falling segments with a smaller start-to-end amplitude are
    /// reclassified as flat.
    pub min_amplitude: Option<f64>,
    /// Readings whose accuracy figure is above this are ignored, as if they
    /// were missing. Readings without an accuracy figure are always kept.
    pub max_accuracy: Option<f64>,
    pub smoothing: Option<Smoothing>,
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), TrendError> {
        if self.tolerance.digits > MAX_TOLERANCE_DIGITS {
            return Err(TrendError::invalid_input(format!(
                "tolerance digits must be <= {MAX_TOLERANCE_DIGITS}, got {}",
                self.tolerance.digits
            )));
        }
        if let Some(amp) = self.min_amplitude {
            if !amp.is_finite() || amp < 0.0 {
                return Err(TrendError::invalid_input(format!(
                    "min amplitude must be finite and >= 0, got {amp}"
                )));
            }
        }
        if let Some(max) = self.max_accuracy {
            if max.is_nan() || max < 0.0 {
                return Err(TrendError::invalid_input(format!(
                    "max accuracy must be >= 0, got {max}"
                )));
            }
        }
        if let Some(smoothing) = &self.smoothing {
            smoothing.validate()?;
        }
        Ok(())
    }
}

/// Caller-supplied settings for one derivation.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrendConfig {
    pub buckets: Bucketing,
    pub tolerance: Tolerance,
    pub min_amplitude: Option<f64>,
    pub max_accuracy: Option<f64>,
    pub smoothing: Option<Smoothing>,
}

impl TrendConfig {
    pub fn detector(&self) -> DetectorConfig {
        DetectorConfig {
            tolerance: self.tolerance,
            min_amplitude: self.min_amplitude,
            max_accuracy: self.max_accuracy,
            smoothing: self.smoothing,
        }
    }

    pub fn validate(&self) -> Result<(), TrendError> {
        self.buckets.validate()?;
        self.detector().validate()
    }

    /// SHA-256 of the JSON form, folded to 64 bits. Equal configs hash
    /// equally; any changed field changes the hash.
    pub fn fingerprint(&self) -> Result<u64, TrendError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| TrendError::invalid_input(format!("config does not serialize: {e}")))?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(fold_digest(hasher))
    }
}
