//! Averager configuration dictionary (§6)
//!
//! Plain data, deserializable the way the rest of the crate's host-side
//! surface is: via `serde`, so callers can load a config from JSON
//! alongside their program.

use serde::Deserialize;

use crate::error::{Result, TProcError};

/// Per-ADC-channel readout settings: frequency (MHz) and window length
/// (samples).
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct ReadoutConfig {
    /// Readout (downconversion) frequency, in MHz.
    pub adc_freq: f64,
    /// Readout window length, in samples.
    pub adc_length: usize,
}

/// Recognized averager configuration keys (§6).
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AveragerConfig {
    /// Inner-loop repetitions. Must be >= 1.
    pub reps: usize,
    /// Outer-loop experiment points (two-axis variants). Must be >= 1.
    #[serde(default = "one")]
    pub expts: usize,
    /// Experiment-point origin.
    #[serde(default)]
    pub start: f64,
    /// Experiment-point stride.
    #[serde(default)]
    pub step: f64,
    /// Decimated-variant outer-loop count. Must be >= 1.
    #[serde(default = "one")]
    pub soft_avgs: usize,
    /// Per-ADC-channel readout settings.
    pub readouts: Vec<ReadoutConfig>,
}

fn one() -> usize {
    1
}

impl AveragerConfig {
    /// Validates the configuration, failing with `ConfigMissing` if a
    /// required key is absent or out of its documented range.
    pub fn validate(&self) -> Result<()> {
        if self.reps < 1 {
            return Err(TProcError::ConfigMissing { key: "reps".to_string() });
        }
        if self.expts < 1 {
            return Err(TProcError::ConfigMissing { key: "expts".to_string() });
        }
        if self.soft_avgs < 1 {
            return Err(TProcError::ConfigMissing { key: "soft_avgs".to_string() });
        }
        if self.readouts.is_empty() {
            return Err(TProcError::ConfigMissing { key: "adc_freqs".to_string() });
        }
        Ok(())
    }

    /// Total accumulated-sample count for the two-axis (reps x expts)
    /// acquisition, given how many readouts occur per experiment point.
    pub fn total_count(&self, readouts_per_expt: usize) -> usize {
        self.reps * self.expts * readouts_per_expt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AveragerConfig {
        AveragerConfig {
            reps: 1000,
            expts: 1,
            start: 0.0,
            step: 1.0,
            soft_avgs: 1,
            readouts: vec![ReadoutConfig { adc_freq: 100.0, adc_length: 400 }],
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn zero_reps_is_rejected() {
        let mut cfg = sample();
        cfg.reps = 0;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, TProcError::ConfigMissing { key } if key == "reps"));
    }

    #[test]
    fn missing_readouts_is_rejected() {
        let mut cfg = sample();
        cfg.readouts.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn total_count_multiplies_reps_expts_and_readouts_per_expt() {
        let mut cfg = sample();
        cfg.reps = 10;
        cfg.expts = 5;
        assert_eq!(cfg.total_count(2), 100);
    }

    #[test]
    fn deserializes_from_json() {
        let json = r#"{"reps": 500, "readouts": [{"adc_freq": 50.0, "adc_length": 200}]}"#;
        let cfg: AveragerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.reps, 500);
        assert_eq!(cfg.expts, 1);
        assert_eq!(cfg.readouts.len(), 1);
    }
}
