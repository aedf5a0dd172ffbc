use super::constants::DEFAULT_CONFIDENCE_THRESHOLD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    Accept,
    Escalate,
}

/// Single threshold deciding whether an automated reply needs a human follow-up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceGate {
    threshold: f64,
}

impl ConfidenceGate {
    /// Thresholds outside `0.0..=1.0` (or NaN) fall back to the default.
    pub fn new(threshold: f64) -> Self {
        let threshold = if (0.0..=1.0).contains(&threshold) {
            threshold
        } else {
            DEFAULT_CONFIDENCE_THRESHOLD
        };
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn evaluate(&self, confidence: f64) -> GateVerdict {
        if confidence.is_nan() || confidence < self.threshold {
            GateVerdict::Escalate
        } else {
            GateVerdict::Accept
        }
    }
}

impl Default for ConfidenceGate {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIDENCE_THRESHOLD)
    }
}
