use crate::config::PolicyConfig;
use rand::Rng;

/// Probabilistic load shedding for unauthenticated callers.
///
/// Below `low` healthy credentials every request is rejected, at or above
/// `high` every request is accepted, and in between the rejection probability
/// follows a configured linear curve clipped to [0, 1].
#[derive(Debug, Clone, Copy)]
pub struct AdmissionPolicy {
    low: i64,
    high: i64,
    slope: f64,
    intercept: f64,
}

impl AdmissionPolicy {
    pub fn from_config(cfg: &PolicyConfig) -> Self {
        Self {
            low: cfg.low_threshold,
            high: cfg.high_threshold,
            slope: cfg.slope,
            intercept: cfg.intercept,
        }
    }

    /// Rejection probability for a given healthy-credential count.
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_probability(&self, healthy: i64) -> f64 {
        if healthy < self.low {
            return 1.0;
        }
        if healthy >= self.high {
            return 0.0;
        }
        self.slope.mul_add(healthy as f64, self.intercept).clamp(0.0, 1.0)
    }

    /// Draw one admission decision. `true` means the request may proceed.
    pub fn admit(&self, healthy: i64) -> bool {
        let p = self.rejection_probability(healthy);
        if p <= 0.0 {
            return true;
        }
        if p >= 1.0 {
            return false;
        }
        rand::rng().random::<f64>() >= p
    }
}
