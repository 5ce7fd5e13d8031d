// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transaction priority and the sampling decision derived from it.

use rand::Rng;

const MAX_CREATED_PRIORITY: f32 = 0.999_999;
/// Created priority plus the boost given to sampled transactions upstream.
pub const MAX_PRIORITY: f32 = 2.0;

/// Uniform in `[0, 1)`, rounded to six decimal places.
#[must_use]
pub fn create_priority() -> f32 {
    round_priority(rand::thread_rng().gen::<f32>()).min(MAX_CREATED_PRIORITY)
}

#[must_use]
pub fn round_priority(priority: f32) -> f32 {
    #[allow(clippy::cast_possible_truncation)]
    let rounded = ((f64::from(priority) * 1_000_000.0).round() / 1_000_000.0) as f32;
    rounded
}

/// An inbound priority, or `None` when it is not a number in
/// `[0, MAX_PRIORITY]`.
#[must_use]
pub fn inbound_priority(priority: f32) -> Option<f32> {
    (priority.is_finite() && (0.0..=MAX_PRIORITY).contains(&priority)).then_some(priority)
}

/// Renders a priority the way it travels in `tracestate`.
#[must_use]
pub(crate) fn format_priority(priority: f32) -> String {
    let formatted = format!("{priority:.6}");
    let trimmed = formatted.trim_end_matches('0');
    match trimmed.strip_suffix('.') {
        Some(integral) => integral.to_string(),
        None => trimmed.to_string(),
    }
}

/// Decides whether a transaction is sampled.
///
/// Called at most once per transaction, the first time the decision is read.
pub trait Sampler: Send + Sync {
    fn compute_sampled(&self, priority: f32) -> bool;
}

/// Samples the highest-priority `ratio` of transactions.
#[derive(Debug, Clone, Copy)]
pub struct PrioritySampler {
    ratio: f32,
}

impl PrioritySampler {
    #[must_use]
    pub fn new(ratio: f32) -> Self {
        PrioritySampler {
            ratio: ratio.clamp(0.0, 1.0),
        }
    }
}

impl Sampler for PrioritySampler {
    fn compute_sampled(&self, priority: f32) -> bool {
        if self.ratio <= 0.0 {
            return false;
        }
        priority >= 1.0 - self.ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_range_and_precision() {
        for _ in 0..1000 {
            let priority = create_priority();
            assert!((0.0..1.0).contains(&priority));
            let scaled = f64::from(priority) * 1_000_000.0;
            assert!((scaled - scaled.round()).abs() < 0.5);
        }
    }

    #[test]
    fn test_inbound_priority_bounds() {
        assert_eq!(inbound_priority(0.0), Some(0.0));
        assert_eq!(inbound_priority(1.5), Some(1.5));
        assert_eq!(inbound_priority(MAX_PRIORITY), Some(MAX_PRIORITY));
        assert_eq!(inbound_priority(f32::NAN), None);
        assert_eq!(inbound_priority(f32::INFINITY), None);
        assert_eq!(inbound_priority(-0.1), None);
        assert_eq!(inbound_priority(1e30), None);
    }

    #[test]
    fn test_format_priority() {
        assert_eq!(format_priority(0.5), "0.5");
        assert_eq!(format_priority(1.0), "1");
        assert_eq!(format_priority(0.123_456), "0.123456");
    }

    #[test]
    fn test_priority_sampler_is_deterministic() {
        let sampler = PrioritySampler::new(0.25);
        assert!(sampler.compute_sampled(0.9));
        assert!(sampler.compute_sampled(0.75));
        assert!(!sampler.compute_sampled(0.5));
        assert_eq!(sampler.compute_sampled(0.8), sampler.compute_sampled(0.8));
    }

    #[test]
    fn test_priority_sampler_bounds() {
        assert!(!PrioritySampler::new(0.0).compute_sampled(0.999_999));
        assert!(PrioritySampler::new(1.0).compute_sampled(0.0));
        assert!(PrioritySampler::new(7.0).compute_sampled(0.0));
    }
}
