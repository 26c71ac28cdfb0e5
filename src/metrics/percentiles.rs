//! Ordered-set percentile functions over already sorted samples.

/// Continuous percentile with linear interpolation between the two closest
/// ranks. `None` for an empty slice.
pub fn percentile_cont(sorted: &[f64], p: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let rank = p.clamp(0.0, 1.0) * last as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;

    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

/// Discrete percentile: the first sample whose cumulative share reaches
/// `p`. Always one of the inputs. `None` for an empty slice.
pub fn percentile_disc(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let idx = ((p.clamp(0.0, 1.0) * n as f64).ceil() as usize).saturating_sub(1);
    Some(sorted[idx.min(n - 1)])
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
