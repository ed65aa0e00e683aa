//! Small descriptive statistics over `f64` samples.

/// Arithmetic mean, or `None` for an empty sample.
#[must_use]
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n - 1 denominator).
///
/// Returns `None` with fewer than two values, matching the convention that a
/// single observation carries no spread information.
#[must_use]
pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = mean(values)?;
    let sum_sq = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>();
    Some((sum_sq / (values.len() - 1) as f64).sqrt())
}

/// Population standard deviation (n denominator).
#[must_use]
pub fn population_std(values: &[f64]) -> Option<f64> {
    let mean = mean(values)?;
    let sum_sq = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>();
    Some((sum_sq / values.len() as f64).sqrt())
}

#[must_use]
pub fn min_max(values: impl IntoIterator<Item = f64>) -> Option<(f64, f64)> {
    values.into_iter().fold(None, |acc, x| match acc {
        None => Some((x, x)),
        Some((min, max)) => Some((f64::min(min, x), f64::max(max, x))),
    })
}
