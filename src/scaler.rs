use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnoverError};
use crate::stats;

/// Per-column standardization to zero mean and unit variance.
///
/// Constant columns keep a scale of 1 so they map to 0 instead of NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(rows: &[Vec<f64>]) -> Result<Self> {
        let width = rows
            .first()
            .map(Vec::len)
            .ok_or_else(|| TurnoverError::infeasible("cannot fit scaler on an empty table"))?;
        let mut mean = Vec::with_capacity(width);
        let mut scale = Vec::with_capacity(width);
        for col in 0..width {
            let values: Vec<f64> = rows.iter().map(|row| row[col]).collect();
            mean.push(stats::mean(&values).unwrap_or(0.0));
            let std = stats::population_std(&values).unwrap_or(0.0);
            scale.push(if std > f64::EPSILON { std } else { 1.0 });
        }
        Ok(Self { mean, scale })
    }

    pub fn width(&self) -> usize {
        self.mean.len()
    }

    pub fn transform_row(&self, row: &[f64]) -> Result<Vec<f64>> {
        if row.len() != self.width() {
            return Err(TurnoverError::validation(format!(
                "expected {} features, got {}",
                self.width(),
                row.len()
            )));
        }
        Ok(row
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(x, (mean, scale))| (x - mean) / scale)
            .collect())
    }

    pub fn transform(&self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        rows.iter().map(|row| self.transform_row(row)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_are_standardized() {
        let rows = vec![vec![1.0, 10.0], vec![3.0, 10.0], vec![5.0, 10.0]];
        let scaler = StandardScaler::fit(&rows).unwrap();
        let scaled = scaler.transform(&rows).unwrap();
        let column: Vec<f64> = scaled.iter().map(|r| r[0]).collect();
        assert!(stats::mean(&column).unwrap().abs() < 1e-12);
        assert!((stats::population_std(&column).unwrap() - 1.0).abs() < 1e-12);
        assert!(scaled.iter().all(|r| r[1] == 0.0));
    }

    #[test]
    fn width_mismatch_is_a_validation_error() {
        let scaler = StandardScaler::fit(&[vec![1.0, 2.0]]).unwrap();
        assert!(matches!(
            scaler.transform_row(&[1.0]),
            Err(TurnoverError::Validation(_))
        ));
    }

    #[test]
    fn empty_table_cannot_be_fitted() {
        assert!(StandardScaler::fit(&[]).is_err());
    }
}
