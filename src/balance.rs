//! Minority oversampling by nearest-neighbour interpolation (SMOTE).

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use tracing::debug;

use crate::error::{Result, TurnoverError};

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Returns the input followed by synthetic minority rows until both classes
/// have the same count.
pub fn oversample(
    x: &[Vec<f64>],
    y: &[u8],
    neighbours: usize,
    seed: u64,
) -> Result<(Vec<Vec<f64>>, Vec<u8>)> {
    let positives = y.iter().filter(|&&label| label == 1).count();
    let negatives = y.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(TurnoverError::infeasible(
            "class balancing needs both classes in the training partition",
        ));
    }
    let (minority_label, deficit) = if positives < negatives {
        (1u8, negatives - positives)
    } else {
        (0u8, positives - negatives)
    };

    let mut out_x = x.to_vec();
    let mut out_y = y.to_vec();
    if deficit == 0 {
        return Ok((out_x, out_y));
    }

    let minority: Vec<&[f64]> = x
        .iter()
        .zip(y)
        .filter(|(_, &label)| label == minority_label)
        .map(|(row, _)| row.as_slice())
        .collect();
    if minority.len() < 2 {
        return Err(TurnoverError::infeasible(format!(
            "class balancing needs at least 2 samples of class {minority_label}, found {}",
            minority.len()
        )));
    }
    let k = neighbours.clamp(1, minority.len() - 1);

    // ties on distance resolve to the lower index
    let nearest: Vec<Vec<usize>> = minority
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut others: Vec<(f64, usize)> = minority
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(j, other)| (squared_distance(row, other), j))
                .collect();
            others.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            others.into_iter().take(k).map(|(_, j)| j).collect()
        })
        .collect();

    let mut rng = Pcg64::seed_from_u64(seed);
    for _ in 0..deficit {
        let base = rng.random_range(0..minority.len());
        let neighbour = nearest[base][rng.random_range(0..k)];
        let gap: f64 = rng.random();
        let row = minority[base]
            .iter()
            .zip(minority[neighbour])
            .map(|(a, b)| a + gap * (b - a))
            .collect();
        out_x.push(row);
        out_y.push(minority_label);
    }
    debug!(
        synthetic = deficit,
        minority = minority.len(),
        k,
        "oversampled minority class"
    );
    Ok((out_x, out_y))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imbalanced() -> (Vec<Vec<f64>>, Vec<u8>) {
        let mut x: Vec<Vec<f64>> = (0..12).map(|i| vec![f64::from(i), 0.0]).collect();
        let mut y = vec![0u8; 12];
        for row in [[20.0, 5.0], [21.0, 6.0], [22.0, 5.5]] {
            x.push(row.to_vec());
            y.push(1);
        }
        (x, y)
    }

    #[test]
    fn classes_end_up_balanced() {
        let (x, y) = imbalanced();
        let (bx, by) = oversample(&x, &y, 5, 42).unwrap();
        assert_eq!(bx.len(), 24);
        assert_eq!(by.iter().filter(|&&l| l == 1).count(), 12);
        assert_eq!(&bx[..15], &x[..]);
    }

    #[test]
    fn synthetic_rows_lie_between_minority_samples() {
        let (x, y) = imbalanced();
        let (bx, _) = oversample(&x, &y, 5, 1).unwrap();
        for row in &bx[15..] {
            assert!((20.0..=22.0).contains(&row[0]));
            assert!((5.0..=6.0).contains(&row[1]));
        }
    }

    #[test]
    fn same_seed_same_samples() {
        let (x, y) = imbalanced();
        assert_eq!(oversample(&x, &y, 5, 9).unwrap(), oversample(&x, &y, 5, 9).unwrap());
    }

    #[test]
    fn single_class_is_infeasible() {
        let x = vec![vec![1.0], vec![2.0]];
        assert!(matches!(
            oversample(&x, &[0, 0], 5, 0),
            Err(TurnoverError::TrainingInfeasible(_))
        ));
    }

    #[test]
    fn lone_minority_sample_is_infeasible() {
        let x = vec![vec![1.0], vec![2.0], vec![3.0]];
        assert!(oversample(&x, &[0, 0, 1], 5, 0).is_err());
    }
}
