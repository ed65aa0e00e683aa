use std::io;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_negative: usize,
    pub false_positive: usize,
    pub false_negative: usize,
    pub true_positive: usize,
}

impl ConfusionMatrix {
    pub fn from_predictions(y_true: &[u8], y_pred: &[u8]) -> Self {
        y_true
            .iter()
            .zip(y_pred)
            .fold(Self::default(), |mut m, (&truth, &pred)| {
                match (truth, pred) {
                    (0, 0) => m.true_negative += 1,
                    (0, _) => m.false_positive += 1,
                    (_, 0) => m.false_negative += 1,
                    _ => m.true_positive += 1,
                }
                m
            })
    }

    pub fn total(&self) -> usize {
        self.true_negative + self.false_positive + self.false_negative + self.true_positive
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_negative + self.true_positive, self.total())
    }

    /// Metrics with `label` treated as the positive class.
    pub fn class_metrics(&self, label: u8) -> ClassMetrics {
        let (tp, fp, fn_) = if label == 1 {
            (self.true_positive, self.false_positive, self.false_negative)
        } else {
            (self.true_negative, self.false_negative, self.false_positive)
        };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        ClassMetrics {
            label,
            precision,
            recall,
            f1,
            support: tp + fn_,
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub label: u8,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

pub fn f1_positive(y_true: &[u8], y_pred: &[u8]) -> f64 {
    ConfusionMatrix::from_predictions(y_true, y_pred)
        .class_metrics(1)
        .f1
}

/// Area under the ROC curve via the rank-sum statistic with averaged ties.
///
/// `None` when only one class is present.
pub fn roc_auc(y_true: &[u8], scores: &[f64]) -> Option<f64> {
    let positives = y_true.iter().filter(|&&l| l == 1).count();
    let negatives = y_true.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0; scores.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len() && scores[order[end + 1]] == scores[order[start]] {
            end += 1;
        }
        let average = (start + end) as f64 / 2.0 + 1.0;
        for &idx in &order[start..=end] {
            ranks[idx] = average;
        }
        start = end + 1;
    }
    let positive_rank_sum: f64 = y_true
        .iter()
        .zip(&ranks)
        .filter(|(&l, _)| l == 1)
        .map(|(_, r)| r)
        .sum();
    let p = positives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RocPoint {
    pub threshold: f64,
    pub false_positive_rate: f64,
    pub true_positive_rate: f64,
}

/// One point per distinct score, descending, starting at (0, 0).
pub fn roc_curve(y_true: &[u8], scores: &[f64]) -> Vec<RocPoint> {
    let positives = y_true.iter().filter(|&&l| l == 1).count();
    let negatives = y_true.len() - positives;
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut points = vec![RocPoint {
        threshold: f64::INFINITY,
        false_positive_rate: 0.0,
        true_positive_rate: 0.0,
    }];
    let (mut tp, mut fp) = (0, 0);
    for (pos, &idx) in order.iter().enumerate() {
        if y_true[idx] == 1 {
            tp += 1;
        } else {
            fp += 1;
        }
        let last_of_score = order
            .get(pos + 1)
            .map_or(true, |&next| scores[next] != scores[idx]);
        if last_of_score {
            points.push(RocPoint {
                threshold: scores[idx],
                false_positive_rate: ratio(fp, negatives),
                true_positive_rate: ratio(tp, positives),
            });
        }
    }
    points
}

pub fn write_roc_csv<W: io::Write>(writer: W, points: &[RocPoint]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    for point in points {
        writer.serialize(point)?;
    }
    writer.flush()?;
    Ok(())
}

/// Held-out evaluation of a fitted classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub classes: [ClassMetrics; 2],
    pub confusion: ConfusionMatrix,
    pub accuracy: f64,
    pub roc_auc: Option<f64>,
    pub roc_curve: Vec<RocPoint>,
}

impl Evaluation {
    pub fn from_scores(y_true: &[u8], scores: &[f64]) -> Self {
        let y_pred: Vec<u8> = scores.iter().map(|&s| u8::from(s > 0.5)).collect();
        let confusion = ConfusionMatrix::from_predictions(y_true, &y_pred);
        Self {
            classes: [confusion.class_metrics(0), confusion.class_metrics(1)],
            accuracy: confusion.accuracy(),
            confusion,
            roc_auc: roc_auc(y_true, scores),
            roc_curve: roc_curve(y_true, scores),
        }
    }
}
