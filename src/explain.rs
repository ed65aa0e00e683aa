//! Additive feature attribution for the forest (path-dependent TreeSHAP).
//!
//! For one scaled row, per-feature contributions plus the forest's expected
//! value sum to the positive-class probability the forest outputs. Each
//! tree is explained exactly and the forest attribution is the tree mean.

use crate::forest::{DecisionTree, Node, RandomForest};
use crate::models::Driver;

#[derive(Debug, Clone, Copy)]
struct PathElement {
    feature: Option<usize>,
    zero_fraction: f64,
    one_fraction: f64,
    weight: f64,
}

/// Attribution of one row; `output == baseline + contributions.sum()`.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribution {
    pub baseline: f64,
    pub output: f64,
    pub contributions: Vec<f64>,
}

impl Attribution {
    /// Up to `n` features by absolute contribution, largest first; equal
    /// magnitudes keep feature order.
    pub fn top_drivers(&self, feature_names: &[String], n: usize) -> Vec<Driver> {
        let mut order: Vec<usize> = (0..self.contributions.len()).collect();
        order.sort_by(|&a, &b| {
            self.contributions[b]
                .abs()
                .total_cmp(&self.contributions[a].abs())
        });
        order
            .into_iter()
            .take(n)
            .map(|idx| Driver {
                feature: feature_names
                    .get(idx)
                    .cloned()
                    .unwrap_or_else(|| format!("feature_{idx}")),
                value: self.contributions[idx],
            })
            .collect()
    }
}

pub struct TreeExplainer<'a> {
    forest: &'a RandomForest,
}

impl<'a> TreeExplainer<'a> {
    pub fn new(forest: &'a RandomForest) -> Self {
        Self { forest }
    }

    pub fn explain(&self, row: &[f64]) -> Attribution {
        let mut contributions = vec![0.0; self.forest.n_features];
        for tree in &self.forest.trees {
            tree_shap(tree, row, &mut contributions);
        }
        let n_trees = self.forest.trees.len() as f64;
        for phi in &mut contributions {
            *phi /= n_trees;
        }
        Attribution {
            baseline: self.forest.expected_value(),
            output: self.forest.predict_proba(row),
            contributions,
        }
    }

    /// Mean absolute contribution per feature over `rows`.
    pub fn global_importance(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        let mut totals = vec![0.0; self.forest.n_features];
        for row in rows {
            for (total, phi) in totals.iter_mut().zip(self.explain(row).contributions) {
                *total += phi.abs();
            }
        }
        if !rows.is_empty() {
            let n = rows.len() as f64;
            totals.iter_mut().for_each(|total| *total /= n);
        }
        totals
    }
}

/// Adds one tree's attributions for `row` into `phi`.
fn tree_shap(tree: &DecisionTree, row: &[f64], phi: &mut [f64]) {
    if tree.nodes.is_empty() {
        return;
    }
    recurse(tree, row, phi, 0, Vec::new(), 1.0, 1.0, None);
}

#[allow(clippy::too_many_arguments)]
fn recurse(
    tree: &DecisionTree,
    row: &[f64],
    phi: &mut [f64],
    node: usize,
    path: Vec<PathElement>,
    zero_fraction: f64,
    one_fraction: f64,
    feature: Option<usize>,
) {
    let path = extend(path, zero_fraction, one_fraction, feature);
    match &tree.nodes[node] {
        Node::Leaf { value, .. } => {
            for i in 1..path.len() {
                let weight: f64 = unwind(&path, i).iter().map(|e| e.weight).sum();
                let element = path[i];
                if let Some(f) = element.feature {
                    phi[f] += weight * (element.one_fraction - element.zero_fraction) * value;
                }
            }
        }
        Node::Split {
            feature: split,
            threshold,
            left,
            right,
            cover,
            ..
        } => {
            let (hot, cold) = if row[*split] <= *threshold {
                (*left, *right)
            } else {
                (*right, *left)
            };
            let mut path = path;
            let mut incoming_zero = 1.0;
            let mut incoming_one = 1.0;
            if let Some(k) = path
                .iter()
                .skip(1)
                .position(|e| e.feature == Some(*split))
                .map(|k| k + 1)
            {
                incoming_zero = path[k].zero_fraction;
                incoming_one = path[k].one_fraction;
                path = unwind(&path, k);
            }
            let share = |child: usize| {
                if *cover > 0.0 {
                    tree.nodes[child].cover() / cover
                } else {
                    0.0
                }
            };
            recurse(
                tree,
                row,
                phi,
                hot,
                path.clone(),
                incoming_zero * share(hot),
                incoming_one,
                Some(*split),
            );
            recurse(
                tree,
                row,
                phi,
                cold,
                path,
                incoming_zero * share(cold),
                0.0,
                Some(*split),
            );
        }
    }
}

fn extend(
    mut path: Vec<PathElement>,
    zero_fraction: f64,
    one_fraction: f64,
    feature: Option<usize>,
) -> Vec<PathElement> {
    let depth = path.len();
    path.push(PathElement {
        feature,
        zero_fraction,
        one_fraction,
        weight: if depth == 0 { 1.0 } else { 0.0 },
    });
    let scale = (depth + 1) as f64;
    for i in (0..depth).rev() {
        path[i + 1].weight += one_fraction * path[i].weight * (i + 1) as f64 / scale;
        path[i].weight = zero_fraction * path[i].weight * (depth - i) as f64 / scale;
    }
    path
}

/// Removes element `index` from the path, undoing its effect on the weights.
fn unwind(path: &[PathElement], index: usize) -> Vec<PathElement> {
    let len = path.len();
    let one_fraction = path[index].one_fraction;
    let zero_fraction = path[index].zero_fraction;
    let mut next = path[len - 1].weight;
    let mut out: Vec<PathElement> = path[..len - 1].to_vec();
    let scale = len as f64;

    for j in (0..len - 1).rev() {
        if one_fraction != 0.0 {
            let tmp = out[j].weight;
            out[j].weight = next * scale / ((j + 1) as f64 * one_fraction);
            next = tmp - out[j].weight * zero_fraction * (len - 1 - j) as f64 / scale;
        } else {
            out[j].weight = out[j].weight * scale / (zero_fraction * (len - 1 - j) as f64);
        }
    }
    for j in index..len - 1 {
        out[j].feature = path[j + 1].feature;
        out[j].zero_fraction = path[j + 1].zero_fraction;
        out[j].one_fraction = path[j + 1].one_fraction;
    }
    out
}
