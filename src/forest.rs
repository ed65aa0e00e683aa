//! Random forest of CART trees for the binary turnover label.
//!
//! Every node keeps its weighted sample mass (`cover`) and positive-class
//! fraction (`value`), so a tree's prediction is a leaf value and its
//! expected output is the root value. The attribution engine relies on both.

use rand::{seq::index, Rng, SeedableRng};
use rand_pcg::Pcg64;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TurnoverError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaxFeatures {
    Sqrt,
    Log2,
    All,
}

impl MaxFeatures {
    /// Number of candidate features examined at each split.
    pub fn count(self, n_features: usize) -> usize {
        let n = n_features as f64;
        let k = match self {
            MaxFeatures::Sqrt => n.sqrt().floor() as usize,
            MaxFeatures::Log2 => n.log2().floor() as usize,
            MaxFeatures::All => n_features,
        };
        k.clamp(1, n_features.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub max_features: MaxFeatures,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: MaxFeatures::Sqrt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
        cover: f64,
        value: f64,
    },
    Leaf {
        cover: f64,
        value: f64,
    },
}

impl Node {
    pub fn cover(&self) -> f64 {
        match self {
            Node::Split { cover, .. } | Node::Leaf { cover, .. } => *cover,
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            Node::Split { value, .. } | Node::Leaf { value, .. } => *value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<Node>,
}

impl DecisionTree {
    /// Positive-class probability of the leaf `row` falls into.
    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value, .. } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => idx = if row[*feature] <= *threshold { *left } else { *right },
            }
        }
    }

    pub fn expected_value(&self) -> f64 {
        self.nodes.first().map_or(0.0, Node::value)
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match &nodes[idx] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        if self.nodes.is_empty() {
            0
        } else {
            walk(&self.nodes, 0)
        }
    }

    /// Children must point forward, which rules out cycles in a loaded model.
    fn validate(&self, n_features: usize) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(TurnoverError::configuration("tree has no nodes"));
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            if let Node::Split {
                feature,
                left,
                right,
                ..
            } = node
            {
                let forward = |child: usize| child > idx && child < self.nodes.len();
                if *feature >= n_features || !forward(*left) || !forward(*right) {
                    return Err(TurnoverError::configuration(format!(
                        "malformed split at node {idx}"
                    )));
                }
            }
        }
        Ok(())
    }
}

struct Split {
    feature: usize,
    threshold: f64,
    impurity: f64,
}

fn weighted_gini(weight: f64, positive: f64) -> f64 {
    if weight <= 0.0 {
        return 0.0;
    }
    let p = (positive / weight).clamp(0.0, 1.0);
    weight * 2.0 * p * (1.0 - p)
}

struct TreeBuilder<'a> {
    x: &'a [Vec<f64>],
    y: &'a [u8],
    class_weight: [f64; 2],
    params: &'a ForestParams,
    n_candidates: usize,
    rng: Pcg64,
    nodes: Vec<Node>,
}

impl TreeBuilder<'_> {
    fn weigh(&self, samples: &[usize]) -> (f64, f64) {
        samples.iter().fold((0.0, 0.0), |(total, positive), &s| {
            let w = self.class_weight[usize::from(self.y[s])];
            (total + w, if self.y[s] == 1 { positive + w } else { positive })
        })
    }

    fn grow(&mut self, samples: &[usize], depth: usize) -> usize {
        let (cover, positive) = self.weigh(samples);
        let value = if cover > 0.0 { positive / cover } else { 0.0 };
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { cover, value });

        let depth_allowed = self.params.max_depth.map_or(true, |max| depth < max);
        let pure = positive <= 0.0 || positive >= cover;
        let min_leaf = self.params.min_samples_leaf.max(1);
        if !depth_allowed
            || pure
            || samples.len() < self.params.min_samples_split.max(2)
            || samples.len() < 2 * min_leaf
        {
            return id;
        }
        let Some(split) = self.best_split(samples, cover, positive) else {
            return id;
        };

        let x = self.x;
        let (left, right): (Vec<usize>, Vec<usize>) = samples
            .iter()
            .partition(|&&s| x[s][split.feature] <= split.threshold);
        let left = self.grow(&left, depth + 1);
        let right = self.grow(&right, depth + 1);
        self.nodes[id] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
            cover,
            value,
        };
        id
    }

    fn best_split(&mut self, samples: &[usize], total: f64, total_positive: f64) -> Option<Split> {
        let n_features = self.x[0].len();
        let candidates = index::sample(&mut self.rng, n_features, self.n_candidates);
        let min_leaf = self.params.min_samples_leaf.max(1);
        let x = self.x;
        let mut order = samples.to_vec();
        let mut best: Option<Split> = None;

        for feature in candidates.iter() {
            order.sort_by(|&a, &b| x[a][feature].total_cmp(&x[b][feature]));
            let (mut left_w, mut left_pos) = (0.0, 0.0);
            for i in 0..order.len() - 1 {
                let s = order[i];
                let w = self.class_weight[usize::from(self.y[s])];
                left_w += w;
                if self.y[s] == 1 {
                    left_pos += w;
                }
                let n_left = i + 1;
                if n_left < min_leaf || order.len() - n_left < min_leaf {
                    continue;
                }
                let here = x[s][feature];
                let next = x[order[i + 1]][feature];
                if here >= next {
                    continue;
                }
                let impurity = weighted_gini(left_w, left_pos)
                    + weighted_gini(total - left_w, total_positive - left_pos);
                if best.as_ref().map_or(true, |b| impurity < b.impurity) {
                    let mut threshold = here + (next - here) / 2.0;
                    if threshold >= next {
                        threshold = here;
                    }
                    best = Some(Split {
                        feature,
                        threshold,
                        impurity,
                    });
                }
            }
        }
        best
    }
}

/// Inverse-frequency weights, `n / (2 * n_class)`.
pub fn balanced_class_weight(y: &[u8]) -> [f64; 2] {
    let n = y.len() as f64;
    let positives = y.iter().filter(|&&label| label == 1).count() as f64;
    let negatives = n - positives;
    let weight = |count: f64| if count > 0.0 { n / (2.0 * count) } else { 1.0 };
    [weight(negatives), weight(positives)]
}

fn tree_seed(seed: u64, tree: usize) -> u64 {
    seed ^ (tree as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    pub params: ForestParams,
    pub n_features: usize,
    pub trees: Vec<DecisionTree>,
}

impl RandomForest {
    /// Fits bootstrapped trees in parallel with balanced class weights.
    pub fn fit(x: &[Vec<f64>], y: &[u8], params: ForestParams, seed: u64) -> Result<Self> {
        let n_features = x
            .first()
            .map(Vec::len)
            .ok_or_else(|| TurnoverError::infeasible("cannot fit a forest on zero samples"))?;
        if x.len() != y.len() {
            return Err(TurnoverError::infeasible("feature and label counts differ"));
        }
        if n_features == 0 || x.iter().any(|row| row.len() != n_features) {
            return Err(TurnoverError::infeasible("feature rows have inconsistent width"));
        }
        if y.iter().any(|&label| label > 1) {
            return Err(TurnoverError::infeasible("labels must be 0 or 1"));
        }
        if params.n_estimators == 0 {
            return Err(TurnoverError::infeasible("forest needs at least one tree"));
        }

        let class_weight = balanced_class_weight(y);
        let n_candidates = params.max_features.count(n_features);
        let n = x.len();
        let trees = (0..params.n_estimators)
            .into_par_iter()
            .map(|tree| {
                let mut rng = Pcg64::seed_from_u64(tree_seed(seed, tree));
                let bootstrap: Vec<usize> = (0..n).map(|_| rng.random_range(0..n)).collect();
                let mut builder = TreeBuilder {
                    x,
                    y,
                    class_weight,
                    params: &params,
                    n_candidates,
                    rng,
                    nodes: Vec::new(),
                };
                builder.grow(&bootstrap, 0);
                DecisionTree {
                    nodes: builder.nodes,
                }
            })
            .collect::<Vec<DecisionTree>>();
        debug!(
            trees = trees.len(),
            deepest = trees.iter().map(DecisionTree::depth).max().unwrap_or(0),
            rows = n,
            "forest fitted"
        );

        Ok(Self {
            params,
            n_features,
            trees,
        })
    }

    pub fn predict_proba(&self, row: &[f64]) -> f64 {
        self.trees.iter().map(|tree| tree.predict(row)).sum::<f64>() / self.trees.len() as f64
    }

    pub fn predict(&self, row: &[f64]) -> u8 {
        u8::from(self.predict_proba(row) > 0.5)
    }

    /// Mean output over the training distribution.
    pub fn expected_value(&self) -> f64 {
        self.trees.iter().map(DecisionTree::expected_value).sum::<f64>() / self.trees.len() as f64
    }

    pub fn validate(&self) -> Result<()> {
        if self.trees.is_empty() {
            return Err(TurnoverError::configuration("forest has no trees"));
        }
        self.trees
            .iter()
            .try_for_each(|tree| tree.validate(self.n_features))
    }
}
