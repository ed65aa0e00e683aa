//! Offline training: prepare -> split -> balance -> search -> evaluate.
//!
//! Every stage returns `TrainingInfeasible` instead of producing a partial
//! result; the caller publishes the bundle only after all stages succeed.

use std::collections::BTreeMap;
use std::path::Path;

use rand::{seq::SliceRandom, SeedableRng};
use rand_pcg::Pcg64;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifacts::ArtifactBundle;
use crate::balance;
use crate::error::{Result, TurnoverError};
use crate::explain::TreeExplainer;
use crate::features::FeatureTable;
use crate::forest::{ForestParams, MaxFeatures, RandomForest};
use crate::metrics::{self, Evaluation};
use crate::scaler::StandardScaler;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGrid {
    pub n_estimators: Vec<usize>,
    pub max_depth: Vec<Option<usize>>,
    pub min_samples_split: Vec<usize>,
    pub min_samples_leaf: Vec<usize>,
    pub max_features: Vec<MaxFeatures>,
}

impl Default for ParamGrid {
    fn default() -> Self {
        Self {
            n_estimators: vec![100, 200],
            max_depth: vec![Some(10), Some(20), None],
            min_samples_split: vec![2, 5],
            min_samples_leaf: vec![1, 2],
            max_features: vec![MaxFeatures::Sqrt, MaxFeatures::Log2],
        }
    }
}

impl ParamGrid {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let grid: ParamGrid = serde_json::from_slice(&std::fs::read(path)?)?;
        if grid.candidates().is_empty() {
            return Err(TurnoverError::validation(format!(
                "grid in {} has an empty axis",
                path.display()
            )));
        }
        Ok(grid)
    }

    /// Cartesian product in a fixed order.
    pub fn candidates(&self) -> Vec<ForestParams> {
        let mut out = Vec::new();
        for &n_estimators in &self.n_estimators {
            for &max_depth in &self.max_depth {
                for &min_samples_split in &self.min_samples_split {
                    for &min_samples_leaf in &self.min_samples_leaf {
                        for &max_features in &self.max_features {
                            out.push(ForestParams {
                                n_estimators,
                                max_depth,
                                min_samples_split,
                                min_samples_leaf,
                                max_features,
                            });
                        }
                    }
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub seed: u64,
    pub test_fraction: f64,
    pub folds: usize,
    pub neighbours: usize,
    pub grid: ParamGrid,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            test_fraction: 0.2,
            folds: 5,
            neighbours: 5,
            grid: ParamGrid::default(),
        }
    }
}

/// Imputed, scaled design matrix with its labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub feature_names: Vec<String>,
    pub x: Vec<Vec<f64>>,
    pub y: Vec<u8>,
    pub scaler: StandardScaler,
}

pub fn prepare(table: &FeatureTable) -> Result<Prepared> {
    if table.is_empty() {
        return Err(TurnoverError::infeasible("feature table is empty"));
    }
    if table.columns().is_empty() {
        return Err(TurnoverError::infeasible("feature table has no feature columns"));
    }
    let y = table
        .rows()
        .iter()
        .map(|row| {
            row.target.filter(|&t| t <= 1).ok_or_else(|| {
                TurnoverError::infeasible(format!("row {} has no 0/1 label", row.response_id))
            })
        })
        .collect::<Result<Vec<u8>>>()?;

    let column_means: Vec<f64> = (0..table.columns().len())
        .map(|col| {
            let present: Vec<f64> = table.rows().iter().filter_map(|row| row.values[col]).collect();
            crate::stats::mean(&present).unwrap_or_else(|| {
                debug!(column = %table.columns()[col], "column has no values, imputing 0");
                0.0
            })
        })
        .collect();
    let raw: Vec<Vec<f64>> = table
        .rows()
        .iter()
        .map(|row| {
            row.values
                .iter()
                .zip(&column_means)
                .map(|(value, mean)| value.unwrap_or(*mean))
                .collect()
        })
        .collect();

    let scaler = StandardScaler::fit(&raw)?;
    let x = scaler.transform(&raw)?;
    Ok(Prepared {
        feature_names: table.columns().to_vec(),
        x,
        y,
        scaler,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub train_x: Vec<Vec<f64>>,
    pub train_y: Vec<u8>,
    pub test_x: Vec<Vec<f64>>,
    pub test_y: Vec<u8>,
}

fn class_indices(y: &[u8]) -> [Vec<usize>; 2] {
    let mut classes = [Vec::new(), Vec::new()];
    for (idx, &label) in y.iter().enumerate() {
        classes[usize::from(label)].push(idx);
    }
    classes
}

/// Stratified hold-out split preserving the label ratio.
pub fn stratified_split(x: &[Vec<f64>], y: &[u8], test_fraction: f64, seed: u64) -> Result<Split> {
    if !(0.0..1.0).contains(&test_fraction) || test_fraction == 0.0 {
        return Err(TurnoverError::infeasible("test fraction must be in (0, 1)"));
    }
    let classes = class_indices(y);
    if let Some(label) = (0..2).find(|&label| classes[label].len() < 2) {
        return Err(TurnoverError::infeasible(format!(
            "stratified split needs at least 2 samples per class, class {label} has {}",
            classes[label].len()
        )));
    }

    let mut rng = Pcg64::seed_from_u64(seed);
    let mut test = Vec::new();
    let mut train = Vec::new();
    for mut members in classes {
        members.shuffle(&mut rng);
        let n_test = ((members.len() as f64 * test_fraction).round() as usize).clamp(1, members.len() - 1);
        test.extend_from_slice(&members[..n_test]);
        train.extend_from_slice(&members[n_test..]);
    }
    test.sort_unstable();
    train.sort_unstable();

    let pick = |idx: &[usize]| -> (Vec<Vec<f64>>, Vec<u8>) {
        (idx.iter().map(|&i| x[i].clone()).collect(), idx.iter().map(|&i| y[i]).collect())
    };
    let (train_x, train_y) = pick(&train);
    let (test_x, test_y) = pick(&test);
    Ok(Split {
        train_x,
        train_y,
        test_x,
        test_y,
    })
}

/// Fold assignment: each class is dealt round-robin across `k` folds.
pub fn stratified_folds(y: &[u8], k: usize) -> Result<Vec<Vec<usize>>> {
    let classes = class_indices(y);
    let smallest = classes.iter().map(Vec::len).min().unwrap_or(0);
    if k < 2 || smallest < k {
        return Err(TurnoverError::infeasible(format!(
            "{k}-fold cross-validation needs at least {k} samples per class, smallest class has {smallest}"
        )));
    }
    let mut folds = vec![Vec::new(); k];
    for members in classes {
        for (pos, idx) in members.into_iter().enumerate() {
            folds[pos % k].push(idx);
        }
    }
    folds.iter_mut().for_each(|fold| fold.sort_unstable());
    Ok(folds)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateScore {
    pub params: ForestParams,
    pub mean_f1: f64,
    pub fold_f1: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub best: CandidateScore,
    pub candidates: Vec<CandidateScore>,
}

/// Exhaustive grid search scored by positive-class F1.
///
/// Candidate/fold fits run in parallel; the winner is the highest mean F1,
/// earliest candidate on ties.
pub fn grid_search(
    x: &[Vec<f64>],
    y: &[u8],
    grid: &ParamGrid,
    folds: usize,
    seed: u64,
) -> Result<SearchOutcome> {
    let candidates = grid.candidates();
    if candidates.is_empty() {
        return Err(TurnoverError::infeasible("hyperparameter grid is empty"));
    }
    let fold_members = stratified_folds(y, folds)?;
    let jobs: Vec<(usize, usize)> = (0..candidates.len())
        .flat_map(|c| (0..folds).map(move |f| (c, f)))
        .collect();
    info!(candidates = candidates.len(), folds, fits = jobs.len(), "starting grid search");

    let scores: Vec<(usize, usize, f64)> = jobs
        .par_iter()
        .map(|&(candidate, fold)| -> Result<(usize, usize, f64)> {
            let held_out = &fold_members[fold];
            let (mut fit_x, mut fit_y) = (Vec::new(), Vec::new());
            for (f, members) in fold_members.iter().enumerate() {
                if f != fold {
                    for &i in members {
                        fit_x.push(x[i].clone());
                        fit_y.push(y[i]);
                    }
                }
            }
            let forest = RandomForest::fit(&fit_x, &fit_y, candidates[candidate], seed)?;
            let truth: Vec<u8> = held_out.iter().map(|&i| y[i]).collect();
            let predicted: Vec<u8> = held_out.iter().map(|&i| forest.predict(&x[i])).collect();
            Ok((candidate, fold, metrics::f1_positive(&truth, &predicted)))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut per_candidate: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
    for (candidate, _fold, f1) in scores {
        per_candidate.entry(candidate).or_default().push(f1);
    }
    let results: Vec<CandidateScore> = per_candidate
        .into_iter()
        .map(|(candidate, fold_f1)| CandidateScore {
            params: candidates[candidate],
            mean_f1: fold_f1.iter().sum::<f64>() / fold_f1.len() as f64,
            fold_f1,
        })
        .collect();

    let best = results
        .iter()
        .fold(None::<&CandidateScore>, |best, c| match best {
            Some(b) if b.mean_f1 >= c.mean_f1 => Some(b),
            _ => Some(c),
        })
        .cloned()
        .ok_or_else(|| TurnoverError::infeasible("grid search produced no scores"))?;
    info!(mean_f1 = best.mean_f1, params = ?best.params, "grid search finished");
    Ok(SearchOutcome {
        best,
        candidates: results,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOutcome {
    pub bundle: ArtifactBundle,
    pub search: SearchOutcome,
    pub evaluation: Evaluation,
    /// Mean |attribution| per feature on the test partition, descending.
    pub global_importance: Vec<(String, f64)>,
    pub train_size: usize,
    pub balanced_size: usize,
    pub test_size: usize,
}

pub fn train(table: &FeatureTable, config: &TrainConfig) -> Result<TrainingOutcome> {
    let prepared = prepare(table)?;
    info!(
        rows = prepared.x.len(),
        features = prepared.feature_names.len(),
        "prepared feature table"
    );
    let split = stratified_split(&prepared.x, &prepared.y, config.test_fraction, config.seed)?;
    let (balanced_x, balanced_y) =
        balance::oversample(&split.train_x, &split.train_y, config.neighbours, config.seed)?;
    info!(
        train = split.train_x.len(),
        balanced = balanced_x.len(),
        test = split.test_x.len(),
        "partitioned and balanced"
    );

    let search = grid_search(&balanced_x, &balanced_y, &config.grid, config.folds, config.seed)?;
    let model = RandomForest::fit(&balanced_x, &balanced_y, search.best.params, config.seed)?;

    let scores: Vec<f64> = split.test_x.iter().map(|row| model.predict_proba(row)).collect();
    let evaluation = Evaluation::from_scores(&split.test_y, &scores);
    info!(
        accuracy = evaluation.accuracy,
        roc_auc = ?evaluation.roc_auc,
        f1 = evaluation.classes[1].f1,
        "evaluated on held-out partition"
    );

    let importance = TreeExplainer::new(&model).global_importance(&split.test_x);
    let mut global_importance: Vec<(String, f64)> = prepared
        .feature_names
        .iter()
        .cloned()
        .zip(importance)
        .collect();
    global_importance.sort_by(|a, b| b.1.total_cmp(&a.1));

    let bundle = ArtifactBundle::new(model, prepared.scaler, prepared.feature_names);
    bundle.check_consistency()?;
    Ok(TrainingOutcome {
        bundle,
        search,
        evaluation,
        global_importance,
        train_size: split.train_x.len(),
        balanced_size: balanced_x.len(),
        test_size: split.test_x.len(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::features::{derive_features, FeatureRow};
    use crate::models::{FormType, QualityFlag, SurveyResponse, ITEM_COUNT};
    use rand::Rng;

    /// Satisfied stayers and dissatisfied leavers, roughly 4:1.
    pub(crate) fn survey_batch(n_active: usize, n_exit: usize) -> Vec<SurveyResponse> {
        let mut rng = Pcg64::seed_from_u64(99);
        let roles = ["Analyst", "Coordinator", "Manager"];
        let locations = ["Recife", "Brasília", "São Paulo"];
        (0..n_active + n_exit)
            .map(|i| {
                let leaver = i >= n_active;
                let base: i32 = if leaver { 2 } else { 4 };
                let items: [Option<u8>; ITEM_COUNT] = std::array::from_fn(|_| {
                    Some((base + rng.random_range(-1..=1)).clamp(1, 5) as u8)
                });
                SurveyResponse {
                    response_id: format!("r{i}"),
                    employee_id: None,
                    form_type: if leaver {
                        FormType::ExitInterview
                    } else {
                        FormType::ActiveSurvey
                    },
                    items,
                    location: Some(locations[i % 3].to_string()),
                    role: Some(roles[i % 3].to_string()),
                    age_range: Some("26-35".to_string()),
                    tenure_months: Some(rng.random_range(1..120)),
                    target: Some(u8::from(leaver)),
                    quality: QualityFlag::Ok,
                }
            })
            .collect()
    }

    pub(crate) fn quick_config() -> TrainConfig {
        TrainConfig {
            folds: 3,
            grid: ParamGrid {
                n_estimators: vec![10],
                max_depth: vec![Some(4), None],
                min_samples_split: vec![2],
                min_samples_leaf: vec![1],
                max_features: vec![MaxFeatures::Sqrt],
            },
            ..TrainConfig::default()
        }
    }

    #[test]
    fn default_grid_has_forty_eight_candidates() {
        assert_eq!(ParamGrid::default().candidates().len(), 48);
    }

    #[test]
    fn prepare_imputes_column_means() {
        let columns = vec!["a".to_string(), "b".to_string()];
        let row = |id: &str, a: Option<f64>, b: Option<f64>, t: u8| FeatureRow {
            response_id: id.to_string(),
            values: vec![a, b],
            target: Some(t),
            quality: QualityFlag::Ok,
        };
        let table = FeatureTable::new(
            columns,
            vec![
                row("1", Some(1.0), None, 0),
                row("2", Some(3.0), Some(4.0), 1),
                row("3", None, Some(8.0), 0),
            ],
        )
        .unwrap();
        let prepared = prepare(&table).unwrap();
        // imputed a = 2.0 is the column mean, so it scales to 0
        assert!(prepared.x[2][0].abs() < 1e-12);
        assert!(prepared.x[0][1].abs() < 1e-12);
        assert_eq!(prepared.y, vec![0, 1, 0]);
    }

    #[test]
    fn prepare_rejects_empty_and_unlabelled_tables() {
        assert!(matches!(
            prepare(&FeatureTable::default()),
            Err(TurnoverError::TrainingInfeasible(_))
        ));
        let table = FeatureTable::new(
            vec!["a".to_string()],
            vec![FeatureRow {
                response_id: "x".to_string(),
                values: vec![Some(1.0)],
                target: None,
                quality: QualityFlag::Ok,
            }],
        )
        .unwrap();
        assert!(prepare(&table).is_err());
    }

    #[test]
    fn split_preserves_label_ratio() {
        let x: Vec<Vec<f64>> = (0..50).map(|i| vec![f64::from(i)]).collect();
        let y: Vec<u8> = (0..50).map(|i| u8::from(i >= 40)).collect();
        let split = stratified_split(&x, &y, 0.2, 42).unwrap();
        assert_eq!(split.test_y.len(), 10);
        assert_eq!(split.test_y.iter().filter(|&&l| l == 1).count(), 2);
        assert_eq!(split.train_y.iter().filter(|&&l| l == 1).count(), 8);
        assert_eq!(split, stratified_split(&x, &y, 0.2, 42).unwrap());
    }

    #[test]
    fn single_class_cannot_be_split() {
        let x = vec![vec![0.0]; 10];
        let y = vec![0u8; 10];
        let err = stratified_split(&x, &y, 0.2, 42).unwrap_err();
        assert!(matches!(err, TurnoverError::TrainingInfeasible(_)));
    }

    #[test]
    fn folds_are_stratified_and_disjoint() {
        let y: Vec<u8> = (0..20).map(|i| u8::from(i % 4 == 0)).collect();
        let folds = stratified_folds(&y, 5).unwrap();
        let mut all: Vec<usize> = folds.concat();
        all.sort_unstable();
        assert_eq!(all, (0..20).collect::<Vec<_>>());
        assert!(folds.iter().all(|f| f.iter().filter(|&&i| y[i] == 1).count() == 1));
        assert!(stratified_folds(&y, 6).is_err());
    }

    #[test]
    fn grid_search_prefers_earliest_on_ties() {
        let (x, y) = crate::forest::tests::clusters(12);
        let grid = ParamGrid {
            max_features: vec![MaxFeatures::All],
            ..quick_config().grid
        };
        let outcome = grid_search(&x, &y, &grid, 3, 42).unwrap();
        assert_eq!(outcome.candidates.len(), 2);
        assert_eq!(outcome.best.fold_f1.len(), 3);
        let top = outcome
            .candidates
            .iter()
            .map(|c| c.mean_f1)
            .fold(f64::MIN, f64::max);
        let first_top = outcome.candidates.iter().find(|c| c.mean_f1 == top).unwrap();
        assert_eq!(outcome.best.params, first_top.params);
        // both depths separate the clusters perfectly, so the first one wins
        assert_eq!(outcome.best.params, outcome.candidates[0].params);
        assert!((outcome.best.mean_f1 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn end_to_end_training_produces_consistent_bundle() {
        let table = derive_features(&survey_batch(80, 20));
        let outcome = train(&table, &quick_config()).unwrap();
        assert!(outcome.bundle.check_consistency().is_ok());
        assert_eq!(outcome.bundle.feature_names, table.columns());
        assert_eq!(outcome.test_size, 20);
        assert_eq!(outcome.balanced_size, 2 * (outcome.train_size - 16));
        assert!(outcome.evaluation.roc_auc.unwrap() > 0.9);
        assert_eq!(outcome.global_importance.len(), table.columns().len());
    }

    #[test]
    fn single_class_table_aborts_training() {
        let mut batch = survey_batch(30, 0);
        batch.iter_mut().for_each(|r| r.target = Some(0));
        let table = derive_features(&batch);
        assert!(matches!(
            train(&table, &quick_config()),
            Err(TurnoverError::TrainingInfeasible(_))
        ));
    }
}
