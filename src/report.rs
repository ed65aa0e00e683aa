use std::fmt::Write;

use crate::forest::{ForestParams, MaxFeatures};
use crate::metrics::Evaluation;
use crate::train::TrainingOutcome;

const IMPORTANCE_ROWS: usize = 15;
const CANDIDATE_ROWS: usize = 5;

fn describe_params(params: &ForestParams) -> String {
    let depth = params
        .max_depth
        .map_or_else(|| "unbounded".to_string(), |d| d.to_string());
    let features = match params.max_features {
        MaxFeatures::Sqrt => "sqrt",
        MaxFeatures::Log2 => "log2",
        MaxFeatures::All => "all",
    };
    format!(
        "n_estimators={}, max_depth={}, min_samples_split={}, min_samples_leaf={}, max_features={}",
        params.n_estimators, depth, params.min_samples_split, params.min_samples_leaf, features
    )
}

fn write_evaluation(output: &mut String, evaluation: &Evaluation) {
    let _ = writeln!(output, "## Classification Report");
    let _ = writeln!(output, "| class | precision | recall | f1 | support |");
    let _ = writeln!(output, "|---|---|---|---|---|");
    for (name, metrics) in ["stays (0)", "leaves (1)"].iter().zip(&evaluation.classes) {
        let _ = writeln!(
            output,
            "| {} | {:.3} | {:.3} | {:.3} | {} |",
            name, metrics.precision, metrics.recall, metrics.f1, metrics.support
        );
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "Accuracy: {:.3}", evaluation.accuracy);
    match evaluation.roc_auc {
        Some(auc) => {
            let _ = writeln!(output, "ROC-AUC: {auc:.3}");
        }
        None => {
            let _ = writeln!(output, "ROC-AUC: undefined (single class in test partition)");
        }
    }

    let confusion = &evaluation.confusion;
    let _ = writeln!(output);
    let _ = writeln!(output, "## Confusion Matrix");
    let _ = writeln!(output, "| | predicted 0 | predicted 1 |");
    let _ = writeln!(output, "|---|---|---|");
    let _ = writeln!(
        output,
        "| actual 0 | {} | {} |",
        confusion.true_negative, confusion.false_positive
    );
    let _ = writeln!(
        output,
        "| actual 1 | {} | {} |",
        confusion.false_negative, confusion.true_positive
    );
}

pub fn build_report(outcome: &TrainingOutcome) -> String {
    let mut output = String::new();
    let bundle = &outcome.bundle;

    let _ = writeln!(output, "# Turnover Risk Model Report");
    let _ = writeln!(
        output,
        "Bundle {} trained at {}",
        bundle.bundle_id,
        bundle.trained_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Data");
    let _ = writeln!(output, "- features: {}", bundle.feature_names.len());
    let _ = writeln!(
        output,
        "- training rows: {} ({} after balancing)",
        outcome.train_size, outcome.balanced_size
    );
    let _ = writeln!(output, "- held-out rows: {}", outcome.test_size);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Model Selection");
    let _ = writeln!(output, "Selected: {}", describe_params(&outcome.search.best.params));
    let _ = writeln!(
        output,
        "Cross-validated F1: {:.3} across {} folds",
        outcome.search.best.mean_f1,
        outcome.search.best.fold_f1.len()
    );
    let mut ranked: Vec<_> = outcome.search.candidates.iter().collect();
    ranked.sort_by(|a, b| b.mean_f1.total_cmp(&a.mean_f1));
    if ranked.len() > 1 {
        let _ = writeln!(output);
        let _ = writeln!(output, "Top candidates:");
        for candidate in ranked.iter().take(CANDIDATE_ROWS) {
            let _ = writeln!(
                output,
                "- {:.3} {}",
                candidate.mean_f1,
                describe_params(&candidate.params)
            );
        }
    }

    let _ = writeln!(output);
    write_evaluation(&mut output, &outcome.evaluation);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Global Drivers");
    if outcome.global_importance.is_empty() {
        let _ = writeln!(output, "No attributions computed.");
    } else {
        let _ = writeln!(output, "Mean absolute attribution on the held-out partition:");
        for (rank, (feature, value)) in outcome
            .global_importance
            .iter()
            .take(IMPORTANCE_ROWS)
            .enumerate()
        {
            let _ = writeln!(output, "{}. {} ({:.4})", rank + 1, feature, value);
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::tests::tiny_bundle;
    use crate::train::{CandidateScore, SearchOutcome};

    fn outcome() -> TrainingOutcome {
        let best = CandidateScore {
            params: ForestParams::default(),
            mean_f1: 0.812,
            fold_f1: vec![0.8, 0.824, 0.812],
        };
        let worse = CandidateScore {
            params: ForestParams {
                max_depth: Some(10),
                ..ForestParams::default()
            },
            mean_f1: 0.7,
            fold_f1: vec![0.7; 3],
        };
        TrainingOutcome {
            bundle: tiny_bundle(),
            search: SearchOutcome {
                best: best.clone(),
                candidates: vec![best, worse],
            },
            evaluation: Evaluation::from_scores(&[0, 0, 1, 1], &[0.1, 0.6, 0.7, 0.9]),
            global_importance: vec![("manager_mean".to_string(), 0.21), ("wlb_mean".to_string(), 0.05)],
            train_size: 40,
            balanced_size: 64,
            test_size: 4,
        }
    }

    #[test]
    fn report_lists_selection_and_metrics() {
        let report = build_report(&outcome());
        assert!(report.starts_with("# Turnover Risk Model Report"));
        assert!(report.contains("max_depth=unbounded"));
        assert!(report.contains("Cross-validated F1: 0.812 across 3 folds"));
        assert!(report.contains("ROC-AUC: 1.000"));
        assert!(report.contains("| actual 0 | 1 | 1 |"));
        assert!(report.contains("1. manager_mean (0.2100)"));
    }

    #[test]
    fn single_class_test_partition_is_reported() {
        let mut outcome = outcome();
        outcome.evaluation = Evaluation::from_scores(&[0, 0], &[0.1, 0.2]);
        let report = build_report(&outcome);
        assert!(report.contains("ROC-AUC: undefined"));
    }
}
