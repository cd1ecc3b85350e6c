use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Train/test split that keeps each class's share in both halves.
///
/// Classes with at least two members always contribute one test sample and
/// keep at least one for training. Both index lists come back sorted.
pub fn stratified_split(labels: &[usize], test_size: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, &y) in labels.iter().enumerate() {
        by_class.entry(y).or_default().push(i);
    }

    let mut train = Vec::with_capacity(labels.len());
    let mut test = Vec::new();
    for (_, mut members) in by_class {
        members.shuffle(&mut rng);
        let n = members.len();
        let n_test = if n < 2 {
            0
        } else {
            ((n as f64 * test_size).round() as usize).clamp(1, n - 1)
        };
        test.extend_from_slice(&members[..n_test]);
        train.extend_from_slice(&members[n_test..]);
    }

    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub support: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub accuracy: f64,
    /// Support-weighted mean of per-class F1.
    pub f1_score: f64,
    /// `confusion_matrix[true][predicted]`.
    pub confusion_matrix: Vec<Vec<usize>>,
    pub classification_report: BTreeMap<String, ClassMetrics>,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

pub fn evaluate(y_true: &[usize], y_pred: &[usize], labels: &[&str]) -> Evaluation {
    let k = labels.len();
    let mut confusion = vec![vec![0usize; k]; k];
    for (&t, &p) in y_true.iter().zip(y_pred) {
        if t < k && p < k {
            confusion[t][p] += 1;
        }
    }

    let total: usize = confusion.iter().flatten().sum();
    let correct: usize = (0..k).map(|c| confusion[c][c]).sum();

    let mut report = BTreeMap::new();
    let mut weighted_f1 = 0.0;
    for (c, name) in labels.iter().enumerate() {
        let tp = confusion[c][c];
        let support: usize = confusion[c].iter().sum();
        let predicted: usize = (0..k).map(|r| confusion[r][c]).sum();

        let precision = ratio(tp, predicted);
        let recall = ratio(tp, support);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        weighted_f1 += f1 * support as f64;

        report.insert(
            name.to_string(),
            ClassMetrics {
                precision,
                recall,
                f1_score: f1,
                support,
            },
        );
    }

    Evaluation {
        accuracy: ratio(correct, total),
        f1_score: if total == 0 {
            0.0
        } else {
            weighted_f1 / total as f64
        },
        confusion_matrix: confusion,
        classification_report: report,
    }
}
