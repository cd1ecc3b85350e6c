//! Multiclass gradient-boosted decision trees over sparse features.
//!
//! Each boosting round grows one regression tree per class on the softmax
//! gradients. Splits are searched on per-feature histograms of quantile
//! bins; zero is always a bin boundary of its own so the implicit zeros of
//! sparse rows never need to be materialised.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{IncidentError, Result};
use crate::tfidf::SparseRow;

const MIN_HESSIAN: f64 = 1e-16;
const MIN_SPLIT_GAIN: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GbdtParams {
    pub num_class: usize,
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub lambda: f64,
    pub min_child_weight: f64,
    pub max_bins: usize,
}

impl Default for GbdtParams {
    fn default() -> Self {
        Self {
            num_class: 4,
            n_estimators: 100,
            max_depth: 5,
            learning_rate: 0.1,
            lambda: 1.0,
            min_child_weight: 1.0,
            max_bins: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Node {
    Leaf {
        weight: f32,
    },
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
}

/// Nodes in an arena; index 0 is the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn predict(&self, row: &SparseRow) -> f32 {
        let mut at = 0;
        loop {
            match &self.nodes[at] {
                Node::Leaf { weight } => return *weight,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    at = if feature_value(row, *feature) <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }
}

fn feature_value(row: &SparseRow, feature: usize) -> f32 {
    row.binary_search_by_key(&feature, |(f, _)| *f)
        .map_or(0.0, |i| row[i].1)
}

/// Per-feature bin boundaries. `bin(v)` is the first boundary `>= v`.
struct Binning {
    cuts: Vec<Vec<f32>>,
    offsets: Vec<usize>,
    zero_bin: Vec<usize>,
    total_bins: usize,
}

impl Binning {
    fn build(rows: &[SparseRow], num_features: usize, max_bins: usize) -> Self {
        let mut values: Vec<Vec<f32>> = vec![Vec::new(); num_features];
        for row in rows {
            for &(f, v) in row {
                if v != 0.0 {
                    values[f].push(v);
                }
            }
        }

        let quantiles = max_bins.saturating_sub(1).max(1);
        let mut cuts = Vec::with_capacity(num_features);
        for mut vals in values {
            vals.sort_by(f32::total_cmp);
            let mut c = vec![0.0f32];
            if !vals.is_empty() {
                for k in 1..=quantiles {
                    let pos = (k * vals.len()).div_ceil(quantiles).saturating_sub(1);
                    c.push(vals[pos.min(vals.len() - 1)]);
                }
            }
            c.sort_by(f32::total_cmp);
            c.dedup();
            cuts.push(c);
        }

        let mut offsets = Vec::with_capacity(num_features);
        let mut total_bins = 0;
        for c in &cuts {
            offsets.push(total_bins);
            total_bins += c.len();
        }
        let zero_bin = cuts
            .iter()
            .map(|c| c.partition_point(|x| *x < 0.0))
            .collect();

        Self {
            cuts,
            offsets,
            zero_bin,
            total_bins,
        }
    }

    fn bin(&self, feature: usize, v: f32) -> usize {
        let c = &self.cuts[feature];
        c.partition_point(|x| *x < v).min(c.len() - 1)
    }
}

/// Training rows reduced to `(feature, bin)` pairs.
struct BinnedRows {
    rows: Vec<Vec<(usize, usize)>>,
}

impl BinnedRows {
    fn new(rows: &[SparseRow], binning: &Binning) -> Self {
        Self {
            rows: rows
                .iter()
                .map(|r| r.iter().map(|&(f, v)| (f, binning.bin(f, v))).collect())
                .collect(),
        }
    }

    fn bin_of(&self, sample: usize, feature: usize, binning: &Binning) -> usize {
        let row = &self.rows[sample];
        row.binary_search_by_key(&feature, |(f, _)| *f)
            .map_or(binning.zero_bin[feature], |i| row[i].1)
    }
}

struct SplitCandidate {
    feature: usize,
    bin: usize,
    gain: f64,
}

struct TreeBuilder<'a> {
    params: &'a GbdtParams,
    binning: &'a Binning,
    data: &'a BinnedRows,
    grad: &'a [f64],
    hess: &'a [f64],
    nodes: Vec<Node>,
    gains: Vec<(usize, f64)>,
}

impl TreeBuilder<'_> {
    fn leaf_weight(&self, g: f64, h: f64) -> f32 {
        (-g / (h + self.params.lambda) * self.params.learning_rate) as f32
    }

    fn grow(&mut self, samples: Vec<usize>, depth: usize) -> usize {
        let g: f64 = samples.iter().map(|&i| self.grad[i]).sum();
        let h: f64 = samples.iter().map(|&i| self.hess[i]).sum();

        let split = if depth < self.params.max_depth {
            self.best_split(&samples, g, h)
        } else {
            None
        };

        let at = self.nodes.len();
        let Some(split) = split else {
            self.nodes.push(Node::Leaf {
                weight: self.leaf_weight(g, h),
            });
            return at;
        };

        let (left, right): (Vec<usize>, Vec<usize>) = samples
            .into_iter()
            .partition(|&i| self.data.bin_of(i, split.feature, self.binning) <= split.bin);

        self.gains.push((split.feature, split.gain));
        self.nodes.push(Node::Leaf { weight: 0.0 });
        let l = self.grow(left, depth + 1);
        let r = self.grow(right, depth + 1);
        self.nodes[at] = Node::Split {
            feature: split.feature,
            threshold: self.binning.cuts[split.feature][split.bin],
            left: l,
            right: r,
        };
        at
    }

    fn best_split(&self, samples: &[usize], g: f64, h: f64) -> Option<SplitCandidate> {
        let binning = self.binning;
        let mut hist = vec![(0.0f64, 0.0f64); binning.total_bins];
        for &i in samples {
            for &(f, b) in &self.data.rows[i] {
                let slot = &mut hist[binning.offsets[f] + b];
                slot.0 += self.grad[i];
                slot.1 += self.hess[i];
            }
        }

        let lambda = self.params.lambda;
        let min_child = self.params.min_child_weight;
        let parent = g * g / (h + lambda);
        let mut best: Option<SplitCandidate> = None;

        for (f, cuts) in binning.cuts.iter().enumerate() {
            let nbins = cuts.len();
            if nbins < 2 {
                continue;
            }
            let bins = &mut hist[binning.offsets[f]..binning.offsets[f] + nbins];
            let (sg, sh) = bins
                .iter()
                .fold((0.0, 0.0), |(a, b), (x, y)| (a + x, b + y));
            let zb = binning.zero_bin[f];
            bins[zb].0 += g - sg;
            bins[zb].1 += h - sh;

            let (mut gl, mut hl) = (0.0, 0.0);
            for (b, &(bg, bh)) in bins.iter().enumerate().take(nbins - 1) {
                gl += bg;
                hl += bh;
                let (gr, hr) = (g - gl, h - hl);
                if hl < min_child || hr < min_child {
                    continue;
                }
                let gain = gl * gl / (hl + lambda) + gr * gr / (hr + lambda) - parent;
                if gain > MIN_SPLIT_GAIN && best.as_ref().map_or(true, |s| gain > s.gain) {
                    best = Some(SplitCandidate {
                        feature: f,
                        bin: b,
                        gain,
                    });
                }
            }
        }
        best
    }
}

/// A fitted multiclass boosting model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoostedTrees {
    params: GbdtParams,
    num_features: usize,
    /// `rounds[r][k]` is the tree for class `k` in round `r`.
    rounds: Vec<Vec<Tree>>,
    importance: Vec<f32>,
}

impl GradientBoostedTrees {
    pub fn fit(
        params: GbdtParams,
        rows: &[SparseRow],
        num_features: usize,
        labels: &[usize],
    ) -> Result<Self> {
        let k = params.num_class;
        if rows.is_empty() || rows.len() != labels.len() {
            return Err(IncidentError::InvalidArg(format!(
                "{} rows with {} labels",
                rows.len(),
                labels.len()
            )));
        }
        if k < 2 || labels.iter().any(|&y| y >= k) {
            return Err(IncidentError::InvalidArg(format!(
                "labels must lie in 0..{k} with at least two classes"
            )));
        }
        if let Some(&(f, _)) = rows.iter().flatten().find(|(f, _)| *f >= num_features) {
            return Err(IncidentError::InvalidArg(format!(
                "feature {f} out of range for {num_features} features"
            )));
        }

        let binning = Binning::build(rows, num_features, params.max_bins);
        let data = BinnedRows::new(rows, &binning);
        let n = rows.len();

        let mut margins = vec![vec![0.0f64; k]; n];
        let mut rounds = Vec::with_capacity(params.n_estimators);
        let mut gain_total = vec![0.0f64; num_features];

        for round in 0..params.n_estimators {
            let probs: Vec<Vec<f64>> = margins.iter().map(|m| softmax(m)).collect();

            let grown: Vec<(Tree, Vec<(usize, f64)>)> = (0..k)
                .into_par_iter()
                .map(|class| {
                    let grad: Vec<f64> = (0..n)
                        .map(|i| probs[i][class] - f64::from(u8::from(labels[i] == class)))
                        .collect();
                    let hess: Vec<f64> = (0..n)
                        .map(|i| {
                            let p = probs[i][class];
                            (2.0 * p * (1.0 - p)).max(MIN_HESSIAN)
                        })
                        .collect();

                    let mut builder = TreeBuilder {
                        params: &params,
                        binning: &binning,
                        data: &data,
                        grad: &grad,
                        hess: &hess,
                        nodes: Vec::new(),
                        gains: Vec::new(),
                    };
                    builder.grow((0..n).collect(), 0);
                    (
                        Tree {
                            nodes: builder.nodes,
                        },
                        builder.gains,
                    )
                })
                .collect();

            let mut trees = Vec::with_capacity(k);
            for (class, (tree, gains)) in grown.into_iter().enumerate() {
                for (f, gain) in gains {
                    gain_total[f] += gain;
                }
                for (i, row) in rows.iter().enumerate() {
                    margins[i][class] += f64::from(tree.predict(row));
                }
                trees.push(tree);
            }
            rounds.push(trees);

            if round % 25 == 0 {
                debug!(round, "boosting");
            }
        }

        let total: f64 = gain_total.iter().sum();
        let importance = gain_total
            .iter()
            .map(|g| if total > 0.0 { (g / total) as f32 } else { 0.0 })
            .collect();

        Ok(Self {
            params,
            num_features,
            rounds,
            importance,
        })
    }

    pub fn num_class(&self) -> usize {
        self.params.num_class
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn params(&self) -> &GbdtParams {
        &self.params
    }

    pub fn predict_margin(&self, row: &SparseRow) -> Vec<f64> {
        let mut margin = vec![0.0f64; self.params.num_class];
        for trees in &self.rounds {
            for (class, tree) in trees.iter().enumerate() {
                margin[class] += f64::from(tree.predict(row));
            }
        }
        margin
    }

    pub fn predict_proba(&self, row: &SparseRow) -> Vec<f32> {
        softmax(&self.predict_margin(row))
            .into_iter()
            .map(|p| p as f32)
            .collect()
    }

    pub fn predict(&self, row: &SparseRow) -> usize {
        argmax(&self.predict_proba(row))
    }

    /// Share of total split gain attributed to each feature.
    pub fn feature_importance(&self) -> &[f32] {
        &self.importance
    }
}

fn softmax(margin: &[f64]) -> Vec<f64> {
    let max = margin.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exp: Vec<f64> = margin.iter().map(|m| (m - max).exp()).collect();
    let sum: f64 = exp.iter().sum();
    exp.into_iter().map(|e| e / sum).collect()
}

/// Index of the largest value; the first one wins ties.
pub fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
            if v > best.1 {
                (i, v)
            } else {
                best
            }
        })
        .0
}
