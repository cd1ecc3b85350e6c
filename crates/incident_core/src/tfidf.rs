use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::text::{is_stop_word, tokens};

/// A sparse row: `(feature index, value)` sorted by index.
pub type SparseRow = Vec<(usize, f32)>;

/// Word unigram/bigram TF-IDF with a capped vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TfidfVectorizer {
    pub max_features: usize,
    pub ngram_range: (usize, usize),
    vocabulary: BTreeMap<String, usize>,
    idf: Vec<f32>,
}

impl Default for TfidfVectorizer {
    fn default() -> Self {
        Self::new(200, (1, 2))
    }
}

impl TfidfVectorizer {
    pub fn new(max_features: usize, ngram_range: (usize, usize)) -> Self {
        Self {
            max_features,
            ngram_range,
            vocabulary: BTreeMap::new(),
            idf: Vec::new(),
        }
    }

    pub fn num_features(&self) -> usize {
        self.idf.len()
    }

    pub fn is_fitted(&self) -> bool {
        !self.idf.is_empty()
    }

    fn terms(&self, text: &str) -> Vec<String> {
        let words: Vec<String> = tokens(text).filter(|w| !is_stop_word(w)).collect();
        let (lo, hi) = self.ngram_range;
        let mut out = Vec::new();
        for n in lo.max(1)..=hi {
            out.extend(words.windows(n).map(|w| w.join(" ")));
        }
        out
    }

    pub fn fit(&mut self, docs: &[&str]) {
        let mut term_freq: HashMap<String, usize> = HashMap::new();
        let mut doc_freq: HashMap<String, usize> = HashMap::new();

        for doc in docs {
            let terms = self.terms(doc);
            let unique: HashSet<&String> = terms.iter().collect();
            for t in unique {
                *doc_freq.entry(t.clone()).or_default() += 1;
            }
            for t in terms {
                *term_freq.entry(t).or_default() += 1;
            }
        }

        let mut ranked: Vec<(String, usize)> = term_freq.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(self.max_features);

        let mut kept: Vec<String> = ranked.into_iter().map(|(t, _)| t).collect();
        kept.sort();

        let n = docs.len() as f32;
        self.idf = kept
            .iter()
            .map(|t| {
                let df = doc_freq.get(t).copied().unwrap_or(0) as f32;
                ((1.0 + n) / (1.0 + df)).ln() + 1.0
            })
            .collect();
        self.vocabulary = kept.into_iter().enumerate().map(|(i, t)| (t, i)).collect();
    }

    pub fn transform_one(&self, doc: &str) -> SparseRow {
        let mut counts: BTreeMap<usize, f32> = BTreeMap::new();
        for t in self.terms(doc) {
            if let Some(&idx) = self.vocabulary.get(&t) {
                *counts.entry(idx).or_default() += 1.0;
            }
        }

        let mut row: SparseRow = counts
            .into_iter()
            .map(|(idx, c)| (idx, c * self.idf[idx]))
            .collect();
        let norm = row.iter().map(|(_, v)| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for (_, v) in row.iter_mut() {
                *v /= norm;
            }
        }
        row
    }

    pub fn transform(&self, docs: &[&str]) -> Vec<SparseRow> {
        docs.iter().map(|d| self.transform_one(d)).collect()
    }

    pub fn fit_transform(&mut self, docs: &[&str]) -> Vec<SparseRow> {
        self.fit(docs);
        self.transform(docs)
    }

    /// Feature names in index order.
    pub fn feature_names(&self) -> Vec<String> {
        let mut names = vec![String::new(); self.vocabulary.len()];
        for (term, &idx) in &self.vocabulary {
            names[idx] = term.clone();
        }
        names
    }
}
