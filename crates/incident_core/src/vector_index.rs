use crate::embed::l2_normalize;
use crate::error::{IncidentError, Result};

/// Exhaustive inner-product index over unit vectors, so scores are cosine
/// similarities.
#[derive(Debug, Clone, Default)]
pub struct FlatIpIndex {
    dim: usize,
    data: Vec<f32>,
}

impl FlatIpIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            data: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn check_dim(&self, got: usize) -> Result<()> {
        if got != self.dim {
            return Err(IncidentError::InvalidArg(format!(
                "vector dimension {got} does not match index dimension {}",
                self.dim
            )));
        }
        Ok(())
    }

    /// Appends a copy of `vector`, normalised. Returns its position.
    pub fn add(&mut self, vector: &[f32]) -> Result<usize> {
        self.check_dim(vector.len())?;
        let start = self.data.len();
        self.data.extend_from_slice(vector);
        l2_normalize(&mut self.data[start..]);
        Ok(self.len() - 1)
    }

    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dim)?;
        self.data.get(start..start + self.dim)
    }

    /// Best `k` positions by descending score.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        self.check_dim(query.len())?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut q = query.to_vec();
        l2_normalize(&mut q);

        let mut scored: Vec<(usize, f32)> = self
            .data
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(i, row)| (i, row.iter().zip(&q).map(|(a, b)| a * b).sum()))
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(rows: &[[f32; 2]]) -> FlatIpIndex {
        let mut index = FlatIpIndex::new(2);
        for r in rows {
            index.add(r).unwrap();
        }
        index
    }

    #[test]
    fn scores_are_cosine_similarities() {
        let index = index_of(&[[3.0, 0.0], [0.0, 2.0], [1.0, 1.0]]);
        let hits = index.search(&[10.0, 0.0], 3).unwrap();

        assert_eq!(hits[0].0, 0);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
        assert_eq!(hits[1].0, 2);
        assert!((hits[1].1 - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert!(hits[2].1.abs() < 1e-6);
    }

    #[test]
    fn k_is_capped_by_index_size() {
        let index = index_of(&[[1.0, 0.0], [0.0, 1.0]]);
        assert_eq!(index.search(&[1.0, 1.0], 10).unwrap().len(), 2);
        assert!(index.search(&[1.0, 1.0], 0).unwrap().is_empty());
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = FlatIpIndex::new(4);
        assert!(index.search(&[1.0, 0.0, 0.0, 0.0], 5).unwrap().is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn rejects_dimension_mismatch() {
        let mut index = FlatIpIndex::new(3);
        assert!(index.add(&[1.0, 2.0]).is_err());
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn stored_vectors_are_normalised() {
        let index = index_of(&[[3.0, 4.0]]);
        let v = index.vector(0).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert!(index.vector(1).is_none());
    }
}
