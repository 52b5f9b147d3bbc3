//! The ANN index facade.
//!
//! All three kinds are backed by an exact scan; the facade fixes the
//! contract (declared dimension, optional capacity, descending-score
//! search with ascending-id tie-break), not the data structure behind it.

use crate::error::{Error, Result};
use ndarray::Array1;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKind {
    FlatIp,
    IvfFlat,
    HnswCosine,
}

impl FromStr for IndexKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<IndexKind> {
        match s {
            "flat_ip" => Ok(IndexKind::FlatIp),
            "ivf_flat" => Ok(IndexKind::IvfFlat),
            "hnsw_cosine" => Ok(IndexKind::HnswCosine),
            other => Err(Error::Kernel(format!("unknown index kind '{}'", other))),
        }
    }
}

/// One search result: element id and similarity score.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SearchHit {
    pub id: f64,
    pub score: f64,
}

#[derive(Debug)]
pub struct AnnIndex {
    kind: IndexKind,
    dim: usize,
    capacity: Option<usize>,
    vectors: Vec<Array1<f64>>,
    ids: Vec<f64>,
}

impl AnnIndex {
    pub fn new(kind: IndexKind, dim: usize, capacity: Option<usize>) -> Result<AnnIndex> {
        if dim == 0 {
            return Err(Error::ShapeMismatch(
                "index dimension must be positive".to_string(),
            ));
        }
        Ok(AnnIndex {
            kind,
            dim,
            capacity,
            vectors: Vec::new(),
            ids: Vec::new(),
        })
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Add vectors, with explicit ids or sequential ones starting at the
    /// current element count.
    pub fn add(&mut self, vectors: Vec<Array1<f64>>, ids: Option<Vec<f64>>) -> Result<()> {
        if let Some(ids) = &ids {
            if ids.len() != vectors.len() {
                return Err(Error::ShapeMismatch(format!(
                    "{} ids for {} vectors",
                    ids.len(),
                    vectors.len()
                )));
            }
        }
        for vector in &vectors {
            if vector.len() != self.dim {
                return Err(Error::ShapeMismatch(format!(
                    "vector of length {} added to index of dimension {}",
                    vector.len(),
                    self.dim
                )));
            }
        }
        if let Some(capacity) = self.capacity {
            if self.vectors.len() + vectors.len() > capacity {
                return Err(Error::Kernel(format!(
                    "index capacity of {} elements exceeded",
                    capacity
                )));
            }
        }
        let base = self.vectors.len() as f64;
        let ids = ids.unwrap_or_else(|| {
            (0..vectors.len()).map(|offset| base + offset as f64).collect()
        });
        self.ids.extend(ids);
        self.vectors.extend(vectors);
        Ok(())
    }

    /// Top-`k` elements by descending score; equal scores order by
    /// ascending id so results are deterministic.
    pub fn search(&self, query: &Array1<f64>, k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dim {
            return Err(Error::ShapeMismatch(format!(
                "query of length {} against index of dimension {}",
                query.len(),
                self.dim
            )));
        }
        let mut hits: Vec<SearchHit> = self
            .vectors
            .iter()
            .zip(&self.ids)
            .map(|(vector, id)| SearchHit {
                id: *id,
                score: match self.kind {
                    IndexKind::FlatIp | IndexKind::IvfFlat => vector.dot(query),
                    IndexKind::HnswCosine => super::kernels::cosine_unchecked(vector, query),
                },
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.total_cmp(&b.id)));
        hits.truncate(k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn inner_product_search_orders_by_descending_score() {
        let mut index = AnnIndex::new(IndexKind::FlatIp, 2, None).unwrap();
        index
            .add(
                vec![arr1(&[1.0, 0.0]), arr1(&[0.0, 1.0]), arr1(&[2.0, 0.0])],
                None,
            )
            .unwrap();
        let hits = index.search(&arr1(&[1.0, 0.0]), 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, 2.0);
        assert_eq!(hits[1].id, 0.0);
    }

    #[test]
    fn ties_break_by_ascending_id() {
        let mut index = AnnIndex::new(IndexKind::FlatIp, 2, None).unwrap();
        index
            .add(
                vec![arr1(&[1.0, 0.0]), arr1(&[1.0, 0.0]), arr1(&[1.0, 0.0])],
                Some(vec![9.0, 3.0, 6.0]),
            )
            .unwrap();
        let hits = index.search(&arr1(&[1.0, 0.0]), 3).unwrap();
        let ids: Vec<f64> = hits.iter().map(|hit| hit.id).collect();
        assert_eq!(ids, vec![3.0, 6.0, 9.0]);
    }

    #[test]
    fn cosine_index_normalizes_magnitude_away() {
        let mut index = AnnIndex::new(IndexKind::HnswCosine, 2, None).unwrap();
        index
            .add(vec![arr1(&[10.0, 0.0]), arr1(&[1.0, 1.0])], None)
            .unwrap();
        let hits = index.search(&arr1(&[1.0, 0.0]), 2).unwrap();
        assert_eq!(hits[0].id, 0.0);
        assert!((hits[0].score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn shape_and_capacity_violations_are_rejected() {
        let mut index = AnnIndex::new(IndexKind::IvfFlat, 3, Some(1)).unwrap();
        assert!(matches!(
            index.add(vec![arr1(&[1.0, 2.0])], None),
            Err(Error::ShapeMismatch(_))
        ));
        index.add(vec![arr1(&[1.0, 2.0, 3.0])], None).unwrap();
        assert!(index.add(vec![arr1(&[4.0, 5.0, 6.0])], None).is_err());
        assert!(matches!(
            index.search(&arr1(&[1.0]), 1),
            Err(Error::ShapeMismatch(_))
        ));
    }
}
