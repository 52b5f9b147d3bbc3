//! Hyperdimensional computing primitives.
//!
//! The math runs in the foreign substrate ([`kernels`]); the kernel-facing
//! surface is [`VsaOps`], which reaches the substrate through the bridge so
//! every operation serializes behind the gate like any other foreign call.

mod index;

pub use index::{AnnIndex, IndexKind, SearchHit};

use crate::bridge::SynapticBridge;
use crate::error::{Error, Result};
use crate::value::Value;
use indexmap::IndexMap;
use std::sync::Arc;

/// Default hypervector dimensionality.
pub const DEFAULT_DIMENSION: usize = 10_000;

/// The raw ndarray kernels executed by the substrate.
pub mod kernels {
    use super::*;
    use aes_prng::AesRng;
    use ndarray::{Array1, Zip};
    use rand::{Rng, SeedableRng};

    fn same_shape(a: &Array1<f64>, b: &Array1<f64>) -> Result<()> {
        if a.len() != b.len() || a.is_empty() {
            return Err(Error::ShapeMismatch(format!(
                "expected matching non-empty shapes, got {} and {}",
                a.len(),
                b.len()
            )));
        }
        Ok(())
    }

    /// Element-wise product.
    pub fn bind(a: &Array1<f64>, b: &Array1<f64>) -> Result<Array1<f64>> {
        same_shape(a, b)?;
        Ok(a * b)
    }

    /// Element-wise sum.
    pub fn bundle(a: &Array1<f64>, b: &Array1<f64>) -> Result<Array1<f64>> {
        same_shape(a, b)?;
        Ok(a + b)
    }

    /// Element-wise division with a zero-guard: wherever the key is 0 the
    /// result is 0 rather than an error.
    pub fn unbind(bound: &Array1<f64>, key: &Array1<f64>) -> Result<Array1<f64>> {
        same_shape(bound, key)?;
        Ok(Zip::from(bound)
            .and(key)
            .map_collect(|b, k| if *k == 0.0 { 0.0 } else { b / k }))
    }

    /// Cosine similarity; 0 when either norm is 0.
    pub fn cosine(a: &Array1<f64>, b: &Array1<f64>) -> Result<f64> {
        same_shape(a, b)?;
        Ok(cosine_unchecked(a, b))
    }

    pub(crate) fn cosine_unchecked(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
        let norm_a = a.dot(a).sqrt();
        let norm_b = b.dot(b).sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        a.dot(b) / (norm_a * norm_b)
    }

    /// Random bipolar hypervector. With a seed the output is reproducible
    /// across processes.
    pub fn generate(dim: usize, seed: Option<u64>) -> Array1<f64> {
        let mut rng = AesRng::seed_from_u64(seed.unwrap_or_else(rand::random));
        Array1::from_iter((0..dim).map(|_| if rng.random::<bool>() { 1.0 } else { -1.0 }))
    }
}

/// Kernel-side VSA surface; every call crosses the bridge.
pub struct VsaOps {
    bridge: Arc<SynapticBridge>,
}

impl VsaOps {
    pub fn new(bridge: Arc<SynapticBridge>) -> VsaOps {
        VsaOps { bridge }
    }

    fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let mut callable = IndexMap::new();
        callable.insert("module".to_string(), Value::from("vsa"));
        callable.insert("name".to_string(), Value::from(name));
        self.bridge.call(&Value::Map(callable), &args, None)
    }

    pub fn bind(&self, a: &[f64], b: &[f64]) -> Result<Vec<f64>> {
        check_shapes(a, b)?;
        numbers_from(self.call("bind", vec![numbers_into(a), numbers_into(b)])?)
    }

    pub fn bundle(&self, a: &[f64], b: &[f64]) -> Result<Vec<f64>> {
        check_shapes(a, b)?;
        numbers_from(self.call("bundle", vec![numbers_into(a), numbers_into(b)])?)
    }

    pub fn unbind(&self, bound: &[f64], key: &[f64]) -> Result<Vec<f64>> {
        check_shapes(bound, key)?;
        numbers_from(self.call("unbind", vec![numbers_into(bound), numbers_into(key)])?)
    }

    pub fn cosine(&self, a: &[f64], b: &[f64]) -> Result<f64> {
        check_shapes(a, b)?;
        let out = self.call("cosine", vec![numbers_into(a), numbers_into(b)])?;
        out.as_number()
            .ok_or_else(|| Error::Kernel(format!("cosine returned {}", out.kind_name())))
    }

    pub fn generate_hypervector(
        &self,
        dim: Option<usize>,
        seed: Option<u64>,
    ) -> Result<Vec<f64>> {
        let mut args = vec![Value::from(dim.unwrap_or(DEFAULT_DIMENSION) as f64)];
        if let Some(seed) = seed {
            args.push(Value::from(seed as f64));
        }
        numbers_from(self.call("generate", args)?)
    }

    /// Create an index; the result is a foreign handle value.
    pub fn index_create(
        &self,
        kind: &str,
        dim: usize,
        capacity: Option<usize>,
    ) -> Result<Value> {
        let mut args = vec![Value::from(kind), Value::from(dim as f64)];
        if let Some(capacity) = capacity {
            args.push(Value::from(capacity as f64));
        }
        self.call("index_create", args)
    }

    pub fn index_add(
        &self,
        index: &Value,
        vectors: &[Vec<f64>],
        ids: Option<&[f64]>,
    ) -> Result<()> {
        let vectors = Value::List(vectors.iter().map(|v| numbers_into(v)).collect());
        let mut args = vec![index.clone(), vectors];
        if let Some(ids) = ids {
            args.push(numbers_into(ids));
        }
        self.call("index_add", args)?;
        Ok(())
    }

    pub fn index_search(&self, index: &Value, query: &[f64], k: usize) -> Result<Vec<SearchHit>> {
        let out = self.call(
            "index_search",
            vec![index.clone(), numbers_into(query), Value::from(k as f64)],
        )?;
        let hits = out
            .as_list()
            .ok_or_else(|| Error::Kernel(format!("index_search returned {}", out.kind_name())))?;
        hits.iter()
            .map(|hit| {
                let entries = hit
                    .as_map()
                    .ok_or_else(|| Error::Kernel("search hit is not a map".to_string()))?;
                let field = |name: &str| {
                    entries
                        .get(name)
                        .and_then(Value::as_number)
                        .ok_or_else(|| Error::Kernel(format!("search hit lacks '{}'", name)))
                };
                Ok(SearchHit {
                    id: field("id")?,
                    score: field("score")?,
                })
            })
            .collect()
    }
}

fn check_shapes(a: &[f64], b: &[f64]) -> Result<()> {
    if a.len() != b.len() || a.is_empty() {
        return Err(Error::ShapeMismatch(format!(
            "expected matching non-empty shapes, got {} and {}",
            a.len(),
            b.len()
        )));
    }
    Ok(())
}

fn numbers_into(values: &[f64]) -> Value {
    Value::List(values.iter().map(|n| Value::Number(*n)).collect())
}

fn numbers_from(value: Value) -> Result<Vec<f64>> {
    let items = value
        .as_list()
        .ok_or_else(|| Error::Kernel(format!("expected a numeric list, got {}", value.kind_name())))?;
    items
        .iter()
        .map(|item| {
            item.as_number()
                .ok_or_else(|| Error::Kernel(format!("expected a number, got {}", item.kind_name())))
        })
        .collect()
}
