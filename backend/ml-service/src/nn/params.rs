use crate::error::{AppError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(usize);

impl ParamId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Named trainable tensors. Registration order defines the ids, so a model
/// built twice with the same configuration yields the same layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamStore {
    names: Vec<String>,
    values: Vec<Array2<f32>>,
}

impl ParamStore {
    pub fn add(&mut self, name: impl Into<String>, value: Array2<f32>) -> ParamId {
        self.names.push(name.into());
        self.values.push(value);
        ParamId(self.values.len() - 1)
    }

    pub fn get(&self, id: ParamId) -> &Array2<f32> {
        &self.values[id.0]
    }

    pub fn get_mut(&mut self, id: ParamId) -> &mut Array2<f32> {
        &mut self.values[id.0]
    }

    pub fn name(&self, id: ParamId) -> &str {
        &self.names[id.0]
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ParamId> {
        (0..self.values.len()).map(ParamId)
    }

    pub fn num_scalars(&self) -> usize {
        self.values.iter().map(|v| v.len()).sum()
    }

    /// Replaces every value with the one from `other` after checking that
    /// names and shapes line up one-to-one. Nothing is written on error.
    pub fn load_from(&mut self, other: &ParamStore) -> Result<()> {
        self.check_compatible(other)?;
        self.values.clone_from(&other.values);
        Ok(())
    }

    pub fn check_compatible(&self, other: &ParamStore) -> Result<()> {
        if self.names.len() != other.names.len() {
            return Err(AppError::ShapeMismatch(format!(
                "expected {} tensors, found {}",
                self.names.len(),
                other.names.len()
            )));
        }
        for (i, name) in self.names.iter().enumerate() {
            if &other.names[i] != name {
                return Err(AppError::ShapeMismatch(format!(
                    "tensor {i}: expected '{name}', found '{}'",
                    other.names[i]
                )));
            }
            if self.values[i].dim() != other.values[i].dim() {
                return Err(AppError::ShapeMismatch(format!(
                    "tensor '{name}': expected {:?}, found {:?}",
                    self.values[i].dim(),
                    other.values[i].dim()
                )));
            }
        }
        Ok(())
    }
}

/// Parameter gradients from one backward pass.
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    grads: HashMap<ParamId, Array2<f32>>,
}

impl Gradients {
    pub fn accumulate(&mut self, id: ParamId, grad: Array2<f32>) {
        match self.grads.get_mut(&id) {
            Some(existing) => *existing += &grad,
            None => {
                self.grads.insert(id, grad);
            }
        }
    }

    pub fn get(&self, id: ParamId) -> Option<&Array2<f32>> {
        self.grads.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParamId, &Array2<f32>)> {
        self.grads.iter()
    }

    pub fn global_norm(&self) -> f32 {
        self.grads
            .values()
            .map(|g| g.iter().map(|x| x * x).sum::<f32>())
            .sum::<f32>()
            .sqrt()
    }

    /// Rescales so the global L2 norm is at most `max_norm`.
    pub fn clip_global_norm(&mut self, max_norm: f32) -> f32 {
        let norm = self.global_norm();
        if norm > max_norm {
            let factor = max_norm / (norm + 1e-6);
            for g in self.grads.values_mut() {
                g.mapv_inplace(|x| x * factor);
            }
        }
        norm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_checks_shapes() {
        let mut store = ParamStore::default();
        store.add("a", Array2::zeros((2, 3)));

        let mut wrong = ParamStore::default();
        wrong.add("a", Array2::ones((3, 3)));
        assert!(store.load_from(&wrong).is_err());
        assert_eq!(store.get(ParamId(0))[[0, 0]], 0.0);

        let mut renamed = ParamStore::default();
        renamed.add("b", Array2::ones((2, 3)));
        assert!(store.load_from(&renamed).is_err());

        let mut good = ParamStore::default();
        good.add("a", Array2::ones((2, 3)));
        assert!(store.load_from(&good).is_ok());
        assert_eq!(store.get(ParamId(0))[[1, 2]], 1.0);
    }

    #[test]
    fn test_clip_global_norm() {
        let mut grads = Gradients::default();
        grads.accumulate(ParamId(0), Array2::from_elem((1, 2), 3.0));
        grads.accumulate(ParamId(1), Array2::from_elem((1, 1), 4.0 * 2f32.sqrt()));
        // sqrt(9 + 9 + 32) = sqrt(50)
        let before = grads.clip_global_norm(1.0);
        assert!((before - 50f32.sqrt()).abs() < 1e-4);
        assert!((grads.global_norm() - 1.0).abs() < 1e-3);
    }
}
