use super::params::{Gradients, ParamStore};
use crate::error::{AppError, Result};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// First and second moment estimates, aligned with the [`ParamStore`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdamState {
    pub step: u64,
    pub m: Vec<Array2<f32>>,
    pub v: Vec<Array2<f32>>,
}

#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    max_grad_norm: Option<f32>,
    state: AdamState,
}

impl Adam {
    pub fn new(store: &ParamStore, lr: f32) -> Self {
        let zeros: Vec<Array2<f32>> = store
            .ids()
            .map(|id| Array2::zeros(store.get(id).dim()))
            .collect();
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            max_grad_norm: None,
            state: AdamState {
                step: 0,
                m: zeros.clone(),
                v: zeros,
            },
        }
    }

    pub fn with_grad_clip(mut self, max_norm: f32) -> Self {
        self.max_grad_norm = Some(max_norm);
        self
    }

    pub fn state(&self) -> &AdamState {
        &self.state
    }

    pub fn load_state(&mut self, state: AdamState) -> Result<()> {
        let aligned = state.m.len() == self.state.m.len()
            && state.v.len() == self.state.v.len()
            && state
                .m
                .iter()
                .zip(&self.state.m)
                .chain(state.v.iter().zip(&self.state.v))
                .all(|(a, b)| a.dim() == b.dim());
        if !aligned {
            return Err(AppError::ShapeMismatch(
                "optimizer state does not match parameters".to_string(),
            ));
        }
        self.state = state;
        Ok(())
    }

    /// Applies one update. Returns the gradient norm before clipping.
    pub fn step(&mut self, store: &mut ParamStore, mut grads: Gradients) -> f32 {
        let norm = match self.max_grad_norm {
            Some(max_norm) => grads.clip_global_norm(max_norm),
            None => grads.global_norm(),
        };

        self.state.step += 1;
        let t = self.state.step as i32;
        let bias1 = 1.0 - self.beta1.powi(t);
        let bias2 = 1.0 - self.beta2.powi(t);
        let (lr, beta1, beta2, eps) = (self.lr, self.beta1, self.beta2, self.eps);

        for (id, grad) in grads.iter() {
            let i = id.index();
            Zip::from(store.get_mut(*id))
                .and(&mut self.state.m[i])
                .and(&mut self.state.v[i])
                .and(grad)
                .for_each(|p, m, v, &g| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }

        norm
    }
}
