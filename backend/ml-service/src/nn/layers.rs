use super::params::{ParamId, ParamStore};
use super::tape::{Tape, Var};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::Rng;

/// Uniform init in `±sqrt(6 / (rows + cols))`.
pub fn xavier_uniform(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f32> {
    let bound = (6.0 / (rows + cols).max(1) as f32).sqrt();
    uniform((rows, cols), bound, rng)
}

pub fn uniform(shape: (usize, usize), bound: f32, rng: &mut StdRng) -> Array2<f32> {
    if bound <= 0.0 {
        return Array2::zeros(shape);
    }
    Array2::from_shape_fn(shape, |_| rng.gen_range(-bound..bound))
}

/// Affine map `x W + b` with `W: [in, out]`.
#[derive(Debug, Clone, Copy)]
pub struct Linear {
    pub weight: ParamId,
    pub bias: Option<ParamId>,
    pub in_dim: usize,
    pub out_dim: usize,
}

impl Linear {
    pub fn new(
        store: &mut ParamStore,
        name: &str,
        in_dim: usize,
        out_dim: usize,
        rng: &mut StdRng,
    ) -> Self {
        let bound = 1.0 / (in_dim.max(1) as f32).sqrt();
        let weight = store.add(format!("{name}.weight"), uniform((in_dim, out_dim), bound, rng));
        let bias = store.add(format!("{name}.bias"), uniform((1, out_dim), bound, rng));
        Self {
            weight,
            bias: Some(bias),
            in_dim,
            out_dim,
        }
    }

    pub fn without_bias(
        store: &mut ParamStore,
        name: &str,
        in_dim: usize,
        out_dim: usize,
        rng: &mut StdRng,
    ) -> Self {
        let bound = 1.0 / (in_dim.max(1) as f32).sqrt();
        let weight = store.add(format!("{name}.weight"), uniform((in_dim, out_dim), bound, rng));
        Self {
            weight,
            bias: None,
            in_dim,
            out_dim,
        }
    }

    pub fn forward(&self, tape: &mut Tape, store: &ParamStore, x: Var) -> Var {
        let w = tape.param(store, self.weight);
        let out = tape.matmul(x, w);
        match self.bias {
            Some(bias) => {
                let b = tape.param(store, bias);
                tape.add_row(out, b)
            }
            None => out,
        }
    }
}

/// `Linear -> ReLU -> Linear`
#[derive(Debug, Clone, Copy)]
pub struct Mlp {
    pub hidden: Linear,
    pub output: Linear,
}

impl Mlp {
    pub fn new(
        store: &mut ParamStore,
        name: &str,
        in_dim: usize,
        hidden_dim: usize,
        out_dim: usize,
        rng: &mut StdRng,
    ) -> Self {
        Self {
            hidden: Linear::new(store, &format!("{name}.0"), in_dim, hidden_dim, rng),
            output: Linear::new(store, &format!("{name}.2"), hidden_dim, out_dim, rng),
        }
    }

    pub fn forward(&self, tape: &mut Tape, store: &ParamStore, x: Var) -> Var {
        let h = self.hidden.forward(tape, store, x);
        let h = tape.relu(h);
        self.output.forward(tape, store, h)
    }
}

/// Gated recurrent unit cell.
#[derive(Debug, Clone, Copy)]
pub struct GruCell {
    input: Linear,
    recurrent: Linear,
    hidden_dim: usize,
}

impl GruCell {
    pub fn new(
        store: &mut ParamStore,
        name: &str,
        input_dim: usize,
        hidden_dim: usize,
        rng: &mut StdRng,
    ) -> Self {
        Self {
            input: Linear::new(store, &format!("{name}.ih"), input_dim, 3 * hidden_dim, rng),
            recurrent: Linear::new(store, &format!("{name}.hh"), hidden_dim, 3 * hidden_dim, rng),
            hidden_dim,
        }
    }

    /// `x: [n, input_dim]`, `h: [n, hidden_dim]` -> next hidden state.
    pub fn forward(&self, tape: &mut Tape, store: &ParamStore, x: Var, h: Var) -> Var {
        let d = self.hidden_dim;
        let gi = self.input.forward(tape, store, x);
        let gh = self.recurrent.forward(tape, store, h);

        let gi_r = tape.slice_cols(gi, 0, d);
        let gi_z = tape.slice_cols(gi, d, 2 * d);
        let gi_n = tape.slice_cols(gi, 2 * d, 3 * d);
        let gh_r = tape.slice_cols(gh, 0, d);
        let gh_z = tape.slice_cols(gh, d, 2 * d);
        let gh_n = tape.slice_cols(gh, 2 * d, 3 * d);

        let r = tape.add(gi_r, gh_r);
        let r = tape.sigmoid(r);
        let z = tape.add(gi_z, gh_z);
        let z = tape.sigmoid(z);
        let gated = tape.mul(r, gh_n);
        let n = tape.add(gi_n, gated);
        let n = tape.tanh(n);

        // h' = (1 - z) * n + z * h = n + z * (h - n)
        let delta = tape.sub(h, n);
        let kept = tape.mul(z, delta);
        tape.add(n, kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_linear_shapes() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut store = ParamStore::default();
        let linear = Linear::new(&mut store, "proj", 4, 3, &mut rng);

        let mut tape = Tape::new();
        let x = tape.constant(Array2::ones((5, 4)));
        let y = linear.forward(&mut tape, &store, x);
        assert_eq!(tape.value(y).dim(), (5, 3));
        assert_eq!(store.name(linear.weight), "proj.weight");
    }

    #[test]
    fn test_gru_keeps_hidden_when_update_gate_saturates() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut store = ParamStore::default();
        let gru = GruCell::new(&mut store, "gru", 2, 3, &mut rng);

        // Push the update gate to 1 through its input bias
        if let Some(bias) = gru.input.bias {
            let b = store.get_mut(bias);
            for j in 3..6 {
                b[[0, j]] = 50.0;
            }
        }

        let mut tape = Tape::new();
        let x = tape.constant(Array2::ones((1, 2)));
        let h = tape.constant(Array2::from_elem((1, 3), 0.25));
        let next = gru.forward(&mut tape, &store, x, h);
        for v in tape.value(next).iter() {
            assert!((v - 0.25).abs() < 1e-4);
        }
    }

    #[test]
    fn test_xavier_bounds() {
        let mut rng = StdRng::seed_from_u64(9);
        let w = xavier_uniform(10, 20, &mut rng);
        let bound = (6.0_f32 / 30.0).sqrt();
        assert!(w.iter().all(|x| x.abs() <= bound));
        assert_eq!(xavier_uniform(0, 8, &mut rng).dim(), (0, 8));
    }
}
