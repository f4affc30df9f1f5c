//! Reverse-mode autodiff over dense `Array2<f32>` values.
//!
//! A [`Tape`] records one forward pass. Parameters are read from a
//! [`ParamStore`] by value, so anything that outlives the tape (recurrent
//! memory, cached embeddings) is a plain array with no gradient history.
//! Build a fresh tape for every optimizer step.

use super::params::{Gradients, ParamId, ParamStore};
use super::sparse::SparseMatrix;
use ndarray::{s, Array2, Axis};
use std::sync::Arc;

/// Handle to a value recorded on a [`Tape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Var(usize);

#[derive(Debug)]
enum Op {
    Constant,
    Param(ParamId),
    ParamRows(ParamId, Vec<usize>, usize),
    MatMul(Var, Var),
    Add(Var, Var),
    AddRow(Var, Var),
    Sub(Var, Var),
    Mul(Var, Var),
    MulCol(Var, Var),
    Scale(Var, f32),
    Relu(Var),
    Sigmoid(Var),
    Tanh(Var),
    Sin(Var),
    Cos(Var),
    LogSigmoid(Var),
    Gather(Var, Vec<usize>),
    ScatterAdd(Var, Vec<usize>),
    SpMM(Arc<SparseMatrix>, Var),
    ConcatCols(Vec<Var>),
    ConcatRows(Vec<Var>),
    SliceCols(Var, usize, usize),
    RowSum(Var),
    RowMean(Var),
    Mean(Var),
    SegmentSoftmax(Var, Vec<usize>, usize),
}

#[derive(Debug)]
struct Node {
    value: Array2<f32>,
    op: Op,
}

#[derive(Debug, Default)]
pub struct Tape {
    nodes: Vec<Node>,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn value(&self, var: Var) -> &Array2<f32> {
        &self.nodes[var.0].value
    }

    /// Scalar value of a `[1, 1]` node.
    pub fn scalar(&self, var: Var) -> f32 {
        self.nodes[var.0].value[[0, 0]]
    }

    fn push(&mut self, value: Array2<f32>, op: Op) -> Var {
        self.nodes.push(Node { value, op });
        Var(self.nodes.len() - 1)
    }

    // ---- leaves ----

    pub fn constant(&mut self, value: Array2<f32>) -> Var {
        self.push(value, Op::Constant)
    }

    pub fn param(&mut self, store: &ParamStore, id: ParamId) -> Var {
        self.push(store.get(id).clone(), Op::Param(id))
    }

    /// Selected rows of a parameter table; gradients scatter back into
    /// those rows only.
    pub fn param_rows(&mut self, store: &ParamStore, id: ParamId, rows: &[usize]) -> Var {
        let table = store.get(id);
        let value = table.select(Axis(0), rows);
        self.push(value, Op::ParamRows(id, rows.to_vec(), table.nrows()))
    }

    // ---- arithmetic ----

    pub fn matmul(&mut self, a: Var, b: Var) -> Var {
        let value = self.value(a).dot(self.value(b));
        self.push(value, Op::MatMul(a, b))
    }

    pub fn add(&mut self, a: Var, b: Var) -> Var {
        let value = self.value(a) + self.value(b);
        self.push(value, Op::Add(a, b))
    }

    /// `a [n, d] + b [1, d]`
    pub fn add_row(&mut self, a: Var, b: Var) -> Var {
        let mut value = self.value(a).clone();
        value += &self.value(b).row(0);
        self.push(value, Op::AddRow(a, b))
    }

    pub fn sub(&mut self, a: Var, b: Var) -> Var {
        let value = self.value(a) - self.value(b);
        self.push(value, Op::Sub(a, b))
    }

    pub fn mul(&mut self, a: Var, b: Var) -> Var {
        let value = self.value(a) * self.value(b);
        self.push(value, Op::Mul(a, b))
    }

    /// `a [n, d] * c [n, 1]`, scaling each row.
    pub fn mul_col(&mut self, a: Var, c: Var) -> Var {
        let value = scale_rows(self.value(a), self.value(c));
        self.push(value, Op::MulCol(a, c))
    }

    pub fn scale(&mut self, a: Var, factor: f32) -> Var {
        let value = self.value(a) * factor;
        self.push(value, Op::Scale(a, factor))
    }

    // ---- nonlinearities ----

    pub fn relu(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(|x| x.max(0.0));
        self.push(value, Op::Relu(a))
    }

    pub fn sigmoid(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(sigmoid);
        self.push(value, Op::Sigmoid(a))
    }

    pub fn tanh(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(f32::tanh);
        self.push(value, Op::Tanh(a))
    }

    pub fn sin(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(f32::sin);
        self.push(value, Op::Sin(a))
    }

    pub fn cos(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(f32::cos);
        self.push(value, Op::Cos(a))
    }

    pub fn log_sigmoid(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(log_sigmoid);
        self.push(value, Op::LogSigmoid(a))
    }

    // ---- indexing ----

    pub fn gather(&mut self, a: Var, rows: &[usize]) -> Var {
        let value = self.value(a).select(Axis(0), rows);
        self.push(value, Op::Gather(a, rows.to_vec()))
    }

    /// Sums row `r` of `a` into output row `targets[r]`.
    pub fn scatter_add(&mut self, a: Var, targets: &[usize], num_rows: usize) -> Var {
        let src = self.value(a);
        let mut value = Array2::zeros((num_rows, src.ncols()));
        for (r, &t) in targets.iter().enumerate() {
            let mut dst = value.row_mut(t);
            dst += &src.row(r);
        }
        self.push(value, Op::ScatterAdd(a, targets.to_vec()))
    }

    pub fn spmm(&mut self, matrix: Arc<SparseMatrix>, a: Var) -> Var {
        let value = matrix.matmul(self.value(a));
        self.push(value, Op::SpMM(matrix, a))
    }

    pub fn concat_cols(&mut self, parts: &[Var]) -> Var {
        let rows = self.value(parts[0]).nrows();
        let width: usize = parts.iter().map(|p| self.value(*p).ncols()).sum();
        let mut value = Array2::zeros((rows, width));
        let mut offset = 0;
        for part in parts {
            let v = self.value(*part);
            value.slice_mut(s![.., offset..offset + v.ncols()]).assign(v);
            offset += v.ncols();
        }
        self.push(value, Op::ConcatCols(parts.to_vec()))
    }

    pub fn concat_rows(&mut self, parts: &[Var]) -> Var {
        let cols = self.value(parts[0]).ncols();
        let height: usize = parts.iter().map(|p| self.value(*p).nrows()).sum();
        let mut value = Array2::zeros((height, cols));
        let mut offset = 0;
        for part in parts {
            let v = self.value(*part);
            value.slice_mut(s![offset..offset + v.nrows(), ..]).assign(v);
            offset += v.nrows();
        }
        self.push(value, Op::ConcatRows(parts.to_vec()))
    }

    pub fn slice_cols(&mut self, a: Var, start: usize, end: usize) -> Var {
        let value = self.value(a).slice(s![.., start..end]).to_owned();
        self.push(value, Op::SliceCols(a, start, end))
    }

    // ---- reductions ----

    /// `[n, d] -> [n, 1]`
    pub fn row_sum(&mut self, a: Var) -> Var {
        let value = self.value(a).sum_axis(Axis(1)).insert_axis(Axis(1));
        self.push(value, Op::RowSum(a))
    }

    /// `[n, d] -> [n, 1]`
    pub fn row_mean(&mut self, a: Var) -> Var {
        let v = self.value(a);
        let width = v.ncols().max(1) as f32;
        let value = v.sum_axis(Axis(1)).insert_axis(Axis(1)) / width;
        self.push(value, Op::RowMean(a))
    }

    /// Mean of every element, as `[1, 1]`.
    pub fn mean(&mut self, a: Var) -> Var {
        let v = self.value(a);
        let count = v.len().max(1) as f32;
        let value = Array2::from_elem((1, 1), v.sum() / count);
        self.push(value, Op::Mean(a))
    }

    /// Column-wise softmax over the rows that share a segment id.
    pub fn segment_softmax(&mut self, a: Var, segments: &[usize], num_segments: usize) -> Var {
        let x = self.value(a);
        let cols = x.ncols();
        let mut max = Array2::from_elem((num_segments, cols), f32::NEG_INFINITY);
        for (r, &seg) in segments.iter().enumerate() {
            for j in 0..cols {
                max[[seg, j]] = max[[seg, j]].max(x[[r, j]]);
            }
        }
        let mut value = Array2::zeros(x.dim());
        let mut denom = Array2::<f32>::zeros((num_segments, cols));
        for (r, &seg) in segments.iter().enumerate() {
            for j in 0..cols {
                let e = (x[[r, j]] - max[[seg, j]]).exp();
                value[[r, j]] = e;
                denom[[seg, j]] += e;
            }
        }
        for (r, &seg) in segments.iter().enumerate() {
            for j in 0..cols {
                value[[r, j]] /= denom[[seg, j]];
            }
        }
        self.push(value, Op::SegmentSoftmax(a, segments.to_vec(), num_segments))
    }

    // ---- backward ----

    /// Backpropagates from a `[1, 1]` loss node and returns parameter
    /// gradients.
    pub fn backward(&self, loss: Var) -> Gradients {
        let mut grads: Vec<Option<Array2<f32>>> = (0..=loss.0).map(|_| None).collect();
        grads[loss.0] = Some(Array2::ones(self.nodes[loss.0].value.dim()));
        let mut out = Gradients::default();

        for idx in (0..=loss.0).rev() {
            let Some(g) = grads[idx].take() else {
                continue;
            };
            let node = &self.nodes[idx];
            match &node.op {
                Op::Constant => {}
                Op::Param(id) => out.accumulate(*id, g),
                Op::ParamRows(id, rows, total) => {
                    let mut full = Array2::zeros((*total, g.ncols()));
                    for (r, &target) in rows.iter().enumerate() {
                        let mut dst = full.row_mut(target);
                        dst += &g.row(r);
                    }
                    out.accumulate(*id, full);
                }
                Op::MatMul(a, b) => {
                    let ga = g.dot(&self.value(*b).t());
                    let gb = self.value(*a).t().dot(&g);
                    push_grad(&mut grads, *a, ga);
                    push_grad(&mut grads, *b, gb);
                }
                Op::Add(a, b) => {
                    push_grad(&mut grads, *b, g.clone());
                    push_grad(&mut grads, *a, g);
                }
                Op::AddRow(a, b) => {
                    push_grad(&mut grads, *b, g.sum_axis(Axis(0)).insert_axis(Axis(0)));
                    push_grad(&mut grads, *a, g);
                }
                Op::Sub(a, b) => {
                    push_grad(&mut grads, *b, -&g);
                    push_grad(&mut grads, *a, g);
                }
                Op::Mul(a, b) => {
                    push_grad(&mut grads, *a, &g * self.value(*b));
                    push_grad(&mut grads, *b, &g * self.value(*a));
                }
                Op::MulCol(a, c) => {
                    let gc = (&g * self.value(*a)).sum_axis(Axis(1)).insert_axis(Axis(1));
                    push_grad(&mut grads, *a, scale_rows(&g, self.value(*c)));
                    push_grad(&mut grads, *c, gc);
                }
                Op::Scale(a, factor) => push_grad(&mut grads, *a, g * *factor),
                Op::Relu(a) => {
                    let mask = self.value(*a).mapv(|x| if x > 0.0 { 1.0 } else { 0.0 });
                    push_grad(&mut grads, *a, g * mask);
                }
                Op::Sigmoid(a) => {
                    let d = node.value.mapv(|y| y * (1.0 - y));
                    push_grad(&mut grads, *a, g * d);
                }
                Op::Tanh(a) => {
                    let d = node.value.mapv(|y| 1.0 - y * y);
                    push_grad(&mut grads, *a, g * d);
                }
                Op::Sin(a) => {
                    let d = self.value(*a).mapv(f32::cos);
                    push_grad(&mut grads, *a, g * d);
                }
                Op::Cos(a) => {
                    let d = self.value(*a).mapv(|x| -x.sin());
                    push_grad(&mut grads, *a, g * d);
                }
                Op::LogSigmoid(a) => {
                    let d = self.value(*a).mapv(|x| 1.0 - sigmoid(x));
                    push_grad(&mut grads, *a, g * d);
                }
                Op::Gather(a, rows) => {
                    let mut ga = Array2::zeros(self.value(*a).dim());
                    for (r, &src) in rows.iter().enumerate() {
                        let mut dst = ga.row_mut(src);
                        dst += &g.row(r);
                    }
                    push_grad(&mut grads, *a, ga);
                }
                Op::ScatterAdd(a, targets) => {
                    let ga = g.select(Axis(0), targets);
                    push_grad(&mut grads, *a, ga);
                }
                Op::SpMM(matrix, a) => {
                    push_grad(&mut grads, *a, matrix.transpose_matmul(&g));
                }
                Op::ConcatCols(parts) => {
                    let mut offset = 0;
                    for part in parts {
                        let width = self.value(*part).ncols();
                        let slice = g.slice(s![.., offset..offset + width]).to_owned();
                        push_grad(&mut grads, *part, slice);
                        offset += width;
                    }
                }
                Op::ConcatRows(parts) => {
                    let mut offset = 0;
                    for part in parts {
                        let height = self.value(*part).nrows();
                        let slice = g.slice(s![offset..offset + height, ..]).to_owned();
                        push_grad(&mut grads, *part, slice);
                        offset += height;
                    }
                }
                Op::SliceCols(a, start, end) => {
                    let mut ga = Array2::zeros(self.value(*a).dim());
                    ga.slice_mut(s![.., *start..*end]).assign(&g);
                    push_grad(&mut grads, *a, ga);
                }
                Op::RowSum(a) => {
                    let ga = broadcast_col(&g, self.value(*a).ncols());
                    push_grad(&mut grads, *a, ga);
                }
                Op::RowMean(a) => {
                    let width = self.value(*a).ncols();
                    let ga = broadcast_col(&g, width) / width.max(1) as f32;
                    push_grad(&mut grads, *a, ga);
                }
                Op::Mean(a) => {
                    let v = self.value(*a);
                    let ga = Array2::from_elem(v.dim(), g[[0, 0]] / v.len().max(1) as f32);
                    push_grad(&mut grads, *a, ga);
                }
                Op::SegmentSoftmax(a, segments, num_segments) => {
                    let y = &node.value;
                    let cols = y.ncols();
                    let mut dot = Array2::<f32>::zeros((*num_segments, cols));
                    for (r, &seg) in segments.iter().enumerate() {
                        for j in 0..cols {
                            dot[[seg, j]] += g[[r, j]] * y[[r, j]];
                        }
                    }
                    let mut ga = Array2::zeros(y.dim());
                    for (r, &seg) in segments.iter().enumerate() {
                        for j in 0..cols {
                            ga[[r, j]] = y[[r, j]] * (g[[r, j]] - dot[[seg, j]]);
                        }
                    }
                    push_grad(&mut grads, *a, ga);
                }
            }
        }

        out
    }
}

fn push_grad(grads: &mut [Option<Array2<f32>>], var: Var, delta: Array2<f32>) {
    match grads[var.0].as_mut() {
        Some(existing) => *existing += &delta,
        None => grads[var.0] = Some(delta),
    }
}

fn scale_rows(a: &Array2<f32>, c: &Array2<f32>) -> Array2<f32> {
    let mut out = a.clone();
    for (mut row, factor) in out.rows_mut().into_iter().zip(c.column(0)) {
        row *= *factor;
    }
    out
}

fn broadcast_col(g: &Array2<f32>, width: usize) -> Array2<f32> {
    let mut out = Array2::zeros((g.nrows(), width));
    for (mut row, value) in out.rows_mut().into_iter().zip(g.column(0)) {
        row.fill(*value);
    }
    out
}

pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

pub fn log_sigmoid(x: f32) -> f32 {
    x.min(0.0) - (-x.abs()).exp().ln_1p()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// Compares tape gradients for `p` against central differences.
    fn check_gradients<F>(init: Array2<f32>, build: F)
    where
        F: Fn(&mut Tape, Var) -> Var,
    {
        let mut store = ParamStore::default();
        let id = store.add("p", init.clone());

        let mut tape = Tape::new();
        let p = tape.param(&store, id);
        let loss = build(&mut tape, p);
        let grads = tape.backward(loss);
        let analytic = grads.get(id).cloned().unwrap_or_else(|| Array2::zeros(init.dim()));

        let eps = 1e-2_f32;
        for r in 0..init.nrows() {
            for c in 0..init.ncols() {
                let mut plus = init.clone();
                plus[[r, c]] += eps;
                let mut minus = init.clone();
                minus[[r, c]] -= eps;

                let mut t = Tape::new();
                let v = t.constant(plus);
                let lp = build(&mut t, v);
                let fp = t.scalar(lp);

                let mut t = Tape::new();
                let v = t.constant(minus);
                let lm = build(&mut t, v);
                let fm = t.scalar(lm);

                let numeric = (fp - fm) / (2.0 * eps);
                let diff = (numeric - analytic[[r, c]]).abs();
                assert!(
                    diff < 1e-2 * (1.0 + numeric.abs()),
                    "grad mismatch at ({r},{c}): numeric {numeric}, analytic {}",
                    analytic[[r, c]]
                );
            }
        }
    }

    fn sample() -> Array2<f32> {
        array![[0.3, -0.7, 0.5], [1.1, 0.4, -0.9]]
    }

    #[test]
    fn test_matmul_and_activations_gradients() {
        check_gradients(sample(), |t, p| {
            let w = t.constant(array![[0.2, -0.1], [0.4, 0.3], [-0.5, 0.6]]);
            let h = t.matmul(p, w);
            let s = t.sigmoid(h);
            let th = t.tanh(s);
            t.mean(th)
        });
    }

    #[test]
    fn test_log_sigmoid_and_row_ops_gradients() {
        check_gradients(sample(), |t, p| {
            let sum = t.row_sum(p);
            let ls = t.log_sigmoid(sum);
            let scaled = t.mul_col(p, ls);
            let m = t.row_mean(scaled);
            t.mean(m)
        });
    }

    #[test]
    fn test_gather_scatter_concat_gradients() {
        check_gradients(sample(), |t, p| {
            let g = t.gather(p, &[1, 0, 1]);
            let sc = t.scatter_add(g, &[0, 2, 0], 3);
            let left = t.slice_cols(sc, 0, 2);
            let right = t.slice_cols(sc, 1, 3);
            let sin = t.sin(left);
            let cos = t.cos(right);
            let joined = t.concat_cols(&[sin, cos]);
            let stacked = t.concat_rows(&[joined, joined]);
            let prod = t.mul(stacked, stacked);
            t.mean(prod)
        });
    }

    #[test]
    fn test_segment_softmax_gradients() {
        check_gradients(sample(), |t, p| {
            let rows = t.gather(p, &[0, 1, 0, 1]);
            let soft = t.segment_softmax(rows, &[0, 0, 1, 1], 2);
            let w = t.constant(array![[1.0, 2.0, 3.0], [-1.0, 0.5, 2.0], [0.3, 0.3, 0.3], [2.0, -2.0, 1.0]]);
            let weighted = t.mul(soft, w);
            t.mean(weighted)
        });
    }

    #[test]
    fn test_segment_softmax_normalizes_per_segment() {
        let mut t = Tape::new();
        let x = t.constant(array![[1.0], [2.0], [3.0], [0.5]]);
        let y = t.segment_softmax(x, &[0, 0, 1, 1], 2);
        let v = t.value(y);
        assert!((v[[0, 0]] + v[[1, 0]] - 1.0).abs() < 1e-5);
        assert!((v[[2, 0]] + v[[3, 0]] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_sparse_spmm_gradients() {
        let matrix = Arc::new(SparseMatrix::new(2, 2, vec![(0, 1, 0.5), (1, 0, 2.0), (1, 1, 1.0)]));
        check_gradients(sample(), move |t, p| {
            let out = t.spmm(matrix.clone(), p);
            let relu = t.relu(out);
            let add = t.add_row(relu, p);
            let r = t.gather(add, &[0, 0]);
            let sub = t.sub(add, add);
            let both = t.add(r, sub);
            t.mean(both)
        });
    }

    #[test]
    fn test_log_sigmoid_stable() {
        assert!((log_sigmoid(0.0) - (0.5_f32).ln()).abs() < 1e-6);
        assert!(log_sigmoid(-100.0).is_finite());
        assert!(log_sigmoid(100.0).abs() < 1e-6);
    }

    #[test]
    fn test_param_rows_scatter_back() {
        let mut store = ParamStore::default();
        let id = store.add("table", Array2::ones((4, 2)));
        let mut tape = Tape::new();
        let rows = tape.param_rows(&store, id, &[2, 2, 0]);
        let loss = tape.mean(rows);
        let grads = tape.backward(loss);
        let g = grads.get(id).cloned().unwrap_or_default();
        assert_eq!(g.dim(), (4, 2));
        assert!((g[[2, 0]] - 2.0 / 6.0).abs() < 1e-6);
        assert!((g[[0, 1]] - 1.0 / 6.0).abs() < 1e-6);
        assert_eq!(g[[1, 0]], 0.0);
    }
}
