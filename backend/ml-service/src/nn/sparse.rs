use ndarray::Array2;

/// Fixed sparse matrix in coordinate form, used for graph propagation.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrix {
    rows: usize,
    cols: usize,
    entries: Vec<(usize, usize, f32)>,
}

impl SparseMatrix {
    pub fn new(rows: usize, cols: usize, entries: Vec<(usize, usize, f32)>) -> Self {
        Self {
            rows,
            cols,
            entries,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn nnz(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[(usize, usize, f32)] {
        &self.entries
    }

    /// `self · x`
    pub fn matmul(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut out = Array2::zeros((self.rows, x.ncols()));
        for &(r, c, v) in &self.entries {
            let mut dst = out.row_mut(r);
            dst.scaled_add(v, &x.row(c));
        }
        out
    }

    /// `selfᵀ · g`
    pub fn transpose_matmul(&self, g: &Array2<f32>) -> Array2<f32> {
        let mut out = Array2::zeros((self.cols, g.ncols()));
        for &(r, c, v) in &self.entries {
            let mut dst = out.row_mut(c);
            dst.scaled_add(v, &g.row(r));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_matmul_matches_dense() {
        let sparse = SparseMatrix::new(2, 3, vec![(0, 0, 1.0), (0, 2, 2.0), (1, 1, -1.0)]);
        let dense = array![[1.0_f32, 0.0, 2.0], [0.0, -1.0, 0.0]];
        let x = array![[1.0_f32, 2.0], [3.0, 4.0], [5.0, 6.0]];

        assert_eq!(sparse.matmul(&x), dense.dot(&x));

        let g = array![[1.0_f32, 1.0], [2.0, 0.5]];
        assert_eq!(sparse.transpose_matmul(&g), dense.t().dot(&g));
    }
}
