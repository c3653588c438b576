// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use pema_core::PemaError;

/// Minimal dense row-major f64 matrix.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Result<Self, PemaError> {
        let len = checked_len(rows, cols)?;
        Ok(Self {
            rows,
            cols,
            data: vec![0.0; len],
        })
    }

    pub fn from_rows(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self, PemaError> {
        let expected = checked_len(rows, cols)?;
        if data.len() != expected {
            return Err(PemaError::invalid_input(format!(
                "matrix data length mismatch: got {}, expected {} ({rows}x{cols})",
                data.len(),
                expected
            )));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.cols + col] = value;
    }

    pub fn column(&self, col: usize) -> Vec<f64> {
        (0..self.rows).map(|row| self.get(row, col)).collect()
    }

    pub fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        for col in 0..self.cols {
            self.data.swap(a * self.cols + col, b * self.cols + col);
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        self.data.as_slice()
    }
}

fn checked_len(rows: usize, cols: usize) -> Result<usize, PemaError> {
    if rows == 0 || cols == 0 {
        return Err(PemaError::invalid_input(format!(
            "matrix dimensions must be >= 1; got {rows}x{cols}"
        )));
    }
    rows.checked_mul(cols)
        .ok_or_else(|| PemaError::resource_limit("matrix size overflows usize"))
}

#[cfg(test)]
mod tests {
    use super::Matrix;

    #[test]
    fn row_major_indexing() {
        let m = Matrix::from_rows(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .expect("2x3 matrix should build");
        assert_eq!(m.get(0, 2), 3.0);
        assert_eq!(m.get(1, 0), 4.0);
        assert_eq!(m.column(1), vec![2.0, 5.0]);
    }

    #[test]
    fn swap_rows_exchanges_contents() {
        let mut m =
            Matrix::from_rows(2, 2, vec![1.0, 2.0, 3.0, 4.0]).expect("2x2 matrix should build");
        m.swap_rows(0, 1);
        assert_eq!(m.as_slice(), &[3.0, 4.0, 1.0, 2.0]);
    }

    #[test]
    fn dimension_mismatch_rejected() {
        assert!(Matrix::from_rows(2, 2, vec![0.0; 3]).is_err());
        assert!(Matrix::zeros(0, 4).is_err());
    }
}
