//! Flat `f64` encoding of accumulator states.
//!
//! Hosts that ship states across process boundaries see a single opaque array
//! of doubles. Layout:
//!
//! - 0: number of rows folded so far
//! - 1: width (number of independent variables)
//! - then the scalars, vectors and matrices of the state in declaration order
//!
//! Every vector and matrix starts at an even offset so that it is 16-byte
//! aligned; a zero pad is inserted where needed. Matrices are stored row-major.
//! The identity state is the bare two-element header.
//!
//! The layout is an implementation detail. Only round trips through
//! [`PackedWriter`] and [`PackedReader`] are supported.

use crate::error::RegressionError;
use crate::guards::MAX_WIDTH;
use ndarray::{Array1, Array2};

const HEADER_LEN: usize = 2;

fn malformed(reason: impl Into<String>) -> RegressionError {
    RegressionError::IncompatibleState(format!("malformed external state: {}", reason.into()))
}

fn as_count(value: f64, what: &str) -> Result<u64, RegressionError> {
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value >= u64::MAX as f64 {
        return Err(malformed(format!("{what} {value} is not a non-negative integer")));
    }
    Ok(value as u64)
}

pub struct PackedWriter {
    buffer: Vec<f64>,
}

impl PackedWriter {
    pub fn new(row_count: u64, width: usize) -> Self {
        Self {
            buffer: vec![row_count as f64, width as f64],
        }
    }

    /// Encoding of a state that has not seen any rows.
    pub fn identity() -> Vec<f64> {
        vec![0.0; HEADER_LEN]
    }

    fn align(&mut self) {
        if self.buffer.len() % 2 == 1 {
            self.buffer.push(0.0);
        }
    }

    pub fn scalar(&mut self, value: f64) -> &mut Self {
        self.buffer.push(value);
        self
    }

    pub fn vector(&mut self, values: &Array1<f64>) -> &mut Self {
        self.align();
        self.buffer.extend(values.iter().copied());
        self
    }

    pub fn matrix(&mut self, values: &Array2<f64>) -> &mut Self {
        self.align();
        self.buffer.extend(values.iter().copied());
        self
    }

    pub fn finish(self) -> Vec<f64> {
        self.buffer
    }
}

/// Decoded header of a packed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedHeader {
    pub row_count: u64,
    pub width: usize,
}

pub struct PackedReader<'a> {
    data: &'a [f64],
    position: usize,
}

impl<'a> PackedReader<'a> {
    /// Parses the header.
    ///
    /// Returns `None` for the identity, which is accepted in any length as long
    /// as every entry is zero (a zero-filled buffer handed out by a host).
    pub fn open(data: &'a [f64]) -> Result<Option<(PackedHeader, Self)>, RegressionError> {
        if data.len() < HEADER_LEN {
            return Err(malformed(format!(
                "expected at least {HEADER_LEN} entries, found {}",
                data.len()
            )));
        }
        let row_count = as_count(data[0], "row count")?;
        if row_count == 0 {
            if data.iter().any(|&v| v != 0.0) {
                return Err(malformed("state without rows carries non-zero statistics"));
            }
            return Ok(None);
        }
        let width = as_count(data[1], "width")?;
        if width == 0 || width > MAX_WIDTH as u64 {
            return Err(malformed(format!(
                "width {width} is outside 1..={MAX_WIDTH}"
            )));
        }
        let header = PackedHeader {
            row_count,
            width: width as usize,
        };
        Ok(Some((
            header,
            Self {
                data,
                position: HEADER_LEN,
            },
        )))
    }

    fn take(&mut self, len: usize) -> Result<&'a [f64], RegressionError> {
        let end = self.position + len;
        if end > self.data.len() {
            return Err(malformed(format!(
                "truncated buffer: needed {end} entries, found {}",
                self.data.len()
            )));
        }
        let slice = &self.data[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn align(&mut self) -> Result<(), RegressionError> {
        if self.position % 2 == 1 {
            self.take(1)?;
        }
        Ok(())
    }

    pub fn scalar(&mut self) -> Result<f64, RegressionError> {
        Ok(self.take(1)?[0])
    }

    pub fn vector(&mut self, len: usize) -> Result<Array1<f64>, RegressionError> {
        self.align()?;
        Ok(Array1::from(self.take(len)?.to_vec()))
    }

    pub fn matrix(&mut self, dim: usize) -> Result<Array2<f64>, RegressionError> {
        self.align()?;
        let values = self.take(dim * dim)?.to_vec();
        Array2::from_shape_vec((dim, dim), values).map_err(|e| malformed(e.to_string()))
    }

    /// Ensures the whole buffer was consumed.
    pub fn finish(self) -> Result<(), RegressionError> {
        if self.position != self.data.len() {
            return Err(malformed(format!(
                "{} trailing entries",
                self.data.len() - self.position
            )));
        }
        Ok(())
    }
}
