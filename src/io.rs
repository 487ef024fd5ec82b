//! Reading observation sequences and models, and writing decoded state sequences.
//!
//! Observation files are plain text with one time step per line. Values on a line are
//! separated by commas and/or whitespace; blank lines and lines starting with `#` are skipped.
//! Every line must hold the same number of values, which becomes $D$.
//!
//! ```text
//! # two-dimensional observations, T = 3
//! 0.1, -0.2
//! 3.8, 4.1
//! 2.0, -1.2
//! ```
use crate::error::{HmmError, Result};
use crate::ndarray_utils::array2_from_rows;
#[cfg(feature = "serde-1")]
use crate::HMM;
use ndarray::prelude::*;
use std::io::{BufRead, Write};

/// Parse a $T × D$ observation matrix. No observations gives a $0 × 0$ matrix, which decoding
/// rejects as empty.
pub fn read_observations<R: BufRead>(reader: R) -> Result<Array2<f64>> {
    let mut rows = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|field| !field.is_empty())
            .map(|field| {
                field.parse::<f64>().map_err(|e| {
                    HmmError::Parse(format!("line {}: {:?} is not a number: {}", i + 1, field, e))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        rows.push(row);
    }
    array2_from_rows(rows).map_err(|e| HmmError::Parse(format!("observation matrix {}", e)))
}

/// Write one state per line.
pub fn write_states<W: Write>(mut writer: W, states: ArrayView1<usize>) -> Result<()> {
    for state in states {
        writeln!(writer, "{}", state)?;
    }
    writer.flush()?;
    Ok(())
}

/// Load a model from JSON, in the format produced by serializing an [`HMM`](../struct.HMM.html).
///
/// ```json
/// {
///   "initial": [0.6, 0.4],
///   "transition": [[0.7, 0.3], [0.4, 0.6]],
///   "emission": {
///     "gaussian": [
///       {"mean": [0.0], "covariance": [[1.0]]},
///       {"mean": [3.0], "covariance": [[1.0]]}
///     ]
///   }
/// }
/// ```
///
/// An invalid model is a parse error that describes what is wrong with it.
#[cfg(feature = "serde-1")]
pub fn read_model<R: std::io::Read>(reader: R) -> Result<HMM> {
    serde_json::from_reader(reader).map_err(|e| HmmError::Parse(format!("model: {}", e)))
}
