//! Matrix shape descriptors with deferred (unknown) dimensions.

use serde::{Deserialize, Serialize};

/// One dimension of a matrix: known at compile time, or deferred until the
/// job has run and the reconciler has merged worker observations.
///
/// Unknown is only ever *replaced* by a known value, never the reverse; see
/// [`MatrixShape::resolve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dim {
    Known(u64),
    Unknown,
}

impl Dim {
    #[must_use]
    pub fn get(self) -> Option<u64> {
        match self {
            Dim::Known(n) => Some(n),
            Dim::Unknown => None,
        }
    }

    #[must_use]
    pub fn is_known(self) -> bool {
        matches!(self, Dim::Known(_))
    }
}

impl From<u64> for Dim {
    fn from(n: u64) -> Self {
        Dim::Known(n)
    }
}

/// Shape and layout of one block-partitioned matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatrixShape {
    pub rows: Dim,
    pub cols: Dim,
    /// Rows per block in the partitioned layout.
    pub block_rows: u32,
    /// Columns per block in the partitioned layout.
    pub block_cols: u32,
    /// Non-zero cell count, when known.
    pub nonzeros: Option<u64>,
}

impl MatrixShape {
    /// A fully known shape with the given block layout.
    #[must_use]
    pub fn known(rows: u64, cols: u64, block_rows: u32, block_cols: u32) -> Self {
        Self {
            rows: Dim::Known(rows),
            cols: Dim::Known(cols),
            block_rows,
            block_cols,
            nonzeros: None,
        }
    }

    /// A shape whose row and column counts are deferred to reconciliation.
    #[must_use]
    pub fn unknown(block_rows: u32, block_cols: u32) -> Self {
        Self {
            rows: Dim::Unknown,
            cols: Dim::Unknown,
            block_rows,
            block_cols,
            nonzeros: None,
        }
    }

    /// True if either dimension is still deferred.
    #[must_use]
    pub fn dims_unknown(&self) -> bool {
        !(self.rows.is_known() && self.cols.is_known())
    }

    /// Declared data volume in bytes (8 bytes per cell), or `None` when a
    /// dimension is unknown. Used by execution-mode selection.
    #[must_use]
    pub fn volume_bytes(&self) -> Option<u64> {
        let r = self.rows.get()?;
        let c = self.cols.get()?;
        Some(r.saturating_mul(c).saturating_mul(8))
    }

    /// Replace any unknown dimension with the given observed value. Known
    /// dimensions are left untouched, so a resolved shape never reverts.
    pub fn resolve(&mut self, rows: u64, cols: u64) {
        if !self.rows.is_known() {
            self.rows = Dim::Known(rows);
        }
        if !self.cols.is_known() {
            self.cols = Dim::Known(cols);
        }
    }
}
