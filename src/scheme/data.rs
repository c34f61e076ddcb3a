//! Interface data exchanged between the participants.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};

use crate::mesh::MeshId;

pub type DataId = usize;

/// Coupling data registered with a scheme, ordered by data ID so that both
/// participants traverse their send and receive sets identically.
pub type DataMap = BTreeMap<DataId, CouplingData>;

/// Values of one interface field on this rank, plus the column history of
/// prior time-step values used for residuals and extrapolation.
#[derive(Debug, Clone)]
pub struct CouplingData {
    /// Current values, `dimension` entries per owned vertex.
    pub values: DVector<f64>,
    /// History matrix of shape `values.len() × k`. Column 0 holds the
    /// previous time step's end value, columns 1.. hold older steps.
    pub old_values: DMatrix<f64>,
    /// The field is nonzero at t = 0 and must be exchanged during the
    /// initialization handshake.
    pub initialize: bool,
    /// Entries per vertex (1 for scalar fields).
    pub dimension: usize,
    /// Mesh this field lives on; routes the transfers.
    pub mesh_id: MeshId,
}

impl CouplingData {
    pub fn new(values: DVector<f64>, dimension: usize, mesh_id: MeshId, initialize: bool) -> Self {
        Self {
            old_values: DMatrix::zeros(values.len(), 0),
            values,
            initialize,
            dimension,
            mesh_id,
        }
    }

    /// Grows the history to at least `columns` columns, zero-filled.
    pub fn ensure_history_columns(&mut self, columns: usize) {
        if self.old_values.ncols() < columns {
            let rows = self.values.len();
            self.old_values = self.old_values.clone().resize(rows, columns, 0.0);
        }
        debug_assert_eq!(self.old_values.nrows(), self.values.len());
    }

    /// Shifts the history one column to the right and stores the current
    /// values in column 0. The oldest column falls off.
    pub fn rotate_history(&mut self) {
        debug_assert_eq!(self.old_values.nrows(), self.values.len());
        let columns = self.old_values.ncols();
        for c in (1..columns).rev() {
            let previous = self.old_values.column(c - 1).into_owned();
            self.old_values.set_column(c, &previous);
        }
        if columns > 0 {
            let values = self.values.clone();
            self.old_values.set_column(0, &values);
        }
    }

    /// The previous time step's end value (column 0 of the history).
    pub fn previous_values(&self) -> DVector<f64> {
        debug_assert!(self.old_values.ncols() > 0);
        self.old_values.column(0).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_history_starts_empty() {
        let data = CouplingData::new(DVector::from_vec(vec![1.0, 2.0]), 1, 0, false);
        assert_eq!(data.old_values.ncols(), 0);
        assert_eq!(data.old_values.nrows(), 2);
    }

    #[test]
    fn test_ensure_history_columns_grows_once() {
        let mut data = CouplingData::new(DVector::from_vec(vec![1.0, 2.0]), 1, 0, false);
        data.ensure_history_columns(2);
        assert_eq!(data.old_values.ncols(), 2);
        data.old_values[(0, 0)] = 5.0;
        data.ensure_history_columns(1);
        // Does not shrink or clobber.
        assert_eq!(data.old_values.ncols(), 2);
        assert_eq!(data.old_values[(0, 0)], 5.0);
    }

    #[test]
    fn test_rotate_history_shifts_columns() {
        let mut data = CouplingData::new(DVector::from_vec(vec![1.0]), 1, 0, false);
        data.ensure_history_columns(3);
        data.values[0] = 10.0;
        data.rotate_history();
        data.values[0] = 20.0;
        data.rotate_history();
        assert_relative_eq!(data.old_values[(0, 0)], 20.0);
        assert_relative_eq!(data.old_values[(0, 1)], 10.0);
        assert_relative_eq!(data.old_values[(0, 2)], 0.0);
    }
}
