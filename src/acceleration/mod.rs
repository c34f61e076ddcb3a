//! Fixed-point acceleration of implicit coupling iterations.
//!
//! An acceleration operator takes the send data after a solver evaluation
//! and produces the next input estimate from the fixed-point residual
//! `values - old_values`. The operators hold no ownership of the coupling
//! data; the scheme passes its send set on every call.
//!
//! Available operators:
//! - [`ConstantRelaxation`]: fixed under-relaxation factor,
//! - [`AitkenAcceleration`]: dynamic under-relaxation from consecutive
//!   residuals,
//! - [`IqnIlsAcceleration`]: interface quasi-Newton with a least-squares
//!   multi-secant model.

pub mod aitken;
pub mod constant;
pub mod iqnils;
pub mod preconditioner;

pub use aitken::AitkenAcceleration;
pub use constant::ConstantRelaxation;
pub use iqnils::IqnIlsAcceleration;
pub use preconditioner::{
    Preconditioner, PreconditionerState, ResidualSumPreconditioner, ValuePreconditioner,
};

use std::collections::BTreeMap;

use anyhow::{ensure, Result};
use nalgebra::DVector;

use crate::scheme::data::{DataId, DataMap};

/// Fixed-point relaxation operator over the send data of a scheme.
pub trait Acceleration: Send {
    /// Data IDs whose concatenation forms the accelerated residual vector.
    fn data_ids(&self) -> &[DataId];

    /// Sizes internal state against the registered data. The history of
    /// every entry in `data` is extended to hold at least one column.
    fn initialize(&mut self, data: &mut DataMap) -> Result<()>;

    /// Computes the next input estimate from the current iterate, updating
    /// `values` of every entry in `data` in place.
    fn perform_acceleration(&mut self, data: &mut DataMap) -> Result<()>;

    /// Resets per-time-step state after the iterations of a step converged.
    fn iterations_converged(&mut self, data: &mut DataMap) -> Result<()>;

    /// Residual target per data ID, to be honored by the convergence
    /// measures. Zero unless an operator supports a non-trivial target.
    fn design_specification(&self, data: &DataMap) -> BTreeMap<DataId, DVector<f64>>;

    /// Installs a residual target. Operators that cannot drive the residual
    /// to a non-zero target reject any non-zero `q`.
    fn set_design_specification(&mut self, q: &DVector<f64>) -> Result<()>;
}

/// Concatenates `values` of the given IDs into one vector.
pub(crate) fn concat_values(data: &DataMap, ids: &[DataId]) -> Result<DVector<f64>> {
    let mut stacked = Vec::new();
    for id in ids {
        let entry = data
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("data with ID {id} is not registered"))?;
        stacked.extend_from_slice(entry.values.as_slice());
    }
    Ok(DVector::from_vec(stacked))
}

/// Concatenates the previous time-step values (history column 0) of the
/// given IDs into one vector.
pub(crate) fn concat_old_values(data: &DataMap, ids: &[DataId]) -> Result<DVector<f64>> {
    let mut stacked = Vec::new();
    for id in ids {
        let entry = data
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("data with ID {id} is not registered"))?;
        ensure!(
            entry.old_values.ncols() > 0,
            "data with ID {id} has no history column"
        );
        stacked.extend(entry.old_values.column(0).iter().copied());
    }
    Ok(DVector::from_vec(stacked))
}

/// Splits a concatenated vector back into per-ID segments and writes them
/// to `values`.
pub(crate) fn scatter_values(
    stacked: &DVector<f64>,
    data: &mut DataMap,
    ids: &[DataId],
) -> Result<()> {
    let mut offset = 0;
    for id in ids {
        let entry = data
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("data with ID {id} is not registered"))?;
        let len = entry.values.len();
        entry
            .values
            .copy_from(&stacked.rows(offset, len).into_owned());
        offset += len;
    }
    ensure!(
        offset == stacked.len(),
        "concatenated vector length {} does not match registered data ({offset})",
        stacked.len()
    );
    Ok(())
}

/// Relaxes every entry of `data` in place:
/// `values <- omega * values + (1 - omega) * old_values.col(0)`.
pub(crate) fn relax_all(data: &mut DataMap, omega: f64) {
    for entry in data.values_mut() {
        if entry.old_values.ncols() == 0 {
            continue;
        }
        let old = entry.old_values.column(0).into_owned();
        entry.values = omega * &entry.values + (1.0 - omega) * old;
    }
}
