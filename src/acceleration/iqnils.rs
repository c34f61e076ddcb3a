//! Interface quasi-Newton acceleration with least squares (IQN-ILS).

use std::collections::BTreeMap;

use anyhow::{bail, ensure, Result};
use nalgebra::{DMatrix, DVector};
use tracing::debug;

use super::{concat_old_values, concat_values, relax_all, scatter_values, Acceleration, Preconditioner};
use crate::context::CouplingContext;
use crate::scheme::data::{DataId, DataMap};

/// Quasi-Newton acceleration built from a multi-secant least-squares model.
///
/// Each iteration appends a residual difference to `V` and a value
/// difference to `W`; the coefficients `alpha = argmin |V alpha + r|`
/// (computed by QR on the preconditioned system) yield the next input
/// estimate `x + W alpha`. The very first iteration of a time step, before
/// any secant information exists, falls back to constant under-relaxation.
///
/// The model is rebuilt within each time step; secant columns are capped and
/// the oldest are dropped first.
pub struct IqnIlsAcceleration {
    initial_relaxation: f64,
    data_ids: Vec<DataId>,
    max_columns: usize,
    preconditioner: Box<dyn Preconditioner>,
    ctx: CouplingContext,
    iteration_counter: usize,
    residuals_prev: DVector<f64>,
    values_prev: DVector<f64>,
    /// Secant columns, newest first.
    matrix_v: Vec<DVector<f64>>,
    matrix_w: Vec<DVector<f64>>,
    design_specification: Option<DVector<f64>>,
}

impl IqnIlsAcceleration {
    pub fn new(
        initial_relaxation: f64,
        max_columns: usize,
        data_ids: Vec<DataId>,
        preconditioner: Box<dyn Preconditioner>,
        ctx: CouplingContext,
    ) -> Result<Self> {
        ensure!(
            initial_relaxation > 0.0 && initial_relaxation <= 1.0,
            "initial relaxation factor for quasi-Newton acceleration has to \
             be larger than zero and smaller or equal to one, got {initial_relaxation}"
        );
        ensure!(max_columns > 0, "quasi-Newton needs at least one secant column");
        ensure!(
            !data_ids.is_empty(),
            "quasi-Newton acceleration needs at least one data ID"
        );
        Ok(Self {
            initial_relaxation,
            data_ids,
            max_columns,
            preconditioner,
            ctx,
            iteration_counter: 0,
            residuals_prev: DVector::zeros(0),
            values_prev: DVector::zeros(0),
            matrix_v: Vec::new(),
            matrix_w: Vec::new(),
            design_specification: None,
        })
    }

    fn shifted_residual(&self, residual: &DVector<f64>) -> Result<DVector<f64>> {
        match &self.design_specification {
            None => Ok(residual.clone()),
            Some(q) => {
                ensure!(
                    q.len() == residual.len(),
                    "design specification length {} does not match the \
                     concatenated residual length {}",
                    q.len(),
                    residual.len()
                );
                Ok(residual - q)
            }
        }
    }
}

impl Acceleration for IqnIlsAcceleration {
    fn data_ids(&self) -> &[DataId] {
        &self.data_ids
    }

    fn initialize(&mut self, data: &mut DataMap) -> Result<()> {
        for id in &self.data_ids {
            ensure!(
                data.contains_key(id),
                "data with ID {id} is not contained in data given at initialization"
            );
        }
        for id in data.keys() {
            ensure!(
                self.data_ids.contains(id),
                "quasi-Newton acceleration requires every send datum to be \
                 accelerated, but data with ID {id} is not"
            );
        }
        ensure!(
            self.ctx.bus.size() == 1,
            "quasi-Newton acceleration supports single-rank participants only"
        );
        let sizes: Vec<usize> = self
            .data_ids
            .iter()
            .map(|id| data[id].values.len())
            .collect();
        let entries: usize = sizes.iter().sum();
        self.preconditioner.initialize(sizes)?;
        self.residuals_prev = DVector::zeros(entries);
        self.values_prev = DVector::zeros(entries);
        for entry in data.values_mut() {
            entry.ensure_history_columns(1);
        }
        Ok(())
    }

    fn perform_acceleration(&mut self, data: &mut DataMap) -> Result<()> {
        let values = concat_values(data, &self.data_ids)?;
        let old_values = concat_old_values(data, &self.data_ids)?;
        let residual = &values - &old_values;

        if self.iteration_counter > 0 {
            self.matrix_v.insert(0, &residual - &self.residuals_prev);
            self.matrix_w.insert(0, &values - &self.values_prev);
            let cap = self.max_columns.min(residual.len());
            self.matrix_v.truncate(cap);
            self.matrix_w.truncate(cap);
        }

        if self.matrix_v.is_empty() {
            debug!(omega = self.initial_relaxation, "no secant information, under-relaxing");
            relax_all(data, self.initial_relaxation);
        } else {
            self.preconditioner.update(false, &old_values, &residual)?;

            let mut v = DMatrix::from_columns(&self.matrix_v);
            self.preconditioner.apply_matrix(&mut v);
            let mut rhs = -self.shifted_residual(&residual)?;
            self.preconditioner.apply_vector(&mut rhs);

            let qr = v.qr();
            let qtb = qr.q().transpose() * rhs;
            let alpha = match qr.r().solve_upper_triangular(&qtb) {
                Some(alpha) if alpha.iter().all(|a| a.is_finite()) => alpha,
                _ => bail!(
                    "quasi-Newton system is singular: secant columns are \
                     linearly dependent"
                ),
            };
            self.preconditioner.new_qr_fulfilled();
            debug!(columns = self.matrix_v.len(), "computed quasi-Newton update");

            let mut next = values.clone();
            for (i, w_col) in self.matrix_w.iter().enumerate() {
                next += alpha[i] * w_col;
            }
            scatter_values(&next, data, &self.data_ids)?;
        }

        self.residuals_prev = residual;
        self.values_prev = values;
        self.iteration_counter += 1;
        Ok(())
    }

    fn iterations_converged(&mut self, data: &mut DataMap) -> Result<()> {
        let values = concat_values(data, &self.data_ids)?;
        let old_values = concat_old_values(data, &self.data_ids)?;
        let residual = &values - &old_values;
        self.preconditioner.update(true, &old_values, &residual)?;
        self.iteration_counter = 0;
        self.matrix_v.clear();
        self.matrix_w.clear();
        Ok(())
    }

    fn design_specification(&self, data: &DataMap) -> BTreeMap<DataId, DVector<f64>> {
        let mut specifications = BTreeMap::new();
        let mut offset = 0;
        for id in &self.data_ids {
            let len = data[id].values.len();
            let q = match &self.design_specification {
                Some(q) if q.len() >= offset + len => q.rows(offset, len).into_owned(),
                _ => DVector::zeros(len),
            };
            offset += len;
            specifications.insert(*id, q);
        }
        specifications
    }

    fn set_design_specification(&mut self, q: &DVector<f64>) -> Result<()> {
        self.design_specification = Some(q.clone());
        Ok(())
    }
}
