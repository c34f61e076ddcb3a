//! Dynamic Aitken under-relaxation.

use std::collections::BTreeMap;

use anyhow::{bail, ensure, Result};
use nalgebra::DVector;
use tracing::debug;

use super::{concat_old_values, concat_values, relax_all, Acceleration};
use crate::context::CouplingContext;
use crate::scheme::data::{DataId, DataMap};

/// Under-relaxation with a factor adapted from consecutive residuals.
///
/// The first iteration of every time step relaxes with (at most) the
/// configured initial factor; later iterations use the secant update
/// `omega <- -omega * (r_prev . dr) / (dr . dr)` with `dr = r - r_prev`,
/// reduced across all ranks of the participant.
pub struct AitkenAcceleration {
    initial_relaxation: f64,
    data_ids: Vec<DataId>,
    aitken_factor: f64,
    iteration_counter: usize,
    /// Residual of the previous iteration; `f64::MAX` entries mean "no
    /// prior residual in this time step".
    residuals: DVector<f64>,
    design_specification: DVector<f64>,
    ctx: CouplingContext,
}

impl AitkenAcceleration {
    pub fn new(
        initial_relaxation: f64,
        data_ids: Vec<DataId>,
        ctx: CouplingContext,
    ) -> Result<Self> {
        ensure!(
            initial_relaxation > 0.0 && initial_relaxation <= 1.0,
            "initial relaxation factor for Aitken acceleration has to be \
             larger than zero and smaller or equal to one, got {initial_relaxation}"
        );
        ensure!(
            !data_ids.is_empty(),
            "Aitken acceleration needs at least one data ID"
        );
        Ok(Self {
            initial_relaxation,
            data_ids,
            aitken_factor: initial_relaxation,
            iteration_counter: 0,
            residuals: DVector::zeros(0),
            design_specification: DVector::zeros(0),
            ctx,
        })
    }

    /// The relaxation factor applied by the last
    /// [`Acceleration::perform_acceleration`] call.
    pub fn relaxation_factor(&self) -> f64 {
        self.aitken_factor
    }
}

impl Acceleration for AitkenAcceleration {
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
        let entries: usize = self
            .data_ids
            .iter()
            .map(|id| data[id].values.len())
            .sum();
        self.residuals = DVector::from_element(entries, f64::MAX);
        self.design_specification = DVector::zeros(entries);

        // Make sure every field has a history column for the relaxation.
        for entry in data.values_mut() {
            entry.ensure_history_columns(1);
        }
        Ok(())
    }

    fn perform_acceleration(&mut self, data: &mut DataMap) -> Result<()> {
        let values = concat_values(data, &self.data_ids)?;
        let old_values = concat_old_values(data, &self.data_ids)?;
        let residuals = &values - &old_values;
        let residual_deltas = &residuals - &self.residuals;

        if self.iteration_counter == 0 {
            self.aitken_factor = self.aitken_factor.signum()
                * self.initial_relaxation.min(self.aitken_factor.abs());
        } else {
            let nominator = self
                .ctx
                .bus
                .dot(self.residuals.as_slice(), residual_deltas.as_slice())?;
            let denominator = self
                .ctx
                .bus
                .dot(residual_deltas.as_slice(), residual_deltas.as_slice())?;
            if denominator == 0.0 {
                bail!(
                    "Aitken acceleration stagnated: the residual did not \
                     change between two iterations"
                );
            }
            self.aitken_factor = -self.aitken_factor * (nominator / denominator);
            ensure!(
                self.aitken_factor.is_finite(),
                "Aitken relaxation factor became non-finite"
            );
        }
        debug!(omega = self.aitken_factor, "Aitken factor");

        relax_all(data, self.aitken_factor);

        self.residuals = residuals;
        self.iteration_counter += 1;
        Ok(())
    }

    fn iterations_converged(&mut self, _data: &mut DataMap) -> Result<()> {
        self.iteration_counter = 0;
        self.residuals = DVector::from_element(self.residuals.len(), f64::MAX);
        Ok(())
    }

    fn design_specification(&self, data: &DataMap) -> BTreeMap<DataId, DVector<f64>> {
        let mut specifications = BTreeMap::new();
        let mut offset = 0;
        for id in &self.data_ids {
            let len = data[id].values.len();
            let q = self.design_specification.rows(offset, len).into_owned();
            offset += len;
            specifications.insert(*id, q);
        }
        specifications
    }

    fn set_design_specification(&mut self, q: &DVector<f64>) -> Result<()> {
        ensure!(
            q.iter().all(|v| *v == 0.0),
            "a non-zero design specification is not supported by Aitken \
             under-relaxation"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::data::CouplingData;
    use approx::assert_relative_eq;

    fn scalar_data(initial: f64) -> DataMap {
        let mut data = DataMap::new();
        data.insert(
            0,
            CouplingData::new(DVector::from_vec(vec![initial]), 1, 0, false),
        );
        data
    }

    fn aitken(initial_relaxation: f64) -> AitkenAcceleration {
        AitkenAcceleration::new(initial_relaxation, vec![0], CouplingContext::single_rank())
            .unwrap()
    }

    #[test]
    fn test_rejects_invalid_relaxation() {
        let ctx = CouplingContext::single_rank();
        assert!(AitkenAcceleration::new(0.0, vec![0], ctx.clone()).is_err());
        assert!(AitkenAcceleration::new(1.5, vec![0], ctx).is_err());
    }

    #[test]
    fn test_first_iteration_uses_initial_relaxation() {
        let mut acc = aitken(0.5);
        let mut data = scalar_data(0.0);
        acc.initialize(&mut data).unwrap();

        // Solver returned old + 2; relaxed value is old + omega * 2.
        data.get_mut(&0).unwrap().values[0] = 2.0;
        acc.perform_acceleration(&mut data).unwrap();
        assert_relative_eq!(acc.relaxation_factor(), 0.5);
        assert_relative_eq!(data[&0].values[0], 1.0);
    }

    #[test]
    fn test_stagnation_is_detected() {
        let mut acc = aitken(0.5);
        let mut data = scalar_data(0.0);
        acc.initialize(&mut data).unwrap();

        data.get_mut(&0).unwrap().values[0] = 2.0;
        acc.perform_acceleration(&mut data).unwrap();

        // The solver reproduces the same residual: r = 2 again.
        let old = data[&0].previous_values();
        data.get_mut(&0).unwrap().values[0] = old[0] + 2.0;
        let err = acc.perform_acceleration(&mut data).unwrap_err();
        assert!(err.to_string().contains("stagnated"));
    }

    #[test]
    fn test_contraction_converges() {
        // Fixed point of x -> 0.9 x is 0; residuals must decay.
        let mut acc = aitken(1.0);
        let mut data = scalar_data(8.0);
        acc.initialize(&mut data).unwrap();
        data.get_mut(&0).unwrap().rotate_history();

        let mut residual = f64::MAX;
        for _ in 0..20 {
            let old = data[&0].previous_values();
            data.get_mut(&0).unwrap().values[0] = 0.9 * old[0];
            residual = (data[&0].values[0] - old[0]).abs();
            if residual < 1e-10 {
                break;
            }
            acc.perform_acceleration(&mut data).unwrap();
            let relaxed = data[&0].values.clone();
            data.get_mut(&0).unwrap().old_values.set_column(0, &relaxed);
        }
        assert!(residual < 1e-10);
    }

    #[test]
    fn test_reset_restores_initial_behavior() {
        let mut acc = aitken(0.5);
        let mut data = scalar_data(0.0);
        acc.initialize(&mut data).unwrap();

        data.get_mut(&0).unwrap().values[0] = 2.0;
        acc.perform_acceleration(&mut data).unwrap();
        acc.iterations_converged(&mut data).unwrap();

        // Next step starts again from the bounded initial factor.
        data.get_mut(&0).unwrap().values[0] = 4.0;
        data.get_mut(&0).unwrap().old_values[(0, 0)] = 0.0;
        acc.perform_acceleration(&mut data).unwrap();
        assert!(acc.relaxation_factor().abs() <= 0.5);
    }

    #[test]
    fn test_design_specification_must_be_zero() {
        let mut acc = aitken(0.5);
        let ok = DVector::zeros(3);
        assert!(acc.set_design_specification(&ok).is_ok());
        let bad = DVector::from_vec(vec![0.0, 1.0, 0.0]);
        assert!(acc.set_design_specification(&bad).is_err());
    }
}
