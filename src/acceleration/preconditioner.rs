//! Preconditioning (scaling) of the quasi-Newton residual space.
//!
//! A preconditioner balances the sub-vectors of the concatenated residual
//! when the coupled fields live on different physical scales. `apply`
//! transforms physical values to balanced values, `revert` transforms back.
//! Weights are updated after every iteration; once the configured number of
//! non-constant time steps is exceeded, the weights freeze. Any weight
//! change invalidates a cached QR factorization.

use anyhow::{ensure, Result};
use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::context::CouplingContext;

/// Weight bookkeeping shared by all preconditioner variants.
pub struct PreconditionerState {
    weights: DVector<f64>,
    inv_weights: DVector<f64>,
    sub_vector_sizes: Vec<usize>,
    max_non_const_timesteps: Option<usize>,
    non_const_timesteps: usize,
    frozen: bool,
    require_new_qr: bool,
}

impl PreconditionerState {
    fn new(max_non_const_timesteps: Option<usize>) -> Self {
        Self {
            weights: DVector::zeros(0),
            inv_weights: DVector::zeros(0),
            sub_vector_sizes: Vec::new(),
            max_non_const_timesteps,
            non_const_timesteps: 0,
            frozen: false,
            require_new_qr: false,
        }
    }

    fn initialize(&mut self, sub_vector_sizes: Vec<usize>) {
        debug_assert!(self.weights.is_empty());
        let n: usize = sub_vector_sizes.iter().sum();
        self.sub_vector_sizes = sub_vector_sizes;
        self.weights = DVector::from_element(n, 1.0);
        self.inv_weights = DVector::from_element(n, 1.0);
    }

    fn set_sub_vector_weights(&mut self, per_sub_vector: &[f64]) {
        debug_assert_eq!(per_sub_vector.len(), self.sub_vector_sizes.len());
        let mut offset = 0;
        for (k, &size) in self.sub_vector_sizes.iter().enumerate() {
            for i in offset..offset + size {
                self.weights[i] = 1.0 / per_sub_vector[k];
                self.inv_weights[i] = per_sub_vector[k];
            }
            offset += size;
        }
        self.require_new_qr = true;
    }

    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }
}

/// Residual-space scaling applied to quasi-Newton systems.
pub trait Preconditioner: Send {
    fn state(&self) -> &PreconditionerState;

    fn state_mut(&mut self) -> &mut PreconditionerState;

    /// Variant-specific weight update.
    fn update_weights(
        &mut self,
        timestep_complete: bool,
        old_values: &DVector<f64>,
        residual: &DVector<f64>,
    ) -> Result<()>;

    /// Sizes the weights; `sub_vector_sizes` holds the length of each
    /// coupling-data segment of the concatenated residual.
    fn initialize(&mut self, sub_vector_sizes: Vec<usize>) -> Result<()> {
        self.state_mut().initialize(sub_vector_sizes);
        Ok(())
    }

    /// Updates the weights after an iteration. `timestep_complete` marks
    /// iterations that also completed a time step.
    fn update(
        &mut self,
        timestep_complete: bool,
        old_values: &DVector<f64>,
        residual: &DVector<f64>,
    ) -> Result<()> {
        if self.state().frozen {
            return Ok(());
        }
        if timestep_complete {
            let state = self.state_mut();
            state.non_const_timesteps += 1;
            if let Some(max) = state.max_non_const_timesteps {
                if state.non_const_timesteps >= max {
                    state.frozen = true;
                    debug!("preconditioner weights frozen");
                }
            }
        }
        self.update_weights(timestep_complete, old_values, residual)
    }

    /// Physical values to balanced values, vector version.
    fn apply_vector(&self, v: &mut DVector<f64>) {
        let weights = &self.state().weights;
        debug_assert_eq!(v.len(), weights.len());
        v.component_mul_assign(weights);
    }

    /// Balanced values back to physical values, vector version.
    fn revert_vector(&self, v: &mut DVector<f64>) {
        let inv = &self.state().inv_weights;
        debug_assert_eq!(v.len(), inv.len());
        v.component_mul_assign(inv);
    }

    /// Physical values to balanced values, row-scaling a matrix.
    fn apply_matrix(&self, m: &mut DMatrix<f64>) {
        let weights = &self.state().weights;
        debug_assert_eq!(m.nrows(), weights.len());
        for mut column in m.column_iter_mut() {
            column.component_mul_assign(weights);
        }
    }

    /// Balanced values back to physical values, row-scaling a matrix.
    fn revert_matrix(&self, m: &mut DMatrix<f64>) {
        let inv = &self.state().inv_weights;
        debug_assert_eq!(m.nrows(), inv.len());
        for mut column in m.column_iter_mut() {
            column.component_mul_assign(inv);
        }
    }

    /// True when a weight change invalidated the cached QR factorization.
    fn require_new_qr(&self) -> bool {
        self.state().require_new_qr
    }

    /// Acknowledges that the QR factorization has been recomputed.
    fn new_qr_fulfilled(&mut self) {
        self.state_mut().require_new_qr = false;
    }

    fn is_const(&self) -> bool {
        self.state().frozen
    }
}

/// Weights every sub-vector with the inverse norm of its previous time-step
/// values. Updated on time-step completion (and once at the very start).
pub struct ValuePreconditioner {
    state: PreconditionerState,
    first_timestep: bool,
    ctx: CouplingContext,
}

impl ValuePreconditioner {
    pub fn new(max_non_const_timesteps: Option<usize>, ctx: CouplingContext) -> Self {
        Self {
            state: PreconditionerState::new(max_non_const_timesteps),
            first_timestep: true,
            ctx,
        }
    }
}

impl Preconditioner for ValuePreconditioner {
    fn state(&self) -> &PreconditionerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PreconditionerState {
        &mut self.state
    }

    fn update_weights(
        &mut self,
        timestep_complete: bool,
        old_values: &DVector<f64>,
        _residual: &DVector<f64>,
    ) -> Result<()> {
        if !(timestep_complete || self.first_timestep) {
            return Ok(());
        }
        let mut norms = Vec::with_capacity(self.state.sub_vector_sizes.len());
        let mut offset = 0;
        for &size in &self.state.sub_vector_sizes {
            let part = old_values.rows(offset, size);
            let norm = self.ctx.bus.l2_norm(part.clone_owned().as_slice())?;
            ensure!(
                norm > 0.0,
                "value preconditioner requires non-zero previous values"
            );
            norms.push(norm);
            offset += size;
        }
        self.state.set_sub_vector_weights(&norms);
        self.first_timestep = false;
        Ok(())
    }
}

/// Weights every sub-vector with the inverse of its accumulated share of
/// the residual norm. Accumulation restarts on time-step completion.
pub struct ResidualSumPreconditioner {
    state: PreconditionerState,
    residual_sum: Vec<f64>,
    ctx: CouplingContext,
}

impl ResidualSumPreconditioner {
    pub fn new(max_non_const_timesteps: Option<usize>, ctx: CouplingContext) -> Self {
        Self {
            state: PreconditionerState::new(max_non_const_timesteps),
            residual_sum: Vec::new(),
            ctx,
        }
    }
}

impl Preconditioner for ResidualSumPreconditioner {
    fn state(&self) -> &PreconditionerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PreconditionerState {
        &mut self.state
    }

    fn initialize(&mut self, sub_vector_sizes: Vec<usize>) -> Result<()> {
        self.residual_sum = vec![0.0; sub_vector_sizes.len()];
        self.state.initialize(sub_vector_sizes);
        Ok(())
    }

    fn update_weights(
        &mut self,
        timestep_complete: bool,
        _old_values: &DVector<f64>,
        residual: &DVector<f64>,
    ) -> Result<()> {
        if timestep_complete {
            self.residual_sum.iter_mut().for_each(|s| *s = 0.0);
            return Ok(());
        }
        let mut norms = Vec::with_capacity(self.state.sub_vector_sizes.len());
        let mut sum = 0.0;
        let mut offset = 0;
        for &size in &self.state.sub_vector_sizes {
            let part = residual.rows(offset, size).clone_owned();
            let sq = self.ctx.bus.dot(part.as_slice(), part.as_slice())?;
            sum += sq;
            norms.push(sq.sqrt());
            offset += size;
        }
        let sum = sum.sqrt();
        if sum == 0.0 {
            // Fully converged residual; keep the current weights.
            return Ok(());
        }
        for (k, norm) in norms.iter().enumerate() {
            self.residual_sum[k] += norm / sum;
        }
        ensure!(
            self.residual_sum.iter().all(|s| *s > 0.0),
            "residual-sum preconditioner received a zero residual sub-vector"
        );
        let sums = self.residual_sum.clone();
        self.state.set_sub_vector_weights(&sums);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_value_preconditioner_scales_by_old_norm() {
        let mut p = ValuePreconditioner::new(None, CouplingContext::single_rank());
        p.initialize(vec![2, 1]).unwrap();

        let old = DVector::from_vec(vec![3.0, 4.0, 10.0]);
        let res = DVector::zeros(3);
        p.update(false, &old, &res).unwrap();

        // First sub-vector has norm 5, second norm 10.
        let mut v = DVector::from_vec(vec![5.0, 5.0, 10.0]);
        p.apply_vector(&mut v);
        assert_relative_eq!(v[0], 1.0);
        assert_relative_eq!(v[1], 1.0);
        assert_relative_eq!(v[2], 1.0);

        p.revert_vector(&mut v);
        assert_relative_eq!(v[0], 5.0);
        assert_relative_eq!(v[2], 10.0);
        assert!(p.require_new_qr());
    }

    #[test]
    fn test_value_preconditioner_updates_only_between_timesteps() {
        let mut p = ValuePreconditioner::new(None, CouplingContext::single_rank());
        p.initialize(vec![1]).unwrap();
        let res = DVector::zeros(1);

        p.update(false, &DVector::from_vec(vec![2.0]), &res).unwrap();
        let w0 = p.state().weights()[0];
        // Mid-step update with different values must not change weights.
        p.update(false, &DVector::from_vec(vec![8.0]), &res).unwrap();
        assert_relative_eq!(p.state().weights()[0], w0);
        // Completing the step re-enables the update.
        p.update(true, &DVector::from_vec(vec![8.0]), &res).unwrap();
        assert_relative_eq!(p.state().weights()[0], 1.0 / 8.0);
    }

    #[test]
    fn test_weights_freeze_after_max_timesteps() {
        let mut p = ValuePreconditioner::new(Some(1), CouplingContext::single_rank());
        p.initialize(vec![1]).unwrap();
        let res = DVector::zeros(1);

        p.update(true, &DVector::from_vec(vec![2.0]), &res).unwrap();
        assert!(p.is_const());
        let w = p.state().weights()[0];
        p.update(true, &DVector::from_vec(vec![100.0]), &res).unwrap();
        assert_relative_eq!(p.state().weights()[0], w);
    }

    #[test]
    fn test_residual_sum_balances_sub_vectors() {
        let mut p = ResidualSumPreconditioner::new(None, CouplingContext::single_rank());
        p.initialize(vec![1, 1]).unwrap();

        let old = DVector::zeros(2);
        let res = DVector::from_vec(vec![3.0, 4.0]);
        p.update(false, &old, &res).unwrap();

        // Shares are 3/5 and 4/5; weights are their inverses.
        assert_relative_eq!(p.state().weights()[0], 5.0 / 3.0);
        assert_relative_eq!(p.state().weights()[1], 5.0 / 4.0);

        // Completing the time step resets the accumulation; the next
        // mid-step update starts from the fresh residual shares alone.
        p.update(true, &old, &res).unwrap();
        p.update(false, &old, &DVector::from_vec(vec![2.0, 1.0])).unwrap();
        // The larger residual share gets the smaller weight.
        assert!(p.state().weights()[0] < p.state().weights()[1]);
    }

    #[test]
    fn test_matrix_row_scaling_matches_vector_scaling() {
        let mut p = ValuePreconditioner::new(None, CouplingContext::single_rank());
        p.initialize(vec![2]).unwrap();
        p.update(false, &DVector::from_vec(vec![0.0, 2.0]), &DVector::zeros(2))
            .unwrap();

        let mut m = DMatrix::from_vec(2, 1, vec![4.0, 4.0]);
        p.apply_matrix(&mut m);
        let mut v = DVector::from_vec(vec![4.0, 4.0]);
        p.apply_vector(&mut v);
        assert_relative_eq!(m[(0, 0)], v[0]);
        assert_relative_eq!(m[(1, 0)], v[1]);
    }
}
