//! Convergence measures for implicit coupling iterations.
//!
//! A measure compares the previous iterate against the current one and
//! decides convergence from a norm of the difference. An optional design
//! specification shifts the residual so users can drive it toward a
//! configured non-zero target. All norms are reduced across the ranks of
//! the participant.

use anyhow::{ensure, Result};
use nalgebra::DVector;

use crate::context::CouplingContext;

/// Norm-based convergence predicate over a pair of iterates.
pub trait ConvergenceMeasure: Send {
    /// Updates the measure with the residual `new - old - design_spec`.
    fn measure(
        &mut self,
        old_values: &DVector<f64>,
        new_values: &DVector<f64>,
        design_spec: Option<&DVector<f64>>,
    ) -> Result<()>;

    /// Outcome of the last [`Self::measure`] call.
    fn is_converged(&self) -> bool;

    /// Residual norm of the last [`Self::measure`] call.
    fn norm_residual(&self) -> f64;

    /// Starts a new measurement series (new time step).
    fn new_measurement_series(&mut self) {}

    /// Short description for logging.
    fn describe(&self) -> String;
}

fn residual(
    old_values: &DVector<f64>,
    new_values: &DVector<f64>,
    design_spec: Option<&DVector<f64>>,
) -> DVector<f64> {
    debug_assert_eq!(old_values.len(), new_values.len());
    let mut r = new_values - old_values;
    if let Some(q) = design_spec {
        debug_assert_eq!(q.len(), r.len());
        r -= q;
    }
    r
}

/// Converged when the residual norm drops below an absolute limit.
pub struct AbsoluteConvergenceMeasure {
    limit: f64,
    norm_diff: f64,
    converged: bool,
    ctx: CouplingContext,
}

impl AbsoluteConvergenceMeasure {
    pub fn new(limit: f64, ctx: CouplingContext) -> Result<Self> {
        ensure!(
            limit > 0.0,
            "absolute convergence limit has to be larger than zero, got {limit}"
        );
        Ok(Self {
            limit,
            norm_diff: f64::MAX,
            converged: false,
            ctx,
        })
    }
}

impl ConvergenceMeasure for AbsoluteConvergenceMeasure {
    fn measure(
        &mut self,
        old_values: &DVector<f64>,
        new_values: &DVector<f64>,
        design_spec: Option<&DVector<f64>>,
    ) -> Result<()> {
        let r = residual(old_values, new_values, design_spec);
        self.norm_diff = self.ctx.bus.l2_norm(r.as_slice())?;
        self.converged = self.norm_diff <= self.limit;
        Ok(())
    }

    fn is_converged(&self) -> bool {
        self.converged
    }

    fn norm_residual(&self) -> f64 {
        self.norm_diff
    }

    fn describe(&self) -> String {
        format!("absolute limit {:.3e}", self.limit)
    }
}

/// Converged when the residual norm drops below a fraction of the norm of
/// the current values.
pub struct RelativeConvergenceMeasure {
    limit: f64,
    norm_diff: f64,
    norm_new: f64,
    converged: bool,
    ctx: CouplingContext,
}

impl RelativeConvergenceMeasure {
    pub fn new(limit: f64, ctx: CouplingContext) -> Result<Self> {
        ensure!(
            limit > 0.0 && limit < 1.0,
            "relative convergence limit has to be in (0; 1), got {limit}"
        );
        Ok(Self {
            limit,
            norm_diff: f64::MAX,
            norm_new: 0.0,
            converged: false,
            ctx,
        })
    }
}

impl ConvergenceMeasure for RelativeConvergenceMeasure {
    fn measure(
        &mut self,
        old_values: &DVector<f64>,
        new_values: &DVector<f64>,
        design_spec: Option<&DVector<f64>>,
    ) -> Result<()> {
        let r = residual(old_values, new_values, design_spec);
        self.norm_diff = self.ctx.bus.l2_norm(r.as_slice())?;
        self.norm_new = self.ctx.bus.l2_norm(new_values.as_slice())?;
        self.converged = self.norm_diff <= self.norm_new * self.limit;
        Ok(())
    }

    fn is_converged(&self) -> bool {
        self.converged
    }

    fn norm_residual(&self) -> f64 {
        self.norm_diff
    }

    fn describe(&self) -> String {
        format!("relative limit {:.3e}", self.limit)
    }
}

/// Converged when the residual norm drops below a fraction of the first
/// residual norm of the current time step.
pub struct ResidualRelativeConvergenceMeasure {
    limit: f64,
    first_norm: Option<f64>,
    norm_diff: f64,
    converged: bool,
    ctx: CouplingContext,
}

impl ResidualRelativeConvergenceMeasure {
    pub fn new(limit: f64, ctx: CouplingContext) -> Result<Self> {
        ensure!(
            limit > 0.0 && limit < 1.0,
            "residual-relative convergence limit has to be in (0; 1), got {limit}"
        );
        Ok(Self {
            limit,
            first_norm: None,
            norm_diff: f64::MAX,
            converged: false,
            ctx,
        })
    }
}

impl ConvergenceMeasure for ResidualRelativeConvergenceMeasure {
    fn measure(
        &mut self,
        old_values: &DVector<f64>,
        new_values: &DVector<f64>,
        design_spec: Option<&DVector<f64>>,
    ) -> Result<()> {
        let r = residual(old_values, new_values, design_spec);
        self.norm_diff = self.ctx.bus.l2_norm(r.as_slice())?;
        let first = *self.first_norm.get_or_insert(self.norm_diff);
        self.converged = self.norm_diff <= first * self.limit;
        Ok(())
    }

    fn is_converged(&self) -> bool {
        self.converged
    }

    fn norm_residual(&self) -> f64 {
        self.norm_diff
    }

    fn new_measurement_series(&mut self) {
        self.first_norm = None;
    }

    fn describe(&self) -> String {
        format!("residual-relative limit {:.3e}", self.limit)
    }
}
