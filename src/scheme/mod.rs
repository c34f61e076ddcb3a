//! Coupling scheme state machines.
//!
//! # Architecture
//!
//! ```text
//! SchemeConfig ──► SerialCouplingScheme ──► SchemeCore ──► ParticipantLink
//!                        │                      │
//!                 advance() protocol     time/iterations/actions,
//!                 (explicit/implicit)    measures, history, dt
//! ```
//!
//! A scheme drives one participant through initialization, time stepping and
//! (for implicit coupling) the iteration loop, exchanging interface data
//! with the partner participant through a [`crate::exchange::ParticipantLink`].
//! The host solver talks to a scheme exclusively through the
//! [`CouplingScheme`] trait: report progress with `add_computed_time`, call
//! `advance`, and react to the required actions.

pub mod base;
pub mod data;
pub mod measures;
pub mod serial;

pub use data::{CouplingData, DataId, DataMap};
pub use measures::{
    AbsoluteConvergenceMeasure, ConvergenceMeasure, RelativeConvergenceMeasure,
    ResidualRelativeConvergenceMeasure,
};
pub use serial::SerialCouplingScheme;

use anyhow::Result;

/// Explicit schemes run one solver pass per time step; implicit schemes
/// iterate each step until the convergence measures pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouplingMode {
    Explicit,
    Implicit,
}

/// How the time step length is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimesteppingMethod {
    /// Both participants are configured with the same fixed length.
    FixedDt,
    /// The first participant computes the length and announces it on the
    /// wire; the second adopts it.
    FirstParticipantSetsDt,
}

/// Obligations the host solver has to fulfill between scheme calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Snapshot the solver state before the first iteration of an implicit
    /// time step.
    WriteIterationCheckpoint,
    /// Restore the snapshot before repeating a non-converged time step.
    ReadIterationCheckpoint,
    /// Fill the initial values of flagged send data before
    /// `initialize_data()`.
    WriteInitialData,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Action::WriteIterationCheckpoint => "write-iteration-checkpoint",
            Action::ReadIterationCheckpoint => "read-iteration-checkpoint",
            Action::WriteInitialData => "write-initial-data",
        };
        f.write_str(tag)
    }
}

/// Construction-time configuration of a coupling scheme.
#[derive(Debug, Clone)]
pub struct SchemeConfig {
    /// End of the coupled simulation; `None` leaves it open.
    pub max_time: Option<f64>,
    /// Maximum number of completed time steps; `None` leaves it open.
    pub max_timesteps: Option<usize>,
    /// Fixed time step length. Required for [`TimesteppingMethod::FixedDt`];
    /// ignored on the first participant otherwise.
    pub timestep_length: Option<f64>,
    /// Significant digits for time comparisons (1..=16).
    pub valid_digits: usize,
    /// The participant that computes each time step first.
    pub first_participant: String,
    /// The participant that computes second and judges convergence.
    pub second_participant: String,
    /// Which of the two this process belongs to.
    pub local_participant: String,
    pub dt_method: TimesteppingMethod,
    pub coupling_mode: CouplingMode,
    /// Iteration budget per time step; has to be 1 exactly for explicit
    /// coupling.
    pub max_iterations: usize,
    /// Polynomial order for time extrapolation of send data (0 disables).
    pub extrapolation_order: usize,
}

/// Per-participant driver of the coupled simulation.
pub trait CouplingScheme {
    /// Validates the configuration, performs the initial data handshake and
    /// enters the time loop.
    fn initialize(&mut self, start_time: f64, start_timestep: usize) -> Result<()>;

    /// Exchanges initial data. Required exactly when a datum was registered
    /// with its `initialize` flag set.
    fn initialize_data(&mut self) -> Result<()>;

    /// Reports solver progress within the current time step.
    fn add_computed_time(&mut self, dt: f64) -> Result<()>;

    /// Runs the coupling protocol at the current step boundary.
    fn advance(&mut self) -> Result<()>;

    /// Ends the coupled simulation and reports iteration statistics.
    fn finalize(&mut self) -> Result<()>;

    fn is_action_required(&self, action: Action) -> bool;

    fn mark_action_fulfilled(&mut self, action: Action) -> Result<()>;

    fn is_coupling_ongoing(&self) -> bool;

    fn is_coupling_timestep_complete(&self) -> bool;

    fn has_data_been_exchanged(&self) -> bool;

    fn time(&self) -> f64;

    fn timesteps(&self) -> usize;

    /// Largest time step the solver may take without overshooting the
    /// current coupling time step (or the end of the simulation).
    fn next_timestep_max_length(&self) -> f64;
}
