//! Serial (staggered) coupling of two participants.

use anyhow::{ensure, Result};
use nalgebra::DVector;
use tracing::{debug, info};

use super::base::SchemeCore;
use super::data::DataId;
use super::measures::ConvergenceMeasure;
use super::{Action, CouplingMode, CouplingScheme, SchemeConfig};
use crate::acceleration::Acceleration;
use crate::context::CouplingContext;
use crate::exchange::ParticipantLink;
use crate::mesh::MeshId;

/// Staggered coupling scheme: per time step the first participant computes
/// and sends, then the second computes and answers. In implicit mode the
/// pair iterates — the second participant judges convergence, relaxes its
/// send data through the configured acceleration, and reports the verdict
/// back before the data that depends on it.
pub struct SerialCouplingScheme {
    core: SchemeCore,
    coupling_mode: CouplingMode,
}

impl SerialCouplingScheme {
    pub fn new(config: &SchemeConfig, link: ParticipantLink, ctx: CouplingContext) -> Result<Self> {
        if config.coupling_mode == CouplingMode::Explicit {
            ensure!(
                config.max_iterations == 1,
                "explicit coupling runs exactly one iteration per time step"
            );
        } else {
            ensure!(
                config.max_iterations >= 1,
                "implicit coupling needs an iteration budget of at least 1"
            );
        }
        Ok(Self {
            core: SchemeCore::new(config, link, ctx)?,
            coupling_mode: config.coupling_mode,
        })
    }

    // --- wiring, before initialize() -------------------------------------

    pub fn add_send_data(
        &mut self,
        id: DataId,
        mesh_id: MeshId,
        dimension: usize,
        values: DVector<f64>,
        initialize: bool,
    ) -> Result<()> {
        self.core
            .add_send_data(id, mesh_id, dimension, values, initialize)
    }

    pub fn add_receive_data(
        &mut self,
        id: DataId,
        mesh_id: MeshId,
        dimension: usize,
        values: DVector<f64>,
        initialize: bool,
    ) -> Result<()> {
        self.core
            .add_receive_data(id, mesh_id, dimension, values, initialize)
    }

    pub fn add_convergence_measure(
        &mut self,
        data_id: DataId,
        coarse: bool,
        measure: Box<dyn ConvergenceMeasure>,
    ) {
        self.core.add_convergence_measure(data_id, coarse, measure);
    }

    pub fn set_acceleration(&mut self, acceleration: Box<dyn Acceleration>) {
        self.core.acceleration = Some(acceleration);
    }

    // --- data access between scheme calls ---------------------------------

    /// Read access to a registered datum's values.
    pub fn values(&self, id: DataId) -> Result<&DVector<f64>> {
        match self.core.coupling_data(id) {
            Some(data) => Ok(&data.values),
            None => anyhow::bail!("data with ID {id} is not registered"),
        }
    }

    /// Write access to a registered datum's values, used by the host solver
    /// between scheme calls.
    pub fn values_mut(&mut self, id: DataId) -> Result<&mut DVector<f64>> {
        match self.core.coupling_data_mut(id) {
            Some(data) => Ok(&mut data.values),
            None => anyhow::bail!("data with ID {id} is not registered"),
        }
    }

    /// The previous time step's end value of a registered datum.
    pub fn previous_values(&self, id: DataId) -> Result<DVector<f64>> {
        match self.core.coupling_data(id) {
            Some(data) if data.old_values.ncols() > 0 => Ok(data.previous_values()),
            Some(_) => anyhow::bail!("data with ID {id} has no history column"),
            None => anyhow::bail!("data with ID {id} is not registered"),
        }
    }

    pub fn link_mut(&mut self) -> &mut ParticipantLink {
        &mut self.core.link
    }

    // --- protocol ---------------------------------------------------------

    fn advance_explicit(&mut self) -> Result<()> {
        if !self.core.remainder_is_zero() {
            return Ok(());
        }
        self.core.timestep_completed();
        debug!("sending data");
        self.core.send_dt()?;
        self.core.send_all_data()?;
        if self.core.is_coupling_ongoing() || self.core.does_first_step {
            debug!("receiving data");
            self.core.receive_and_set_dt()?;
            self.core.receive_all_data()?;
            self.core.data_exchanged = true;
        }
        self.core.computed_timestep_part = 0.0;
        Ok(())
    }

    fn advance_implicit(&mut self) -> Result<()> {
        if !self.core.remainder_is_zero() {
            // Subcycling within the coupling time step continues.
            return Ok(());
        }
        debug!("computed full length of the coupling time step");
        let convergence = if self.core.does_first_step {
            self.core.send_dt()?;
            self.core.send_all_data()?;
            let convergence = self.core.link.receive_bool()?;
            self.core.coarse_optimization_active = self.core.link.receive_bool()?;
            if convergence {
                self.core.timestep_completed();
            }
            self.core.receive_all_data()?;
            self.core.data_exchanged = true;
            convergence
        } else {
            self.advance_second_participant()?
        };

        if convergence {
            debug!("convergence achieved");
        } else {
            debug!("no convergence achieved");
            self.core.require_action(Action::ReadIterationCheckpoint);
        }
        self.core.update_time_and_iterations(convergence);
        self.core.computed_timestep_part = 0.0;
        Ok(())
    }

    /// Convergence judgment, acceleration and the answer protocol of the
    /// second participant.
    fn advance_second_participant(&mut self) -> Result<bool> {
        let core = &mut self.core;

        let design_specs = match core.acceleration.as_ref() {
            Some(acceleration) => acceleration.design_specification(&core.send_data),
            None => Default::default(),
        };

        let mut convergence;
        let mut do_only_solver_evaluation = false;
        if core.coarse_optimization_active {
            debug!("measuring convergence of the coarse model optimization");
            let mut coarse_converged = core.measure_convergence(&design_specs, true)?;
            if core.max_iterations_reached() {
                coarse_converged = true;
            }
            convergence = false;
            if coarse_converged {
                // The coarse loop is done; the fine model is evaluated once
                // for the new input without acceleration.
                core.coarse_optimization_active = false;
                do_only_solver_evaluation = true;
            }
        } else {
            debug!("measuring convergence");
            convergence = core.measure_convergence(&design_specs, false)?;
            if core.max_iterations_reached() {
                debug!(
                    iterations = core.iterations,
                    "iteration budget exhausted, forcing convergence"
                );
                convergence = true;
            }
        }

        if !do_only_solver_evaluation {
            if convergence {
                if let Some(acceleration) = core.acceleration.as_mut() {
                    acceleration.iterations_converged(&mut core.send_data)?;
                }
                core.new_convergence_measurements();
                core.timestep_completed();
            } else if let Some(acceleration) = core.acceleration.as_mut() {
                acceleration.perform_acceleration(&mut core.send_data)?;
            }

            if convergence && core.extrapolation_order > 0 {
                core.extrapolate_data()?;
            } else {
                // Keep the current iterate as the reference for the next
                // residual and for the checkpoint restart.
                core.store_current_values();
            }
        }

        core.link.send_bool(convergence)?;
        core.link.send_bool(core.coarse_optimization_active)?;
        core.send_all_data()?;

        // The last iteration of the last time step needs no new input.
        if core.is_coupling_ongoing() || !convergence {
            core.receive_and_set_dt()?;
            core.receive_all_data()?;
            core.data_exchanged = true;
        }
        Ok(convergence)
    }
}

impl CouplingScheme for SerialCouplingScheme {
    fn initialize(&mut self, start_time: f64, start_timestep: usize) -> Result<()> {
        ensure!(!self.core.initialized, "initialize() may only be called once");
        ensure!(
            start_time >= 0.0,
            "start time has to be non-negative, got {start_time}"
        );
        self.core.time = start_time;
        self.core.timesteps = start_timestep;

        if self.coupling_mode == CouplingMode::Implicit {
            ensure!(
                !self.core.send_data.is_empty(),
                "no send data configured; use an explicit scheme for one-way coupling"
            );
            if !self.core.does_first_step {
                if !self.core.measures.is_empty() {
                    self.core.setup_data_matrices();
                }
                let core = &mut self.core;
                if let Some(acceleration) = core.acceleration.as_mut() {
                    acceleration.initialize(&mut core.send_data)?;
                }
            } else if let Some(acceleration) = self.core.acceleration.as_ref() {
                for id in acceleration.data_ids() {
                    ensure!(
                        !self.core.send_data.contains_key(id),
                        "for serial coupling, acceleration has to operate on \
                         data of the second participant only"
                    );
                }
            }
            self.core.require_action(Action::WriteIterationCheckpoint);
        }

        if self.core.send_data.values().any(|d| d.initialize) {
            ensure!(
                !self.core.does_first_step,
                "only the second participant can initialize data to be sent"
            );
            debug!("data to be written will be initialized");
            self.core.has_to_send_init_data = true;
        }
        if self.core.receive_data.values().any(|d| d.initialize) {
            ensure!(
                self.core.does_first_step,
                "only the first participant can receive initial data"
            );
            debug!("data to be received will be initialized");
            self.core.has_to_receive_init_data = true;
        }

        // When the second participant initializes data, its first receive
        // moves from here to initialize_data().
        if !self.core.does_first_step
            && !self.core.has_to_send_init_data
            && self.core.is_coupling_ongoing()
        {
            debug!("receiving initial data");
            self.core.receive_and_set_dt()?;
            self.core.receive_all_data()?;
            self.core.data_exchanged = true;
        }

        if self.core.has_to_send_init_data {
            self.core.require_action(Action::WriteInitialData);
        }

        self.core.initialized = true;
        Ok(())
    }

    fn initialize_data(&mut self) -> Result<()> {
        ensure!(
            self.core.initialized,
            "initialize_data() can be called after initialize() only"
        );
        if !self.core.has_to_send_init_data && !self.core.has_to_receive_init_data {
            info!("initialize_data is skipped since no data has to be initialized");
            return Ok(());
        }
        ensure!(
            !(self.core.has_to_send_init_data
                && self.core.is_action_required(Action::WriteInitialData)),
            "initial data has to be written before calling initialize_data()"
        );

        self.core.data_exchanged = false;

        if self.core.has_to_receive_init_data && self.core.is_coupling_ongoing() {
            debug_assert!(self.core.does_first_step);
            debug!("receiving initial data");
            self.core.receive_all_data()?;
            self.core.data_exchanged = true;
        }

        if self.core.has_to_send_init_data && self.core.is_coupling_ongoing() {
            debug_assert!(!self.core.does_first_step);
            // The initial value counts as the previous time step's end value
            // for residuals and extrapolation.
            for entry in self.core.send_data.values_mut() {
                if entry.old_values.ncols() == 0 {
                    continue;
                }
                entry.rotate_history();
            }
            debug!("sending initial data");
            self.core.send_all_data()?;
            self.core.receive_and_set_dt()?;
            // This receive replaces the one skipped in initialize().
            self.core.receive_all_data()?;
            self.core.data_exchanged = true;
        }

        self.core.has_to_send_init_data = false;
        self.core.has_to_receive_init_data = false;
        Ok(())
    }

    fn add_computed_time(&mut self, dt: f64) -> Result<()> {
        self.core.add_computed_time(dt)
    }

    fn advance(&mut self) -> Result<()> {
        self.core.check_completeness_required_actions()?;
        ensure!(
            !self.core.has_to_receive_init_data && !self.core.has_to_send_init_data,
            "initialize_data() has to be called before advance() if data has \
             to be initialized"
        );
        self.core.data_exchanged = false;
        self.core.timestep_complete = false;

        match self.coupling_mode {
            CouplingMode::Explicit => self.advance_explicit(),
            CouplingMode::Implicit => self.advance_implicit(),
        }
    }

    fn finalize(&mut self) -> Result<()> {
        self.core.finalize()
    }

    fn is_action_required(&self, action: Action) -> bool {
        self.core.is_action_required(action)
    }

    fn mark_action_fulfilled(&mut self, action: Action) -> Result<()> {
        self.core.mark_action_fulfilled(action)
    }

    fn is_coupling_ongoing(&self) -> bool {
        self.core.is_coupling_ongoing()
    }

    fn is_coupling_timestep_complete(&self) -> bool {
        self.core.timestep_complete
    }

    fn has_data_been_exchanged(&self) -> bool {
        self.core.data_exchanged
    }

    fn time(&self) -> f64 {
        self.core.time
    }

    fn timesteps(&self) -> usize {
        self.core.timesteps
    }

    fn next_timestep_max_length(&self) -> f64 {
        self.core.next_timestep_max_length()
    }
}
