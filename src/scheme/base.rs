//! State and operations shared by the coupling scheme variants.

use std::collections::{BTreeMap, HashSet};

use anyhow::{bail, ensure, Result};
use nalgebra::DVector;
use tracing::{debug, info};

use super::data::{CouplingData, DataId, DataMap};
use super::measures::ConvergenceMeasure;
use super::{Action, SchemeConfig, TimesteppingMethod};
use crate::acceleration::Acceleration;
use crate::context::CouplingContext;
use crate::exchange::ParticipantLink;
use crate::mesh::MeshId;
use crate::stats::RunningStats;

/// A configured convergence measure bound to one coupling datum.
pub struct MeasureSlot {
    pub data_id: DataId,
    /// Belongs to the coarse measure set of multi-level coupling.
    pub coarse: bool,
    pub measure: Box<dyn ConvergenceMeasure>,
}

/// Bookkeeping core embedded by the concrete schemes: time and iteration
/// state, the action registry, measure wiring, data registries and the
/// transfers over the participant link.
pub struct SchemeCore {
    pub(crate) max_time: Option<f64>,
    pub(crate) max_timesteps: Option<usize>,
    pub(crate) timestep_length: Option<f64>,
    /// Tolerance for time comparisons, from the configured valid digits.
    pub(crate) eps: f64,
    pub(crate) does_first_step: bool,
    pub(crate) link: ParticipantLink,
    pub(crate) dt_method: TimesteppingMethod,
    pub(crate) max_iterations: usize,
    pub(crate) extrapolation_order: usize,
    pub(crate) time: f64,
    /// Completed time steps.
    pub(crate) timesteps: usize,
    pub(crate) computed_timestep_part: f64,
    /// Iteration number within the current time step, starting at 1.
    pub(crate) iterations: usize,
    pub(crate) total_iterations: usize,
    pub(crate) iterations_per_step: RunningStats,
    pub(crate) send_data: DataMap,
    pub(crate) receive_data: DataMap,
    pub(crate) measures: Vec<MeasureSlot>,
    pub(crate) acceleration: Option<Box<dyn Acceleration>>,
    pub(crate) required_actions: HashSet<Action>,
    pub(crate) initialized: bool,
    pub(crate) timestep_complete: bool,
    pub(crate) data_exchanged: bool,
    pub(crate) has_to_send_init_data: bool,
    pub(crate) has_to_receive_init_data: bool,
    /// Synchronized over the master channel in multi-level coupling.
    pub(crate) coarse_optimization_active: bool,
    pub(crate) ctx: CouplingContext,
}

impl SchemeCore {
    pub fn new(config: &SchemeConfig, link: ParticipantLink, ctx: CouplingContext) -> Result<Self> {
        ensure!(
            (1..17).contains(&config.valid_digits),
            "valid digits have to be in [1; 16], got {}",
            config.valid_digits
        );
        if let Some(max_time) = config.max_time {
            ensure!(max_time >= 0.0, "maximum time has to be non-negative");
        }
        if let Some(length) = config.timestep_length {
            ensure!(length > 0.0, "time step length has to be larger than zero");
        }
        ensure!(
            config.first_participant != config.second_participant,
            "first and second participant have to differ"
        );
        ensure!(
            config.local_participant == config.first_participant
                || config.local_participant == config.second_participant,
            "local participant `{}` is neither `{}` nor `{}`",
            config.local_participant,
            config.first_participant,
            config.second_participant
        );
        let does_first_step = config.local_participant == config.first_participant;
        if config.dt_method == TimesteppingMethod::FixedDt {
            ensure!(
                config.timestep_length.is_some(),
                "a fixed time step length requires the length to be configured"
            );
        }
        ensure!(
            config.extrapolation_order <= 2,
            "extrapolation order {} is not supported",
            config.extrapolation_order
        );
        ensure!(config.max_iterations >= 1, "iteration budget has to be at least 1");

        Ok(Self {
            max_time: config.max_time,
            max_timesteps: config.max_timesteps,
            timestep_length: config.timestep_length,
            eps: 10f64.powi(-(config.valid_digits as i32)),
            does_first_step,
            link,
            dt_method: config.dt_method,
            max_iterations: config.max_iterations,
            extrapolation_order: config.extrapolation_order,
            time: 0.0,
            timesteps: 0,
            computed_timestep_part: 0.0,
            iterations: 1,
            total_iterations: 0,
            iterations_per_step: RunningStats::new(),
            send_data: DataMap::new(),
            receive_data: DataMap::new(),
            measures: Vec::new(),
            acceleration: None,
            required_actions: HashSet::new(),
            initialized: false,
            timestep_complete: false,
            data_exchanged: false,
            has_to_send_init_data: false,
            has_to_receive_init_data: false,
            coarse_optimization_active: false,
            ctx,
        })
    }

    // --- data registries -------------------------------------------------

    pub fn add_send_data(
        &mut self,
        id: DataId,
        mesh_id: MeshId,
        dimension: usize,
        values: DVector<f64>,
        initialize: bool,
    ) -> Result<()> {
        ensure!(
            !self.send_data.contains_key(&id),
            "send data with ID {id} is already registered"
        );
        self.send_data
            .insert(id, CouplingData::new(values, dimension, mesh_id, initialize));
        Ok(())
    }

    pub fn add_receive_data(
        &mut self,
        id: DataId,
        mesh_id: MeshId,
        dimension: usize,
        values: DVector<f64>,
        initialize: bool,
    ) -> Result<()> {
        ensure!(
            !self.receive_data.contains_key(&id),
            "receive data with ID {id} is already registered"
        );
        self.receive_data
            .insert(id, CouplingData::new(values, dimension, mesh_id, initialize));
        Ok(())
    }

    /// Looks a datum up in the send set, then in the receive set.
    pub fn coupling_data(&self, id: DataId) -> Option<&CouplingData> {
        self.send_data.get(&id).or_else(|| self.receive_data.get(&id))
    }

    pub fn coupling_data_mut(&mut self, id: DataId) -> Option<&mut CouplingData> {
        if self.send_data.contains_key(&id) {
            self.send_data.get_mut(&id)
        } else {
            self.receive_data.get_mut(&id)
        }
    }

    // --- time bookkeeping ------------------------------------------------

    pub fn this_timestep_remainder(&self) -> f64 {
        match self.timestep_length {
            Some(length) => (length - self.computed_timestep_part).max(0.0),
            None => 0.0,
        }
    }

    pub fn remainder_is_zero(&self) -> bool {
        self.this_timestep_remainder() <= self.eps
    }

    pub fn next_timestep_max_length(&self) -> f64 {
        match self.timestep_length {
            Some(_) => self.this_timestep_remainder(),
            None => match self.max_time {
                Some(max_time) => (max_time - self.time).max(0.0),
                None => f64::MAX,
            },
        }
    }

    pub fn add_computed_time(&mut self, dt: f64) -> Result<()> {
        ensure!(self.initialized, "initialize() has to be called first");
        ensure!(dt > 0.0, "computed time has to be larger than zero, got {dt}");
        if self.timestep_length.is_some() {
            ensure!(
                dt <= self.this_timestep_remainder() + self.eps,
                "computed time {dt} exceeds the remainder {} of this time step",
                self.this_timestep_remainder()
            );
        }
        self.time += dt;
        self.computed_timestep_part += dt;
        Ok(())
    }

    pub fn is_coupling_ongoing(&self) -> bool {
        let time_left = match self.max_time {
            Some(max_time) => max_time - self.time > self.eps,
            None => true,
        };
        let timesteps_left = match self.max_timesteps {
            Some(max_timesteps) => self.timesteps < max_timesteps,
            None => true,
        };
        time_left && timesteps_left
    }

    pub fn timestep_completed(&mut self) {
        self.timesteps += 1;
        self.timestep_complete = true;
        self.iterations_per_step.record(self.iterations as f64);
        info!(
            timestep = self.timesteps,
            time = self.time,
            iterations = self.iterations,
            "time step completed"
        );
    }

    /// Advances the iteration counters; rolls the time back when the step
    /// has to be repeated from the checkpoint.
    pub fn update_time_and_iterations(&mut self, convergence: bool) {
        self.total_iterations += 1;
        if convergence {
            self.iterations = 1;
        } else {
            self.time -= self.computed_timestep_part;
            self.iterations += 1;
        }
    }

    pub fn max_iterations_reached(&self) -> bool {
        self.iterations >= self.max_iterations
    }

    // --- action registry -------------------------------------------------

    pub fn require_action(&mut self, action: Action) {
        self.required_actions.insert(action);
    }

    pub fn is_action_required(&self, action: Action) -> bool {
        self.required_actions.contains(&action)
    }

    pub fn mark_action_fulfilled(&mut self, action: Action) -> Result<()> {
        ensure!(
            self.required_actions.remove(&action),
            "action {action} was marked fulfilled but is not required"
        );
        Ok(())
    }

    pub fn check_completeness_required_actions(&self) -> Result<()> {
        if self.required_actions.is_empty() {
            return Ok(());
        }
        let mut outstanding: Vec<String> = self
            .required_actions
            .iter()
            .map(ToString::to_string)
            .collect();
        outstanding.sort();
        bail!(
            "the required actions {} are not fulfilled",
            outstanding.join(", ")
        );
    }

    // --- convergence measures --------------------------------------------

    pub fn add_convergence_measure(
        &mut self,
        data_id: DataId,
        coarse: bool,
        measure: Box<dyn ConvergenceMeasure>,
    ) {
        self.measures.push(MeasureSlot {
            data_id,
            coarse,
            measure,
        });
    }

    /// Runs the selected measure set; converged when *all* measures pass.
    pub fn measure_convergence(
        &mut self,
        design_specs: &BTreeMap<DataId, DVector<f64>>,
        coarse: bool,
    ) -> Result<bool> {
        let mut all_converged = true;
        let mut measured = false;
        for slot in &mut self.measures {
            if slot.coarse != coarse {
                continue;
            }
            let data = self
                .send_data
                .get(&slot.data_id)
                .or_else(|| self.receive_data.get(&slot.data_id));
            let Some(data) = data else {
                bail!(
                    "convergence measure refers to unknown data ID {}",
                    slot.data_id
                );
            };
            ensure!(
                data.old_values.ncols() > 0,
                "data {} has no history column for convergence measurement",
                slot.data_id
            );
            let old = data.previous_values();
            slot.measure
                .measure(&old, &data.values, design_specs.get(&slot.data_id))?;
            measured = true;
            let converged = slot.measure.is_converged();
            debug!(
                data_id = slot.data_id,
                norm = slot.measure.norm_residual(),
                converged,
                "{}",
                slot.measure.describe()
            );
            all_converged = all_converged && converged;
        }
        ensure!(
            measured,
            "implicit coupling requires at least one convergence measure in \
             the {} set",
            if coarse { "coarse" } else { "fine" }
        );
        Ok(all_converged)
    }

    pub fn new_convergence_measurements(&mut self) {
        for slot in &mut self.measures {
            slot.measure.new_measurement_series();
        }
    }

    // --- history and extrapolation ---------------------------------------

    /// Reserves the history columns needed by measures and extrapolation.
    pub fn setup_data_matrices(&mut self) {
        let columns = self.extrapolation_order + 1;
        for entry in self.send_data.values_mut() {
            entry.ensure_history_columns(columns);
        }
    }

    /// Rotates the history of every send datum and predicts the next
    /// time-step start values with the configured polynomial order.
    pub fn extrapolate_data(&mut self) -> Result<()> {
        let order = self.extrapolation_order;
        // With a single completed step there is not enough history for the
        // second order yet.
        let first_order = order == 1 || self.timesteps == 1;
        for (id, entry) in self.send_data.iter_mut() {
            ensure!(
                entry.old_values.ncols() > 1,
                "data {id} has no history for extrapolation"
            );
            if first_order {
                debug!(data_id = *id, "first order extrapolation");
                entry.rotate_history();
                let previous = entry.old_values.column(1).into_owned();
                entry.values = 2.0 * &entry.values - previous;
            } else if order == 2 {
                ensure!(
                    entry.old_values.ncols() > 2,
                    "data {id} has too little history for second order extrapolation"
                );
                debug!(data_id = *id, "second order extrapolation");
                entry.rotate_history();
                let t1 = entry.old_values.column(1).into_owned();
                let t2 = entry.old_values.column(2).into_owned();
                entry.values = 2.5 * &entry.values - 2.0 * t1 + 0.5 * t2;
            } else {
                bail!("extrapolation order {order} is not supported");
            }
        }
        Ok(())
    }

    /// Stores the current iterate in history column 0 of every datum, so
    /// the next iteration's residual is taken against it.
    pub fn store_current_values(&mut self) {
        for entry in self
            .send_data
            .values_mut()
            .chain(self.receive_data.values_mut())
        {
            if entry.old_values.ncols() > 0 {
                let values = entry.values.clone();
                entry.old_values.set_column(0, &values);
            }
        }
    }

    // --- transfers -------------------------------------------------------

    pub fn send_all_data(&mut self) -> Result<()> {
        for entry in self.send_data.values() {
            self.link
                .send(entry.values.as_slice(), entry.mesh_id, entry.dimension)?;
        }
        debug!(count = self.send_data.len(), "sent coupling data");
        Ok(())
    }

    pub fn receive_all_data(&mut self) -> Result<()> {
        for entry in self.receive_data.values_mut() {
            self.link
                .receive(entry.values.as_mut_slice(), entry.mesh_id, entry.dimension)?;
        }
        debug!(count = self.receive_data.len(), "received coupling data");
        Ok(())
    }

    /// The first participant announces the time step length it computed.
    pub fn send_dt(&mut self) -> Result<()> {
        if self.dt_method == TimesteppingMethod::FirstParticipantSetsDt && self.does_first_step {
            self.link.send_f64(self.computed_timestep_part)?;
        }
        Ok(())
    }

    /// The second participant adopts the announced time step length.
    pub fn receive_and_set_dt(&mut self) -> Result<()> {
        if self.dt_method == TimesteppingMethod::FirstParticipantSetsDt && !self.does_first_step {
            let dt = self.link.receive_f64()?;
            debug!(dt, "received time step length");
            self.timestep_length = Some(dt);
        }
        Ok(())
    }

    pub fn finalize(&mut self) -> Result<()> {
        ensure!(self.initialized, "initialize() has to be called before finalize()");
        // One summary per participant, not one per rank.
        if self.ctx.bus.is_master() {
            info!(
                total_iterations = self.total_iterations,
                iterations_per_step = %self.iterations_per_step,
                "coupling finished"
            );
        }
        Ok(())
    }
}
