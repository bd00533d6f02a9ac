// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Neuron groups: named populations simulated with one neuron model.

use crate::fragment::CodeFragment;
use crate::hash::{HashBuilder, HashDigest};
use crate::init::VarInit;
use crate::model::SynapseGroupId;
use crate::snippet::{NeuronModel, ParamValues};
use crate::var_access::VarLocation;
use crate::{CurrentSourceId, ModelError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A named population of N neurons sharing one neuron model
#[derive(Debug)]
pub struct NeuronGroup {
    name: String,
    num_neurons: u32,
    model: Arc<NeuronModel>,
    params: ParamValues,
    derived_params: ParamValues,
    var_initialisers: BTreeMap<String, VarInit>,

    sim_code: CodeFragment,
    threshold_condition_code: CodeFragment,
    reset_code: CodeFragment,

    /// Ring-buffer slot count; 1 means no buffering
    num_delay_slots: u32,
    /// Variables whose consumers read them across a delay, inferred at
    /// finalise
    var_queue_required: Vec<String>,

    spike_time_required: bool,
    prev_spike_time_required: bool,
    spike_event_time_required: bool,
    prev_spike_event_time_required: bool,
    true_spike_required: bool,
    spike_event_required: bool,

    spike_recording_enabled: bool,
    spike_event_recording_enabled: bool,

    spike_location: VarLocation,
    spike_event_location: VarLocation,
    spike_time_location: VarLocation,
    var_locations: BTreeMap<String, VarLocation>,
    egp_locations: BTreeMap<String, VarLocation>,

    in_syn: Vec<SynapseGroupId>,
    out_syn: Vec<SynapseGroupId>,
    current_sources: Vec<CurrentSourceId>,

    // Fusion results: archetype synapse groups whose arrays this
    // population's update kernel walks
    fused_psm_in_syn: Vec<SynapseGroupId>,
    fused_pre_output_out_syn: Vec<SynapseGroupId>,
    fused_wu_pre_out_syn: Vec<SynapseGroupId>,
    fused_wu_post_in_syn: Vec<SynapseGroupId>,
}

impl NeuronGroup {
    pub(crate) fn new(
        name: String,
        num_neurons: u32,
        model: Arc<NeuronModel>,
        params: ParamValues,
        var_initialisers: BTreeMap<String, VarInit>,
        default_var_location: VarLocation,
        default_egp_location: VarLocation,
    ) -> Result<Self> {
        model.validate()?;
        if num_neurons == 0 {
            return Err(ModelError::InvalidConfiguration(format!(
                "Neuron group '{}' must contain at least one neuron",
                name
            )));
        }

        let sim_code = CodeFragment::scan(
            &model.sim_code,
            &format!("Neuron group '{}' sim code", name),
        )?;
        let threshold_condition_code = CodeFragment::scan(
            &model.threshold_condition_code,
            &format!("Neuron group '{}' threshold condition code", name),
        )?;
        let reset_code = CodeFragment::scan(
            &model.reset_code,
            &format!("Neuron group '{}' reset code", name),
        )?;

        let var_locations = model
            .vars
            .iter()
            .map(|v| (v.name.clone(), default_var_location))
            .collect();
        let egp_locations = model
            .extra_global_params
            .iter()
            .map(|e| (e.name.clone(), default_egp_location))
            .collect();

        Ok(Self {
            name,
            num_neurons,
            model,
            params,
            derived_params: ParamValues::new(),
            var_initialisers,
            sim_code,
            threshold_condition_code,
            reset_code,
            num_delay_slots: 1,
            var_queue_required: Vec::new(),
            spike_time_required: false,
            prev_spike_time_required: false,
            spike_event_time_required: false,
            prev_spike_event_time_required: false,
            true_spike_required: false,
            spike_event_required: false,
            spike_recording_enabled: false,
            spike_event_recording_enabled: false,
            spike_location: default_var_location,
            spike_event_location: default_var_location,
            spike_time_location: default_var_location,
            var_locations,
            egp_locations,
            in_syn: Vec::new(),
            out_syn: Vec::new(),
            current_sources: Vec::new(),
            fused_psm_in_syn: Vec::new(),
            fused_pre_output_out_syn: Vec::new(),
            fused_wu_pre_out_syn: Vec::new(),
            fused_wu_post_in_syn: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_neurons(&self) -> u32 {
        self.num_neurons
    }

    pub fn model(&self) -> &Arc<NeuronModel> {
        &self.model
    }

    pub fn params(&self) -> &ParamValues {
        &self.params
    }

    pub fn derived_params(&self) -> &ParamValues {
        &self.derived_params
    }

    pub fn var_initialisers(&self) -> &BTreeMap<String, VarInit> {
        &self.var_initialisers
    }

    pub fn sim_code(&self) -> &CodeFragment {
        &self.sim_code
    }

    pub fn threshold_condition_code(&self) -> &CodeFragment {
        &self.threshold_condition_code
    }

    pub fn reset_code(&self) -> &CodeFragment {
        &self.reset_code
    }

    pub fn num_delay_slots(&self) -> u32 {
        self.num_delay_slots
    }

    /// Does any connected synapse group need spike buffering?
    pub fn is_delay_required(&self) -> bool {
        self.num_delay_slots > 1
    }

    /// Grow the slot count so a connection with `delay_steps` can read
    /// back far enough
    pub(crate) fn check_num_delay_slots(&mut self, delay_steps: u32) {
        self.num_delay_slots = self.num_delay_slots.max(delay_steps + 1);
    }

    pub fn is_var_queue_required(&self, var: &str) -> bool {
        self.var_queue_required.iter().any(|v| v == var)
    }

    pub(crate) fn set_var_queue_required(&mut self, var: &str) {
        if !self.is_var_queue_required(var) {
            self.var_queue_required.push(var.to_string());
        }
    }

    pub fn is_spike_time_required(&self) -> bool {
        self.spike_time_required
    }

    pub fn is_prev_spike_time_required(&self) -> bool {
        self.prev_spike_time_required
    }

    pub fn is_spike_event_time_required(&self) -> bool {
        self.spike_event_time_required
    }

    pub fn is_prev_spike_event_time_required(&self) -> bool {
        self.prev_spike_event_time_required
    }

    pub(crate) fn set_spike_time_required(&mut self, prev: bool) {
        if prev {
            self.prev_spike_time_required = true;
        } else {
            self.spike_time_required = true;
        }
    }

    pub(crate) fn set_spike_event_time_required(&mut self, prev: bool) {
        if prev {
            self.prev_spike_event_time_required = true;
        } else {
            self.spike_event_time_required = true;
        }
    }

    /// Does this group produce true spikes anything observes? Groups
    /// with a threshold condition always keep spike state so spikes
    /// stay recordable even without consumers.
    pub fn is_true_spike_required(&self) -> bool {
        self.true_spike_required || !self.threshold_condition_code.is_empty()
    }

    pub(crate) fn set_true_spike_required(&mut self) {
        self.true_spike_required = true;
    }

    /// Does any outgoing synapse group process spike-like events?
    pub fn is_spike_event_required(&self) -> bool {
        self.spike_event_required
    }

    pub(crate) fn set_spike_event_required(&mut self) {
        self.spike_event_required = true;
    }

    pub fn is_spike_recording_enabled(&self) -> bool {
        self.spike_recording_enabled
    }

    pub fn set_spike_recording_enabled(&mut self, enabled: bool) {
        self.spike_recording_enabled = enabled;
    }

    pub fn is_spike_event_recording_enabled(&self) -> bool {
        self.spike_event_recording_enabled
    }

    pub fn set_spike_event_recording_enabled(&mut self, enabled: bool) {
        self.spike_event_recording_enabled = enabled;
    }

    pub fn spike_location(&self) -> VarLocation {
        self.spike_location
    }

    pub fn set_spike_location(&mut self, location: VarLocation) {
        self.spike_location = location;
    }

    pub fn spike_event_location(&self) -> VarLocation {
        self.spike_event_location
    }

    pub fn spike_time_location(&self) -> VarLocation {
        self.spike_time_location
    }

    pub fn var_location(&self, var: &str) -> Result<VarLocation> {
        self.var_locations
            .get(var)
            .copied()
            .ok_or_else(|| ModelError::UnknownVariable {
                group: self.name.clone(),
                var: var.to_string(),
            })
    }

    pub fn set_var_location(&mut self, var: &str, location: VarLocation) -> Result<()> {
        match self.var_locations.get_mut(var) {
            Some(slot) => {
                *slot = location;
                Ok(())
            }
            None => Err(ModelError::UnknownVariable {
                group: self.name.clone(),
                var: var.to_string(),
            }),
        }
    }

    /// Any state on this group placed in zero-copy memory?
    pub fn is_zero_copy_in_use(&self) -> bool {
        self.spike_location.is_zero_copy()
            || self.spike_event_location.is_zero_copy()
            || self.var_locations.values().any(|l| l.is_zero_copy())
    }

    /// Does the chosen target variable for synaptic / current input
    /// exist on this group? `Isyn` always does.
    pub fn supports_target_var(&self, target: &str) -> bool {
        target == "Isyn"
            || self
                .model
                .additional_input_vars
                .iter()
                .any(|v| v.name == target)
    }

    pub fn in_syn(&self) -> &[SynapseGroupId] {
        &self.in_syn
    }

    pub fn out_syn(&self) -> &[SynapseGroupId] {
        &self.out_syn
    }

    pub fn current_sources(&self) -> &[CurrentSourceId] {
        &self.current_sources
    }

    pub(crate) fn add_in_syn(&mut self, sg: SynapseGroupId) {
        self.in_syn.push(sg);
    }

    pub(crate) fn add_out_syn(&mut self, sg: SynapseGroupId) {
        self.out_syn.push(sg);
    }

    pub(crate) fn add_current_source(&mut self, cs: CurrentSourceId) {
        self.current_sources.push(cs);
    }

    /// Incoming archetype synapse groups owning fused `outPost` state
    pub fn fused_psm_in_syn(&self) -> &[SynapseGroupId] {
        &self.fused_psm_in_syn
    }

    /// Outgoing archetype synapse groups owning fused `outPre` state
    pub fn fused_pre_output_out_syn(&self) -> &[SynapseGroupId] {
        &self.fused_pre_output_out_syn
    }

    /// Outgoing archetype synapse groups with presynaptic state/code
    pub fn fused_wu_pre_out_syn(&self) -> &[SynapseGroupId] {
        &self.fused_wu_pre_out_syn
    }

    /// Incoming archetype synapse groups with postsynaptic state/code
    pub fn fused_wu_post_in_syn(&self) -> &[SynapseGroupId] {
        &self.fused_wu_post_in_syn
    }

    pub(crate) fn set_fused_lists(
        &mut self,
        psm: Vec<SynapseGroupId>,
        pre_output: Vec<SynapseGroupId>,
        wu_pre: Vec<SynapseGroupId>,
        wu_post: Vec<SynapseGroupId>,
    ) {
        self.fused_psm_in_syn = psm;
        self.fused_pre_output_out_syn = pre_output;
        self.fused_wu_pre_out_syn = wu_pre;
        self.fused_wu_post_in_syn = wu_post;
    }

    pub(crate) fn finalise(&mut self, dt: f64) {
        self.derived_params = self
            .model
            .derived_params
            .iter()
            .map(|d| (d.name.clone(), (d.func)(&self.params, dt)))
            .collect();
        for init in self.var_initialisers.values_mut() {
            init.finalise(dt);
        }
    }

    /// Structural digest for merging neuron-update work: everything
    /// that shapes the emitted code, never concrete parameter values
    pub fn hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("neuron-group");
        hash.update_digest(&self.model.hash_digest());
        hash.update_u32(self.num_delay_slots)
            .update_bool(self.is_delay_required())
            .update_bool(self.spike_time_required)
            .update_bool(self.prev_spike_time_required)
            .update_bool(self.spike_event_time_required)
            .update_bool(self.prev_spike_event_time_required)
            .update_bool(self.true_spike_required)
            .update_bool(self.spike_event_required)
            .update_bool(self.spike_recording_enabled)
            .update_bool(self.spike_event_recording_enabled);
        hash.update_u32(self.var_queue_required.len() as u32);
        for v in &self.var_queue_required {
            hash.update_str(v);
        }
        hash.finalise()
    }

    /// Structural digest for merging neuron initialisation work
    pub fn init_hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("neuron-group-init");
        hash.update_u32(self.model.vars.len() as u32);
        for var in &self.model.vars {
            hash.update_str(&var.name)
                .update_str(&var.ty)
                .update_u32(var.access.hash_tag());
        }
        for (name, init) in &self.var_initialisers {
            hash.update_str(name).update_digest(&init.hash_digest());
        }
        hash.update_u32(self.num_delay_slots)
            .update_bool(self.true_spike_required)
            .update_bool(self.spike_event_required)
            .update_bool(self.spike_time_required)
            .update_bool(self.prev_spike_time_required);
        hash.finalise()
    }

    /// Digest over memory-placement choices
    pub fn var_location_hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("neuron-group-var-location");
        hash.update_u32(self.spike_location.hash_tag())
            .update_u32(self.spike_event_location.hash_tag())
            .update_u32(self.spike_time_location.hash_tag());
        for (name, location) in &self.var_locations {
            hash.update_str(name).update_u32(location.hash_tag());
        }
        for (name, location) in &self.egp_locations {
            hash.update_str(name).update_u32(location.hash_tag());
        }
        hash.finalise()
    }
}
