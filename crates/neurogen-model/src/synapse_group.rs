// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Synapse groups: directed edges between neuron populations carrying a
//! weight-update model, a postsynaptic model and connectivity.

use crate::fragment::CodeFragment;
use crate::hash::{HashBuilder, HashDigest};
use crate::init::{ConnectivityInit, ToeplitzInit, VarInit};
use crate::matrix::{SpanType, SynapseMatrixType};
use crate::model::{NeuronGroupId, SynapseGroupId};
use crate::snippet::{ParamValues, PostsynapticModel, WeightUpdateModel};
use crate::var_access::VarLocation;
use crate::{ModelError, Result};
use neurogen_types::NumericType;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Scanned weight-update code fragments
#[derive(Debug)]
pub(crate) struct WuFragments {
    pub sim: CodeFragment,
    pub event: CodeFragment,
    pub event_threshold: CodeFragment,
    pub learn_post: CodeFragment,
    pub synapse_dynamics: CodeFragment,
    pub pre_spike: CodeFragment,
    pub post_spike: CodeFragment,
    pub pre_dynamics: CodeFragment,
    pub post_dynamics: CodeFragment,
}

/// A directed connection between two neuron groups
#[derive(Debug)]
pub struct SynapseGroup {
    name: String,
    matrix_type: SynapseMatrixType,
    delay_steps: u32,
    back_prop_delay_steps: u32,
    max_dendritic_delay_timesteps: u32,
    src: NeuronGroupId,
    trg: NeuronGroupId,

    wu_model: Arc<WeightUpdateModel>,
    wu_params: ParamValues,
    wu_derived_params: ParamValues,
    wu_var_initialisers: BTreeMap<String, VarInit>,
    wu_pre_var_initialisers: BTreeMap<String, VarInit>,
    wu_post_var_initialisers: BTreeMap<String, VarInit>,
    wu: WuFragments,

    ps_model: Arc<PostsynapticModel>,
    ps_params: ParamValues,
    ps_derived_params: ParamValues,
    ps_var_initialisers: BTreeMap<String, VarInit>,
    ps_apply_input: CodeFragment,
    ps_decay: CodeFragment,

    connectivity_initialiser: ConnectivityInit,
    toeplitz_initialiser: Option<ToeplitzInit>,
    kernel_size: Vec<u32>,
    max_connections: u32,
    max_source_connections: u32,

    span_type: SpanType,
    num_threads_per_spike: u32,
    narrow_sparse_ind: bool,
    event_threshold_retest_required: bool,

    pre_target_var: String,
    post_target_var: String,

    in_syn_location: VarLocation,
    dendritic_delay_location: VarLocation,
    sparse_connectivity_location: VarLocation,
    wu_var_locations: BTreeMap<String, VarLocation>,
    wu_pre_var_locations: BTreeMap<String, VarLocation>,
    wu_post_var_locations: BTreeMap<String, VarLocation>,
    ps_var_locations: BTreeMap<String, VarLocation>,
    wu_egp_locations: BTreeMap<String, VarLocation>,
    ps_egp_locations: BTreeMap<String, VarLocation>,

    // Fusion targets, set at finalise: the archetype synapse group
    // whose arrays this group shares for each concern (self when
    // unfused)
    fused_ps_target: Option<SynapseGroupId>,
    fused_pre_output_target: Option<SynapseGroupId>,
    fused_wu_pre_target: Option<SynapseGroupId>,
    fused_wu_post_target: Option<SynapseGroupId>,
}

pub(crate) struct SynapseGroupArgs {
    pub name: String,
    pub matrix_type: SynapseMatrixType,
    pub delay_steps: u32,
    pub src: NeuronGroupId,
    pub trg: NeuronGroupId,
    pub num_src_neurons: u32,
    pub num_trg_neurons: u32,
    pub wu_model: Arc<WeightUpdateModel>,
    pub wu_params: ParamValues,
    pub wu_var_initialisers: BTreeMap<String, VarInit>,
    pub wu_pre_var_initialisers: BTreeMap<String, VarInit>,
    pub wu_post_var_initialisers: BTreeMap<String, VarInit>,
    pub ps_model: Arc<PostsynapticModel>,
    pub ps_params: ParamValues,
    pub ps_var_initialisers: BTreeMap<String, VarInit>,
    pub connectivity_initialiser: ConnectivityInit,
    pub toeplitz_initialiser: Option<ToeplitzInit>,
    pub default_var_location: VarLocation,
    pub default_egp_location: VarLocation,
    pub default_sparse_connectivity_location: VarLocation,
    pub default_narrow_sparse_ind: bool,
}

impl SynapseGroup {
    pub(crate) fn new(args: SynapseGroupArgs) -> Result<Self> {
        let SynapseGroupArgs {
            name,
            matrix_type,
            delay_steps,
            src,
            trg,
            num_src_neurons,
            num_trg_neurons,
            wu_model,
            wu_params,
            wu_var_initialisers,
            wu_pre_var_initialisers,
            wu_post_var_initialisers,
            ps_model,
            ps_params,
            ps_var_initialisers,
            connectivity_initialiser,
            toeplitz_initialiser,
            default_var_location,
            default_egp_location,
            default_sparse_connectivity_location,
            default_narrow_sparse_ind,
        } = args;

        wu_model.validate()?;
        ps_model.validate()?;

        let wu = WuFragments {
            sim: CodeFragment::scan(
                &wu_model.sim_code,
                &format!("Synapse group '{}' weight update model sim code", name),
            )?,
            event: CodeFragment::scan(
                &wu_model.event_code,
                &format!("Synapse group '{}' weight update model event code", name),
            )?,
            event_threshold: CodeFragment::scan(
                &wu_model.event_threshold_condition_code,
                &format!("Synapse group '{}' event threshold condition", name),
            )?,
            learn_post: CodeFragment::scan(
                &wu_model.learn_post_code,
                &format!("Synapse group '{}' weight update model learn post code", name),
            )?,
            synapse_dynamics: CodeFragment::scan(
                &wu_model.synapse_dynamics_code,
                &format!("Synapse group '{}' synapse dynamics code", name),
            )?,
            pre_spike: CodeFragment::scan(
                &wu_model.pre_spike_code,
                &format!("Synapse group '{}' weight update model pre spike code", name),
            )?,
            post_spike: CodeFragment::scan(
                &wu_model.post_spike_code,
                &format!("Synapse group '{}' weight update model post spike code", name),
            )?,
            pre_dynamics: CodeFragment::scan(
                &wu_model.pre_dynamics_code,
                &format!("Synapse group '{}' weight update model pre dynamics code", name),
            )?,
            post_dynamics: CodeFragment::scan(
                &wu_model.post_dynamics_code,
                &format!("Synapse group '{}' weight update model post dynamics code", name),
            )?,
        };
        let ps_apply_input = CodeFragment::scan(
            &ps_model.apply_input_code,
            &format!("Synapse group '{}' postsynaptic model apply input code", name),
        )?;
        let ps_decay = CodeFragment::scan(
            &ps_model.decay_code,
            &format!("Synapse group '{}' postsynaptic model decay code", name),
        )?;

        // Procedural connectivity forbids structural passes that need
        // materialised connectivity
        if matrix_type.is_procedural() {
            if connectivity_initialiser.row_build().is_empty() {
                return Err(ModelError::InvalidMatrixType(format!(
                    "Synapse group '{}': procedural connectivity requires a connectivity \
                     snippet with row building code",
                    name
                )));
            }
            if !connectivity_initialiser.col_build().is_empty() {
                return Err(ModelError::InvalidMatrixType(format!(
                    "Synapse group '{}': procedural connectivity cannot use column building code",
                    name
                )));
            }
            if !wu.learn_post.is_empty() {
                return Err(ModelError::InvalidMatrixType(format!(
                    "Synapse group '{}': procedural connectivity cannot be used with \
                     postsynaptic spike-triggered learning",
                    name
                )));
            }
            if !wu.synapse_dynamics.is_empty() {
                return Err(ModelError::InvalidMatrixType(format!(
                    "Synapse group '{}': procedural connectivity cannot be used with \
                     continuous synapse dynamics",
                    name
                )));
            }
        }
        // Toeplitz forbids the same structural passes plus column build
        else if matrix_type.is_toeplitz() {
            let toeplitz = toeplitz_initialiser.as_ref().ok_or_else(|| {
                ModelError::InvalidMatrixType(format!(
                    "Synapse group '{}': Toeplitz connectivity requires a Toeplitz \
                     connectivity initialiser",
                    name
                ))
            })?;
            if toeplitz.diagonal_build().is_empty() {
                return Err(ModelError::InvalidMatrixType(format!(
                    "Synapse group '{}': Toeplitz connectivity requires diagonal build code",
                    name
                )));
            }
            if !wu.learn_post.is_empty() {
                return Err(ModelError::InvalidMatrixType(format!(
                    "Synapse group '{}': Toeplitz connectivity cannot be used with \
                     postsynaptic spike-triggered learning",
                    name
                )));
            }
            if !connectivity_initialiser.col_build().is_empty() {
                return Err(ModelError::InvalidMatrixType(format!(
                    "Synapse group '{}': Toeplitz connectivity cannot use column building code",
                    name
                )));
            }
        }
        // Procedural weights without procedural connectivity cannot
        // reach the connectivity RNG stream
        else if matrix_type.has_procedural_weights() {
            if wu_var_initialisers.values().any(|v| v.is_rng_required()) {
                return Err(ModelError::IncompatibleInitialiser(format!(
                    "Synapse group '{}': procedural weights without procedural connectivity \
                     cannot access an RNG",
                    name
                )));
            }
        }

        // Dense connectivity never runs build code
        if matrix_type.is_dense() && connectivity_initialiser.has_build_code() {
            return Err(ModelError::InvalidMatrixType(format!(
                "Synapse group '{}': DENSE connectivity cannot use a connectivity \
                 initialisation snippet",
                name
            )));
        }

        // Kernel size comes from whichever connectivity initialiser is
        // in force
        let kernel_size = if matrix_type.is_toeplitz() {
            toeplitz_initialiser
                .as_ref()
                .and_then(|t| t.calc_kernel_size())
                .unwrap_or_default()
        } else {
            connectivity_initialiser.calc_kernel_size().unwrap_or_default()
        };

        if !kernel_size.is_empty()
            && !(matrix_type == SynapseMatrixType::PROCEDURAL_KERNELG
                || matrix_type == SynapseMatrixType::PROCEDURAL_PROCEDURALG
                || matrix_type == SynapseMatrixType::SPARSE_INDIVIDUALG
                || matrix_type == SynapseMatrixType::SPARSE_KERNELG
                || matrix_type.is_toeplitz())
        {
            return Err(ModelError::InvalidMatrixType(format!(
                "Synapse group '{}': connectivity initialisers which use a kernel require \
                 kernel-compatible matrix types",
                name
            )));
        }

        if kernel_size.is_empty()
            && wu_var_initialisers.values().any(|v| v.requires_kernel())
        {
            return Err(ModelError::IncompatibleInitialiser(format!(
                "Synapse group '{}': variable initialisers which use id_kernel require a \
                 connectivity initialiser that defines a kernel size",
                name
            )));
        }

        let max_connections = if matrix_type.is_toeplitz() {
            toeplitz_initialiser
                .as_ref()
                .and_then(|t| t.calc_max_row_length(num_src_neurons, num_trg_neurons))
                .unwrap_or(num_trg_neurons)
        } else {
            connectivity_initialiser
                .calc_max_row_length(num_src_neurons, num_trg_neurons)
                .unwrap_or(num_trg_neurons)
        };
        let max_source_connections = connectivity_initialiser
            .calc_max_col_length(num_src_neurons, num_trg_neurons)
            .unwrap_or(num_src_neurons);

        let wu_var_locations = wu_model
            .vars
            .iter()
            .map(|v| (v.name.clone(), default_var_location))
            .collect();
        let wu_pre_var_locations = wu_model
            .pre_vars
            .iter()
            .map(|v| (v.name.clone(), default_var_location))
            .collect();
        let wu_post_var_locations = wu_model
            .post_vars
            .iter()
            .map(|v| (v.name.clone(), default_var_location))
            .collect();
        let ps_var_locations = ps_model
            .vars
            .iter()
            .map(|v| (v.name.clone(), default_var_location))
            .collect();
        let wu_egp_locations = wu_model
            .extra_global_params
            .iter()
            .map(|e| (e.name.clone(), default_egp_location))
            .collect();
        let ps_egp_locations = ps_model
            .extra_global_params
            .iter()
            .map(|e| (e.name.clone(), default_egp_location))
            .collect();

        Ok(Self {
            name,
            matrix_type,
            delay_steps,
            back_prop_delay_steps: 0,
            max_dendritic_delay_timesteps: 1,
            src,
            trg,
            wu_model,
            wu_params,
            wu_derived_params: ParamValues::new(),
            wu_var_initialisers,
            wu_pre_var_initialisers,
            wu_post_var_initialisers,
            wu,
            ps_model,
            ps_params,
            ps_derived_params: ParamValues::new(),
            ps_var_initialisers,
            ps_apply_input,
            ps_decay,
            connectivity_initialiser,
            toeplitz_initialiser,
            kernel_size,
            max_connections,
            max_source_connections,
            span_type: SpanType::Postsynaptic,
            num_threads_per_spike: 1,
            narrow_sparse_ind: default_narrow_sparse_ind,
            event_threshold_retest_required: false,
            pre_target_var: "Isyn".to_string(),
            post_target_var: "Isyn".to_string(),
            in_syn_location: default_var_location,
            dendritic_delay_location: default_var_location,
            sparse_connectivity_location: default_sparse_connectivity_location,
            wu_var_locations,
            wu_pre_var_locations,
            wu_post_var_locations,
            ps_var_locations,
            wu_egp_locations,
            ps_egp_locations,
            fused_ps_target: None,
            fused_pre_output_target: None,
            fused_wu_pre_target: None,
            fused_wu_post_target: None,
        })
    }

    // ---- basic accessors --------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matrix_type(&self) -> SynapseMatrixType {
        self.matrix_type
    }

    pub fn delay_steps(&self) -> u32 {
        self.delay_steps
    }

    pub fn back_prop_delay_steps(&self) -> u32 {
        self.back_prop_delay_steps
    }

    pub fn max_dendritic_delay_timesteps(&self) -> u32 {
        self.max_dendritic_delay_timesteps
    }

    pub fn src(&self) -> NeuronGroupId {
        self.src
    }

    pub fn trg(&self) -> NeuronGroupId {
        self.trg
    }

    pub fn wu_model(&self) -> &Arc<WeightUpdateModel> {
        &self.wu_model
    }

    pub fn ps_model(&self) -> &Arc<PostsynapticModel> {
        &self.ps_model
    }

    pub fn wu_params(&self) -> &ParamValues {
        &self.wu_params
    }

    pub fn wu_derived_params(&self) -> &ParamValues {
        &self.wu_derived_params
    }

    pub fn ps_params(&self) -> &ParamValues {
        &self.ps_params
    }

    pub fn ps_derived_params(&self) -> &ParamValues {
        &self.ps_derived_params
    }

    pub fn wu_var_initialisers(&self) -> &BTreeMap<String, VarInit> {
        &self.wu_var_initialisers
    }

    pub fn wu_pre_var_initialisers(&self) -> &BTreeMap<String, VarInit> {
        &self.wu_pre_var_initialisers
    }

    pub fn wu_post_var_initialisers(&self) -> &BTreeMap<String, VarInit> {
        &self.wu_post_var_initialisers
    }

    pub fn ps_var_initialisers(&self) -> &BTreeMap<String, VarInit> {
        &self.ps_var_initialisers
    }

    pub fn connectivity_initialiser(&self) -> &ConnectivityInit {
        &self.connectivity_initialiser
    }

    pub fn toeplitz_initialiser(&self) -> Option<&ToeplitzInit> {
        self.toeplitz_initialiser.as_ref()
    }

    pub fn kernel_size(&self) -> &[u32] {
        &self.kernel_size
    }

    pub fn kernel_size_flattened(&self) -> u64 {
        self.kernel_size.iter().map(|&d| d as u64).product()
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    pub fn max_source_connections(&self) -> u32 {
        self.max_source_connections
    }

    pub fn span_type(&self) -> SpanType {
        self.span_type
    }

    pub fn num_threads_per_spike(&self) -> u32 {
        self.num_threads_per_spike
    }

    pub fn is_narrow_sparse_ind_enabled(&self) -> bool {
        self.narrow_sparse_ind
    }

    pub fn is_event_threshold_retest_required(&self) -> bool {
        self.event_threshold_retest_required
    }

    pub fn pre_target_var(&self) -> &str {
        &self.pre_target_var
    }

    pub fn post_target_var(&self) -> &str {
        &self.post_target_var
    }

    // ---- code fragments ----------------------------------------------

    pub fn wu_sim_code(&self) -> &CodeFragment {
        &self.wu.sim
    }

    pub fn wu_event_code(&self) -> &CodeFragment {
        &self.wu.event
    }

    pub fn wu_event_threshold_code(&self) -> &CodeFragment {
        &self.wu.event_threshold
    }

    pub fn wu_learn_post_code(&self) -> &CodeFragment {
        &self.wu.learn_post
    }

    pub fn wu_synapse_dynamics_code(&self) -> &CodeFragment {
        &self.wu.synapse_dynamics
    }

    pub fn wu_pre_spike_code(&self) -> &CodeFragment {
        &self.wu.pre_spike
    }

    pub fn wu_post_spike_code(&self) -> &CodeFragment {
        &self.wu.post_spike
    }

    pub fn wu_pre_dynamics_code(&self) -> &CodeFragment {
        &self.wu.pre_dynamics
    }

    pub fn wu_post_dynamics_code(&self) -> &CodeFragment {
        &self.wu.post_dynamics
    }

    pub fn ps_apply_input_code(&self) -> &CodeFragment {
        &self.ps_apply_input
    }

    pub fn ps_decay_code(&self) -> &CodeFragment {
        &self.ps_decay
    }

    pub(crate) fn all_wu_fragments(&self) -> [&CodeFragment; 9] {
        [
            &self.wu.sim,
            &self.wu.event,
            &self.wu.event_threshold,
            &self.wu.learn_post,
            &self.wu.synapse_dynamics,
            &self.wu.pre_spike,
            &self.wu.post_spike,
            &self.wu.pre_dynamics,
            &self.wu.post_dynamics,
        ]
    }

    // ---- derived queries ----------------------------------------------

    /// Does this group process true spikes?
    pub fn is_true_spike_required(&self) -> bool {
        !self.wu.sim.is_empty()
    }

    /// Does this group process spike-like events?
    pub fn is_spike_event_required(&self) -> bool {
        !self.wu.event.is_empty()
    }

    /// Does any weight-update code route input through the dendritic
    /// delay buffer?
    pub fn is_dendritic_delay_required(&self) -> bool {
        self.wu.sim.references("addToPostDelay")
            || self.wu.synapse_dynamics.references("addToPostDelay")
    }

    /// Does any weight-update code write presynaptic output?
    pub fn is_pre_output_required(&self) -> bool {
        self.all_wu_fragments()
            .iter()
            .any(|f| f.references("addToPre"))
    }

    /// Does this group carry presynaptic per-neuron weight-update state
    /// or code?
    pub fn has_wu_pre_state(&self) -> bool {
        !self.wu_model.pre_vars.is_empty()
            || !self.wu.pre_spike.is_empty()
            || !self.wu.pre_dynamics.is_empty()
    }

    /// Does this group carry postsynaptic per-neuron weight-update
    /// state or code?
    pub fn has_wu_post_state(&self) -> bool {
        !self.wu_model.post_vars.is_empty()
            || !self.wu.post_spike.is_empty()
            || !self.wu.post_dynamics.is_empty()
    }

    /// Element type of the sparse index array, narrowed when enabled
    pub fn sparse_ind_type(&self, num_trg_neurons: u32) -> NumericType {
        if self.narrow_sparse_ind {
            NumericType::smallest_unsigned(num_trg_neurons as u64)
        } else {
            NumericType::Uint32
        }
    }

    pub fn is_procedural_connectivity_rng_required(&self) -> bool {
        self.matrix_type.is_procedural()
            && self.connectivity_initialiser.row_build().is_rng_required()
    }

    pub fn is_wu_init_rng_required(&self) -> bool {
        if self.wu_var_initialisers.values().any(|v| v.is_rng_required()) {
            return true;
        }
        (self.matrix_type.is_sparse() || self.matrix_type.is_bitmask())
            && (self.connectivity_initialiser.row_build().is_rng_required()
                || self.connectivity_initialiser.col_build().is_rng_required())
    }

    pub fn is_ps_init_rng_required(&self) -> bool {
        self.ps_var_initialisers.values().any(|v| v.is_rng_required())
    }

    /// Is device code needed to initialise per-synapse variables?
    pub fn is_wu_var_init_required(&self) -> bool {
        self.matrix_type.has_individual_weights()
            && self
                .wu_var_initialisers
                .values()
                .any(|v| v.is_code_required())
    }

    pub fn is_sparse_connectivity_init_required(&self) -> bool {
        (self.matrix_type.is_sparse() || self.matrix_type.is_bitmask())
            && self.connectivity_initialiser.has_build_code()
    }

    // ---- setters ------------------------------------------------------

    pub fn set_max_connections(&mut self, max_connections: u32) -> Result<()> {
        if !self.matrix_type.is_sparse() {
            return Err(ModelError::InvalidConfiguration(format!(
                "Synapse group '{}' is not sparsely connected; max connections are not used",
                self.name
            )));
        }
        if self
            .connectivity_initialiser
            .snippet()
            .calc_max_row_length
            .is_some()
        {
            return Err(ModelError::InvalidConfiguration(format!(
                "Synapse group '{}' already has max connections defined by its connectivity \
                 initialisation snippet",
                self.name
            )));
        }
        self.max_connections = max_connections;
        Ok(())
    }

    pub fn set_max_source_connections(&mut self, max_source_connections: u32) -> Result<()> {
        if !self.matrix_type.is_sparse() {
            return Err(ModelError::InvalidConfiguration(format!(
                "Synapse group '{}' is not sparsely connected; max source connections are \
                 not used",
                self.name
            )));
        }
        if self
            .connectivity_initialiser
            .snippet()
            .calc_max_col_length
            .is_some()
        {
            return Err(ModelError::InvalidConfiguration(format!(
                "Synapse group '{}' already has max source connections defined by its \
                 connectivity initialisation snippet",
                self.name
            )));
        }
        self.max_source_connections = max_source_connections;
        Ok(())
    }

    pub fn set_max_dendritic_delay_timesteps(&mut self, timesteps: u32) -> Result<()> {
        if timesteps == 0 {
            return Err(ModelError::InvalidConfiguration(format!(
                "Synapse group '{}': max dendritic delay must be at least one timestep",
                self.name
            )));
        }
        self.max_dendritic_delay_timesteps = timesteps;
        Ok(())
    }

    pub fn set_span_type(&mut self, span_type: SpanType) -> Result<()> {
        if self.matrix_type.is_sparse() || self.matrix_type.is_procedural() {
            self.span_type = span_type;
            Ok(())
        } else {
            Err(ModelError::InvalidConfiguration(format!(
                "Synapse group '{}': span type can only be set with sparse or procedural \
                 connectivity",
                self.name
            )))
        }
    }

    pub fn set_num_threads_per_spike(&mut self, num_threads: u32) -> Result<()> {
        if self.span_type == SpanType::Presynaptic {
            self.num_threads_per_spike = num_threads.max(1);
            Ok(())
        } else {
            Err(ModelError::InvalidConfiguration(format!(
                "Synapse group '{}': threads per spike can only be set with a presynaptic span",
                self.name
            )))
        }
    }

    pub(crate) fn set_back_prop_delay_steps_unchecked(&mut self, timesteps: u32) {
        self.back_prop_delay_steps = timesteps;
    }

    pub fn set_narrow_sparse_ind_enabled(&mut self, enabled: bool) -> Result<()> {
        if self.matrix_type.is_sparse() {
            self.narrow_sparse_ind = enabled;
            Ok(())
        } else {
            Err(ModelError::InvalidConfiguration(format!(
                "Synapse group '{}': narrow sparse indices can only be used with sparse \
                 connectivity",
                self.name
            )))
        }
    }

    pub fn set_event_threshold_retest_required(&mut self, required: bool) {
        self.event_threshold_retest_required = required;
    }

    pub(crate) fn set_pre_target_var_unchecked(&mut self, var: String) {
        self.pre_target_var = var;
    }

    pub(crate) fn set_post_target_var_unchecked(&mut self, var: String) {
        self.post_target_var = var;
    }

    // ---- locations ------------------------------------------------------

    pub fn in_syn_location(&self) -> VarLocation {
        self.in_syn_location
    }

    pub fn dendritic_delay_location(&self) -> VarLocation {
        self.dendritic_delay_location
    }

    pub fn sparse_connectivity_location(&self) -> VarLocation {
        self.sparse_connectivity_location
    }

    pub fn set_sparse_connectivity_location(&mut self, location: VarLocation) {
        self.sparse_connectivity_location = location;
    }

    pub fn wu_var_location(&self, var: &str) -> Result<VarLocation> {
        self.wu_var_locations
            .get(var)
            .copied()
            .ok_or_else(|| ModelError::UnknownVariable {
                group: self.name.clone(),
                var: var.to_string(),
            })
    }

    pub fn set_wu_var_location(&mut self, var: &str, location: VarLocation) -> Result<()> {
        match self.wu_var_locations.get_mut(var) {
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

    pub fn ps_var_location(&self, var: &str) -> Result<VarLocation> {
        self.ps_var_locations
            .get(var)
            .copied()
            .ok_or_else(|| ModelError::UnknownVariable {
                group: self.name.clone(),
                var: var.to_string(),
            })
    }

    pub fn set_ps_var_location(&mut self, var: &str, location: VarLocation) -> Result<()> {
        match self.ps_var_locations.get_mut(var) {
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

    pub fn wu_pre_var_location(&self, var: &str) -> Result<VarLocation> {
        self.wu_pre_var_locations
            .get(var)
            .copied()
            .ok_or_else(|| ModelError::UnknownVariable {
                group: self.name.clone(),
                var: var.to_string(),
            })
    }

    pub fn wu_post_var_location(&self, var: &str) -> Result<VarLocation> {
        self.wu_post_var_locations
            .get(var)
            .copied()
            .ok_or_else(|| ModelError::UnknownVariable {
                group: self.name.clone(),
                var: var.to_string(),
            })
    }

    pub fn is_zero_copy_in_use(&self) -> bool {
        self.wu_var_locations
            .values()
            .chain(self.wu_pre_var_locations.values())
            .chain(self.wu_post_var_locations.values())
            .chain(self.ps_var_locations.values())
            .any(|l| l.is_zero_copy())
    }

    // ---- fusion ---------------------------------------------------------

    /// Can this group's postsynaptic update share state with an
    /// equivalent group? Requires constant initialisers and no EGP
    /// reference in the PS code.
    pub fn can_ps_be_fused(&self) -> bool {
        if self
            .ps_var_initialisers
            .values()
            .any(|v| v.constant_value().is_none())
        {
            return false;
        }
        self.ps_model.extra_global_params.iter().all(|egp| {
            !self.ps_apply_input.references(&egp.name) && !self.ps_decay.references(&egp.name)
        })
    }

    /// Analogous predicate for the presynaptic weight-update state
    pub fn can_wu_pre_be_fused(&self) -> bool {
        if self
            .wu_pre_var_initialisers
            .values()
            .any(|v| v.constant_value().is_none())
        {
            return false;
        }
        self.wu_model.extra_global_params.iter().all(|egp| {
            !self.wu.pre_spike.references(&egp.name)
                && !self.wu.pre_dynamics.references(&egp.name)
        })
    }

    /// Analogous predicate for the postsynaptic weight-update state
    pub fn can_wu_post_be_fused(&self) -> bool {
        if self
            .wu_post_var_initialisers
            .values()
            .any(|v| v.constant_value().is_none())
        {
            return false;
        }
        self.wu_model.extra_global_params.iter().all(|egp| {
            !self.wu.post_spike.references(&egp.name)
                && !self.wu.post_dynamics.references(&egp.name)
        })
    }

    /// Archetype owning the fused `outPost` state (self when unfused)
    pub fn fused_ps_target(&self, own_id: SynapseGroupId) -> SynapseGroupId {
        self.fused_ps_target.unwrap_or(own_id)
    }

    pub fn fused_pre_output_target(&self, own_id: SynapseGroupId) -> SynapseGroupId {
        self.fused_pre_output_target.unwrap_or(own_id)
    }

    pub fn fused_wu_pre_target(&self, own_id: SynapseGroupId) -> SynapseGroupId {
        self.fused_wu_pre_target.unwrap_or(own_id)
    }

    pub fn fused_wu_post_target(&self, own_id: SynapseGroupId) -> SynapseGroupId {
        self.fused_wu_post_target.unwrap_or(own_id)
    }

    pub(crate) fn set_fused_ps_target(&mut self, target: SynapseGroupId) {
        self.fused_ps_target = Some(target);
    }

    pub(crate) fn set_fused_pre_output_target(&mut self, target: SynapseGroupId) {
        self.fused_pre_output_target = Some(target);
    }

    pub(crate) fn set_fused_wu_pre_target(&mut self, target: SynapseGroupId) {
        self.fused_wu_pre_target = Some(target);
    }

    pub(crate) fn set_fused_wu_post_target(&mut self, target: SynapseGroupId) {
        self.fused_wu_post_target = Some(target);
    }

    pub(crate) fn finalise(&mut self, dt: f64) {
        self.wu_derived_params = self
            .wu_model
            .derived_params
            .iter()
            .map(|d| (d.name.clone(), (d.func)(&self.wu_params, dt)))
            .collect();
        self.ps_derived_params = self
            .ps_model
            .derived_params
            .iter()
            .map(|d| (d.name.clone(), (d.func)(&self.ps_params, dt)))
            .collect();
        for init in self
            .wu_var_initialisers
            .values_mut()
            .chain(self.wu_pre_var_initialisers.values_mut())
            .chain(self.wu_post_var_initialisers.values_mut())
            .chain(self.ps_var_initialisers.values_mut())
        {
            init.finalise(dt);
        }
        self.connectivity_initialiser.finalise(dt);
        if let Some(toeplitz) = &mut self.toeplitz_initialiser {
            toeplitz.finalise(dt);
        }
    }

    // ---- digests ----------------------------------------------------------

    /// Digest for merging presynaptic-update / synapse-dynamics work
    pub fn wu_hash_digest(
        &self,
        src_delay_slots: u32,
        trg_delay_slots: u32,
        num_trg_neurons: u32,
        is_ps_fused: bool,
    ) -> HashDigest {
        let mut hash = HashBuilder::new("synapse-wu");
        hash.update_digest(&self.wu_model.hash_digest());
        hash.update_u32(self.delay_steps)
            .update_u32(self.back_prop_delay_steps)
            .update_u32(self.max_dendritic_delay_timesteps)
            .update_str(self.sparse_ind_type(num_trg_neurons).name())
            .update_u32(self.num_threads_per_spike)
            .update_bool(self.event_threshold_retest_required)
            .update_u32(self.span_type.hash_tag())
            .update_bool(is_ps_fused)
            .update_u32(src_delay_slots)
            .update_u32(trg_delay_slots)
            .update_u32(self.matrix_type.hash_tag());

        // Kernel dimensions appear as constants in emitted code
        hash.update_u32(self.kernel_size.len() as u32);
        for &dim in &self.kernel_size {
            hash.update_u32(dim);
        }

        // Procedural weights bake the initialiser shape into the kernel
        if self.matrix_type.has_procedural_weights() {
            for init in self.wu_var_initialisers.values() {
                hash.update_digest(&init.hash_digest());
            }
        }
        // Procedural connectivity bakes the build code in too
        if self.matrix_type.is_procedural() {
            hash.update_digest(&self.connectivity_initialiser.hash_digest());
        }
        if let Some(toeplitz) = &self.toeplitz_initialiser {
            hash.update_digest(&toeplitz.hash_digest());
        }
        hash.finalise()
    }

    /// Digest for merging presynaptic weight-update work in the neuron
    /// kernel
    pub fn wu_pre_hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("synapse-wu-pre");
        hash.update_digest(&self.wu_model.hash_digest());
        hash.update_bool(self.delay_steps != 0);
        hash.finalise()
    }

    /// Digest for merging postsynaptic weight-update work in the neuron
    /// kernel
    pub fn wu_post_hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("synapse-wu-post");
        hash.update_digest(&self.wu_model.hash_digest());
        hash.update_bool(self.back_prop_delay_steps != 0);
        hash.finalise()
    }

    /// Digest for merging postsynaptic-model work in the neuron kernel
    pub fn ps_hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("synapse-ps");
        hash.update_digest(&self.ps_model.hash_digest());
        hash.update_u32(self.max_dendritic_delay_timesteps)
            .update_bool(self.is_dendritic_delay_required())
            .update_str(&self.post_target_var);
        hash.finalise()
    }

    /// Digest for merging presynaptic-output accumulation
    pub fn pre_output_hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("synapse-pre-output");
        hash.update_str(&self.pre_target_var);
        hash.finalise()
    }

    /// Digest for merging dendritic-delay pointer updates
    pub fn dendritic_delay_update_hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("synapse-dendritic-delay-update");
        hash.update_u32(self.max_dendritic_delay_timesteps);
        hash.finalise()
    }

    /// Stricter digest deciding whether two postsynaptic-model
    /// *instances* fuse: includes constant initialiser values and the
    /// values of parameters the PS code actually references. Values of
    /// unreferenced parameters never contribute.
    pub fn ps_fuse_hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("synapse-ps-fuse");
        hash.update_digest(&self.ps_hash_digest());
        for (name, init) in &self.ps_var_initialisers {
            hash.update_str(name);
            if let Some(value) = init.constant_value() {
                hash.update_f64(value);
            }
        }
        let referenced =
            |name: &str| self.ps_apply_input.references(name) || self.ps_decay.references(name);
        for (name, value) in &self.ps_params {
            if referenced(name) {
                hash.update_str(name).update_f64(*value);
            }
        }
        for (name, value) in &self.ps_derived_params {
            if referenced(name) {
                hash.update_str(name).update_f64(*value);
            }
        }
        hash.finalise()
    }

    /// Fuse digest for presynaptic weight-update state
    pub fn wu_pre_fuse_hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("synapse-wu-pre-fuse");
        hash.update_digest(&self.wu_pre_hash_digest());
        hash.update_u32(self.delay_steps);
        for (name, init) in &self.wu_pre_var_initialisers {
            hash.update_str(name);
            if let Some(value) = init.constant_value() {
                hash.update_f64(value);
            }
        }
        let referenced =
            |name: &str| self.wu.pre_spike.references(name) || self.wu.pre_dynamics.references(name);
        for (name, value) in &self.wu_params {
            if referenced(name) {
                hash.update_str(name).update_f64(*value);
            }
        }
        for (name, value) in &self.wu_derived_params {
            if referenced(name) {
                hash.update_str(name).update_f64(*value);
            }
        }
        hash.finalise()
    }

    /// Fuse digest for postsynaptic weight-update state
    pub fn wu_post_fuse_hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("synapse-wu-post-fuse");
        hash.update_digest(&self.wu_post_hash_digest());
        hash.update_u32(self.back_prop_delay_steps);
        for (name, init) in &self.wu_post_var_initialisers {
            hash.update_str(name);
            if let Some(value) = init.constant_value() {
                hash.update_f64(value);
            }
        }
        let referenced = |name: &str| {
            self.wu.post_spike.references(name) || self.wu.post_dynamics.references(name)
        };
        for (name, value) in &self.wu_params {
            if referenced(name) {
                hash.update_str(name).update_f64(*value);
            }
        }
        for (name, value) in &self.wu_derived_params {
            if referenced(name) {
                hash.update_str(name).update_f64(*value);
            }
        }
        hash.finalise()
    }

    /// Digest for merging per-synapse variable initialisation
    pub fn wu_init_hash_digest(&self, num_trg_neurons: u32) -> HashDigest {
        let mut hash = HashBuilder::new("synapse-wu-init");
        hash.update_u32(self.matrix_type.hash_tag())
            .update_str(self.sparse_ind_type(num_trg_neurons).name());
        hash.update_u32(self.kernel_size.len() as u32);
        for &dim in &self.kernel_size {
            hash.update_u32(dim);
        }
        hash.update_u32(self.wu_model.vars.len() as u32);
        for var in &self.wu_model.vars {
            hash.update_str(&var.name)
                .update_str(&var.ty)
                .update_u32(var.access.hash_tag());
        }
        for (name, init) in &self.wu_var_initialisers {
            hash.update_str(name).update_digest(&init.hash_digest());
        }
        hash.finalise()
    }

    /// Digest for merging presynaptic variable initialisation
    pub fn wu_pre_init_hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("synapse-wu-pre-init");
        for var in &self.wu_model.pre_vars {
            hash.update_str(&var.name).update_str(&var.ty);
        }
        for (name, init) in &self.wu_pre_var_initialisers {
            hash.update_str(name).update_digest(&init.hash_digest());
        }
        hash.finalise()
    }

    /// Digest for merging postsynaptic variable initialisation
    pub fn wu_post_init_hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("synapse-wu-post-init");
        for var in &self.wu_model.post_vars {
            hash.update_str(&var.name).update_str(&var.ty);
        }
        for (name, init) in &self.wu_post_var_initialisers {
            hash.update_str(name).update_digest(&init.hash_digest());
        }
        hash.finalise()
    }

    /// Digest for merging postsynaptic-model variable initialisation
    pub fn ps_init_hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("synapse-ps-init");
        hash.update_u32(self.max_dendritic_delay_timesteps)
            .update_bool(self.is_dendritic_delay_required());
        for var in &self.ps_model.vars {
            hash.update_str(&var.name).update_str(&var.ty);
        }
        for (name, init) in &self.ps_var_initialisers {
            hash.update_str(name).update_digest(&init.hash_digest());
        }
        hash.finalise()
    }

    /// Digest for merging sparse / bitmask connectivity build work
    pub fn connectivity_init_hash_digest(&self, num_trg_neurons: u32) -> HashDigest {
        let mut hash = HashBuilder::new("synapse-connectivity-init");
        hash.update_digest(&self.connectivity_initialiser.hash_digest());
        hash.update_u32(self.matrix_type.hash_tag())
            .update_str(self.sparse_ind_type(num_trg_neurons).name());
        hash.finalise()
    }

    /// Digest over memory-placement choices
    pub fn var_location_hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("synapse-var-location");
        hash.update_u32(self.in_syn_location.hash_tag())
            .update_u32(self.dendritic_delay_location.hash_tag())
            .update_u32(self.sparse_connectivity_location.hash_tag());
        for locations in [
            &self.wu_var_locations,
            &self.wu_pre_var_locations,
            &self.wu_post_var_locations,
            &self.ps_var_locations,
            &self.wu_egp_locations,
            &self.ps_egp_locations,
        ] {
            for (name, location) in locations {
                hash.update_str(name).update_u32(location.hash_tag());
            }
        }
        hash.finalise()
    }
}
