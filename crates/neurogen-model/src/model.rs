// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! The model arena.
//!
//! [`Model`] exclusively owns every group; groups reference each other
//! by stable index. All mutation goes through the arena so the frozen
//! guard is enforced in one place. [`Model::finalise`] evaluates
//! derived-parameter closures, infers delay-queue and spike-time
//! requirements from consumer code, runs the fusion pass and freezes
//! the IR; a second call is a no-op.

use crate::current_source::{CurrentSource, CurrentSourceId};
use crate::custom_update::{
    CustomConnectivityUpdate, CustomConnectivityUpdateId, CustomUpdate, CustomUpdateId,
    CustomUpdateWu, CustomUpdateWuId, VarRefTarget, VarReference, WuVarReference,
};
use crate::hash::{HashBuilder, HashDigest};
use crate::init::{ConnectivityInit, ToeplitzInit, VarInit};
use crate::matrix::SynapseMatrixType;
use crate::neuron_group::NeuronGroup;
use crate::snippet::{
    check_param_values, CurrentSourceModel, CustomConnectivityUpdateModel, CustomUpdateModel,
    NeuronModel, ParamValues, PostsynapticModel, Var, WeightUpdateModel,
};
use crate::synapse_group::{SynapseGroup, SynapseGroupArgs};
use crate::var_access::VarLocation;
use crate::{ModelError, Result};
use neurogen_types::{ScalarPrecision, TimePrecision, TypeContext};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Stable neuron-group handle within a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NeuronGroupId(pub usize);

/// Stable synapse-group handle within a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SynapseGroupId(pub usize);

/// Description of a synapse population for [`Model::add_synapse_population`]
pub struct SynapsePopulation {
    pub name: String,
    pub matrix_type: SynapseMatrixType,
    /// Axonal delay in timesteps; 0 means no delay
    pub delay_steps: u32,
    pub source: String,
    pub target: String,
    pub wu_model: Arc<WeightUpdateModel>,
    pub wu_params: ParamValues,
    pub wu_var_initialisers: BTreeMap<String, VarInit>,
    pub wu_pre_var_initialisers: BTreeMap<String, VarInit>,
    pub wu_post_var_initialisers: BTreeMap<String, VarInit>,
    pub ps_model: Arc<PostsynapticModel>,
    pub ps_params: ParamValues,
    pub ps_var_initialisers: BTreeMap<String, VarInit>,
    /// Defaults to uninitialised connectivity when absent
    pub connectivity_initialiser: Option<ConnectivityInit>,
    pub toeplitz_initialiser: Option<ToeplitzInit>,
}

/// A neuronal network model
pub struct Model {
    name: String,
    precision: ScalarPrecision,
    time_precision: TimePrecision,
    dt: f64,
    batch_size: u32,
    seed: u32,
    timing_enabled: bool,

    default_var_location: VarLocation,
    default_egp_location: VarLocation,
    default_sparse_connectivity_location: VarLocation,
    default_narrow_sparse_ind: bool,
    fuse_postsynaptic_models: bool,
    fuse_pre_post_weight_update_models: bool,

    neuron_groups: Vec<NeuronGroup>,
    synapse_groups: Vec<SynapseGroup>,
    current_sources: Vec<CurrentSource>,
    custom_updates: Vec<CustomUpdate>,
    custom_wu_updates: Vec<CustomUpdateWu>,
    custom_connectivity_updates: Vec<CustomConnectivityUpdate>,

    finalised: bool,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            precision: ScalarPrecision::Float,
            time_precision: TimePrecision::Default,
            dt: 0.1,
            batch_size: 1,
            seed: 0,
            timing_enabled: false,
            default_var_location: VarLocation::HostDevice,
            default_egp_location: VarLocation::HostDevice,
            default_sparse_connectivity_location: VarLocation::HostDevice,
            default_narrow_sparse_ind: false,
            fuse_postsynaptic_models: false,
            fuse_pre_post_weight_update_models: false,
            neuron_groups: Vec::new(),
            synapse_groups: Vec::new(),
            current_sources: Vec::new(),
            custom_updates: Vec::new(),
            custom_wu_updates: Vec::new(),
            custom_connectivity_updates: Vec::new(),
            finalised: false,
        }
    }

    // ---- configuration ------------------------------------------------

    fn check_mutable(&self) -> Result<()> {
        if self.finalised {
            Err(ModelError::Frozen)
        } else {
            Ok(())
        }
    }

    pub fn set_precision(&mut self, precision: ScalarPrecision) -> Result<()> {
        self.check_mutable()?;
        self.precision = precision;
        Ok(())
    }

    pub fn set_time_precision(&mut self, time_precision: TimePrecision) -> Result<()> {
        self.check_mutable()?;
        self.time_precision = time_precision;
        Ok(())
    }

    pub fn set_dt(&mut self, dt: f64) -> Result<()> {
        self.check_mutable()?;
        if dt <= 0.0 {
            return Err(ModelError::InvalidConfiguration(
                "integration step must be positive".to_string(),
            ));
        }
        self.dt = dt;
        Ok(())
    }

    pub fn set_batch_size(&mut self, batch_size: u32) -> Result<()> {
        self.check_mutable()?;
        if batch_size == 0 {
            return Err(ModelError::InvalidConfiguration(
                "batch size must be at least 1".to_string(),
            ));
        }
        self.batch_size = batch_size;
        Ok(())
    }

    /// Seed for the simulation RNG; 0 selects automatic seeding
    pub fn set_seed(&mut self, seed: u32) -> Result<()> {
        self.check_mutable()?;
        self.seed = seed;
        Ok(())
    }

    pub fn set_timing(&mut self, enabled: bool) -> Result<()> {
        self.check_mutable()?;
        self.timing_enabled = enabled;
        Ok(())
    }

    pub fn set_default_var_location(&mut self, location: VarLocation) -> Result<()> {
        self.check_mutable()?;
        self.default_var_location = location;
        Ok(())
    }

    pub fn set_default_extra_global_param_location(
        &mut self,
        location: VarLocation,
    ) -> Result<()> {
        self.check_mutable()?;
        self.default_egp_location = location;
        Ok(())
    }

    pub fn set_default_sparse_connectivity_location(
        &mut self,
        location: VarLocation,
    ) -> Result<()> {
        self.check_mutable()?;
        self.default_sparse_connectivity_location = location;
        Ok(())
    }

    pub fn set_default_narrow_sparse_ind_enabled(&mut self, enabled: bool) -> Result<()> {
        self.check_mutable()?;
        self.default_narrow_sparse_ind = enabled;
        Ok(())
    }

    /// Fuse compatible postsynaptic models and dendritic delay buffers.
    /// Cuts neuron-update cost, but per-synapse-group `outPost` arrays
    /// can no longer be retrieved individually.
    pub fn set_fuse_postsynaptic_models(&mut self, fuse: bool) -> Result<()> {
        self.check_mutable()?;
        self.fuse_postsynaptic_models = fuse;
        Ok(())
    }

    /// Fuse compatible pre- and postsynaptic weight-update state; the
    /// same retrieval caveat applies
    pub fn set_fuse_pre_post_weight_update_models(&mut self, fuse: bool) -> Result<()> {
        self.check_mutable()?;
        self.fuse_pre_post_weight_update_models = fuse;
        Ok(())
    }

    // ---- getters ------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn precision(&self) -> ScalarPrecision {
        self.precision
    }

    pub fn time_precision(&self) -> TimePrecision {
        self.time_precision
    }

    pub fn type_context(&self) -> TypeContext {
        TypeContext::new(self.precision, self.time_precision)
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn is_timing_enabled(&self) -> bool {
        self.timing_enabled
    }

    pub fn is_finalised(&self) -> bool {
        self.finalised
    }

    pub fn should_fuse_postsynaptic_models(&self) -> bool {
        self.fuse_postsynaptic_models
    }

    pub fn should_fuse_pre_post_weight_update_models(&self) -> bool {
        self.fuse_pre_post_weight_update_models
    }

    /// Total neurons across all populations
    pub fn num_neurons(&self) -> u64 {
        self.neuron_groups
            .iter()
            .map(|n| n.num_neurons() as u64)
            .sum()
    }

    /// Any state anywhere placed in zero-copy memory?
    pub fn zero_copy_in_use(&self) -> bool {
        self.neuron_groups.iter().any(|n| n.is_zero_copy_in_use())
            || self.synapse_groups.iter().any(|s| s.is_zero_copy_in_use())
            || self.current_sources.iter().any(|c| c.is_zero_copy_in_use())
            || self.custom_updates.iter().any(|c| c.is_zero_copy_in_use())
    }

    /// Spike recording enabled on any population?
    pub fn recording_in_use(&self) -> bool {
        self.neuron_groups
            .iter()
            .any(|n| n.is_spike_recording_enabled() || n.is_spike_event_recording_enabled())
    }

    // ---- group access --------------------------------------------------

    pub fn neuron_group(&self, id: NeuronGroupId) -> &NeuronGroup {
        &self.neuron_groups[id.0]
    }

    pub fn neuron_group_mut(&mut self, id: NeuronGroupId) -> Result<&mut NeuronGroup> {
        self.check_mutable()?;
        Ok(&mut self.neuron_groups[id.0])
    }

    pub fn synapse_group(&self, id: SynapseGroupId) -> &SynapseGroup {
        &self.synapse_groups[id.0]
    }

    pub fn synapse_group_mut(&mut self, id: SynapseGroupId) -> Result<&mut SynapseGroup> {
        self.check_mutable()?;
        Ok(&mut self.synapse_groups[id.0])
    }

    pub fn current_source(&self, id: CurrentSourceId) -> &CurrentSource {
        &self.current_sources[id.0]
    }

    pub fn current_source_mut(&mut self, id: CurrentSourceId) -> Result<&mut CurrentSource> {
        self.check_mutable()?;
        Ok(&mut self.current_sources[id.0])
    }

    pub fn custom_update(&self, id: CustomUpdateId) -> &CustomUpdate {
        &self.custom_updates[id.0]
    }

    pub fn custom_update_mut(&mut self, id: CustomUpdateId) -> Result<&mut CustomUpdate> {
        self.check_mutable()?;
        Ok(&mut self.custom_updates[id.0])
    }

    pub fn custom_wu_update(&self, id: CustomUpdateWuId) -> &CustomUpdateWu {
        &self.custom_wu_updates[id.0]
    }

    pub fn custom_connectivity_update(
        &self,
        id: CustomConnectivityUpdateId,
    ) -> &CustomConnectivityUpdate {
        &self.custom_connectivity_updates[id.0]
    }

    pub fn neuron_groups(&self) -> impl Iterator<Item = (NeuronGroupId, &NeuronGroup)> {
        self.neuron_groups
            .iter()
            .enumerate()
            .map(|(i, g)| (NeuronGroupId(i), g))
    }

    pub fn synapse_groups(&self) -> impl Iterator<Item = (SynapseGroupId, &SynapseGroup)> {
        self.synapse_groups
            .iter()
            .enumerate()
            .map(|(i, g)| (SynapseGroupId(i), g))
    }

    pub fn current_sources(&self) -> impl Iterator<Item = (CurrentSourceId, &CurrentSource)> {
        self.current_sources
            .iter()
            .enumerate()
            .map(|(i, g)| (CurrentSourceId(i), g))
    }

    pub fn custom_updates(&self) -> impl Iterator<Item = (CustomUpdateId, &CustomUpdate)> {
        self.custom_updates
            .iter()
            .enumerate()
            .map(|(i, g)| (CustomUpdateId(i), g))
    }

    pub fn custom_wu_updates(&self) -> impl Iterator<Item = (CustomUpdateWuId, &CustomUpdateWu)> {
        self.custom_wu_updates
            .iter()
            .enumerate()
            .map(|(i, g)| (CustomUpdateWuId(i), g))
    }

    pub fn custom_connectivity_updates(
        &self,
    ) -> impl Iterator<Item = (CustomConnectivityUpdateId, &CustomConnectivityUpdate)> {
        self.custom_connectivity_updates
            .iter()
            .enumerate()
            .map(|(i, g)| (CustomConnectivityUpdateId(i), g))
    }

    pub fn find_neuron_group(&self, name: &str) -> Option<NeuronGroupId> {
        self.neuron_groups
            .iter()
            .position(|g| g.name() == name)
            .map(NeuronGroupId)
    }

    pub fn find_synapse_group(&self, name: &str) -> Option<SynapseGroupId> {
        self.synapse_groups
            .iter()
            .position(|g| g.name() == name)
            .map(SynapseGroupId)
    }

    pub fn find_current_source(&self, name: &str) -> Option<CurrentSourceId> {
        self.current_sources
            .iter()
            .position(|g| g.name() == name)
            .map(CurrentSourceId)
    }

    /// Update-group names across all custom update kinds, sorted and
    /// deduplicated
    pub fn custom_update_group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .custom_updates
            .iter()
            .map(|c| c.update_group_name().to_string())
            .chain(
                self.custom_wu_updates
                    .iter()
                    .map(|c| c.update_group_name().to_string()),
            )
            .chain(
                self.custom_connectivity_updates
                    .iter()
                    .map(|c| c.update_group_name().to_string()),
            )
            .collect();
        names.sort();
        names.dedup();
        names
    }

    // ---- population construction ---------------------------------------

    fn check_population_name(&self, name: &str, kind: &'static str) -> Result<()> {
        if name.is_empty() {
            return Err(ModelError::InvalidConfiguration(format!(
                "{} names must be non-empty",
                kind
            )));
        }
        let duplicate = self.neuron_groups.iter().any(|g| g.name() == name)
            && kind == "neuron group"
            || self.synapse_groups.iter().any(|g| g.name() == name) && kind == "synapse group"
            || self.current_sources.iter().any(|g| g.name() == name) && kind == "current source"
            || (kind == "custom update"
                && (self.custom_updates.iter().any(|g| g.name() == name)
                    || self.custom_wu_updates.iter().any(|g| g.name() == name)
                    || self
                        .custom_connectivity_updates
                        .iter()
                        .any(|g| g.name() == name)));
        if duplicate {
            return Err(ModelError::DuplicateName {
                kind,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn check_var_initialisers(
        group: &str,
        vars: &[Var],
        initialisers: &BTreeMap<String, VarInit>,
    ) -> Result<()> {
        for var in vars {
            if !initialisers.contains_key(&var.name) {
                return Err(ModelError::IncompatibleInitialiser(format!(
                    "'{}' is missing an initialiser for variable '{}'",
                    group, var.name
                )));
            }
        }
        for name in initialisers.keys() {
            if !vars.iter().any(|v| &v.name == name) {
                return Err(ModelError::UnknownVariable {
                    group: group.to_string(),
                    var: name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Add a neuron population
    pub fn add_neuron_population(
        &mut self,
        name: impl Into<String>,
        size: u32,
        model: Arc<NeuronModel>,
        params: ParamValues,
        var_initialisers: BTreeMap<String, VarInit>,
    ) -> Result<NeuronGroupId> {
        self.check_mutable()?;
        let name = name.into();
        self.check_population_name(&name, "neuron group")?;
        check_param_values(&name, &model.params, &params)?;
        Self::check_var_initialisers(&name, &model.vars, &var_initialisers)?;

        let group = NeuronGroup::new(
            name,
            size,
            model,
            params,
            var_initialisers,
            self.default_var_location,
            self.default_egp_location,
        )?;
        self.neuron_groups.push(group);
        Ok(NeuronGroupId(self.neuron_groups.len() - 1))
    }

    /// Add a synapse population connecting two existing neuron groups
    pub fn add_synapse_population(
        &mut self,
        population: SynapsePopulation,
    ) -> Result<SynapseGroupId> {
        self.check_mutable()?;
        self.check_population_name(&population.name, "synapse group")?;

        let src = self
            .find_neuron_group(&population.source)
            .ok_or_else(|| ModelError::UnknownGroup {
                kind: "neuron group",
                name: population.source.clone(),
            })?;
        let trg = self
            .find_neuron_group(&population.target)
            .ok_or_else(|| ModelError::UnknownGroup {
                kind: "neuron group",
                name: population.target.clone(),
            })?;

        check_param_values(
            &population.name,
            &population.wu_model.params,
            &population.wu_params,
        )?;
        check_param_values(
            &population.name,
            &population.ps_model.params,
            &population.ps_params,
        )?;
        Self::check_var_initialisers(
            &population.name,
            &population.wu_model.vars,
            &population.wu_var_initialisers,
        )?;
        Self::check_var_initialisers(
            &population.name,
            &population.wu_model.pre_vars,
            &population.wu_pre_var_initialisers,
        )?;
        Self::check_var_initialisers(
            &population.name,
            &population.wu_model.post_vars,
            &population.wu_post_var_initialisers,
        )?;
        Self::check_var_initialisers(
            &population.name,
            &population.ps_model.vars,
            &population.ps_var_initialisers,
        )?;

        // Global weights come from constant initialisers only
        if population.matrix_type.weight == crate::matrix::SynapseMatrixWeight::Global {
            for (name, init) in &population.wu_var_initialisers {
                if init.constant_value().is_none() {
                    return Err(ModelError::IncompatibleInitialiser(format!(
                        "Synapse group '{}': variable '{}' must use a constant initialiser \
                         with global weights",
                        population.name, name
                    )));
                }
            }
        }

        let delay_steps = population.delay_steps;
        let group = SynapseGroup::new(SynapseGroupArgs {
            name: population.name,
            matrix_type: population.matrix_type,
            delay_steps,
            src,
            trg,
            num_src_neurons: self.neuron_groups[src.0].num_neurons(),
            num_trg_neurons: self.neuron_groups[trg.0].num_neurons(),
            wu_model: population.wu_model,
            wu_params: population.wu_params,
            wu_var_initialisers: population.wu_var_initialisers,
            wu_pre_var_initialisers: population.wu_pre_var_initialisers,
            wu_post_var_initialisers: population.wu_post_var_initialisers,
            ps_model: population.ps_model,
            ps_params: population.ps_params,
            ps_var_initialisers: population.ps_var_initialisers,
            connectivity_initialiser: population
                .connectivity_initialiser
                .unwrap_or_else(ConnectivityInit::uninitialised),
            toeplitz_initialiser: population.toeplitz_initialiser,
            default_var_location: self.default_var_location,
            default_egp_location: self.default_egp_location,
            default_sparse_connectivity_location: self.default_sparse_connectivity_location,
            default_narrow_sparse_ind: self.default_narrow_sparse_ind,
        })?;

        let id = SynapseGroupId(self.synapse_groups.len());
        self.synapse_groups.push(group);
        self.neuron_groups[src.0].add_out_syn(id);
        self.neuron_groups[src.0].check_num_delay_slots(delay_steps);
        self.neuron_groups[trg.0].add_in_syn(id);
        Ok(id)
    }

    /// Add a current source attached to an existing neuron group
    pub fn add_current_source(
        &mut self,
        name: impl Into<String>,
        model: Arc<CurrentSourceModel>,
        target: &str,
        params: ParamValues,
        var_initialisers: BTreeMap<String, VarInit>,
    ) -> Result<CurrentSourceId> {
        self.check_mutable()?;
        let name = name.into();
        self.check_population_name(&name, "current source")?;
        let target_id = self
            .find_neuron_group(target)
            .ok_or_else(|| ModelError::UnknownGroup {
                kind: "neuron group",
                name: target.to_string(),
            })?;
        check_param_values(&name, &model.params, &params)?;
        Self::check_var_initialisers(&name, &model.vars, &var_initialisers)?;

        let source = CurrentSource::new(
            name,
            target_id,
            model,
            params,
            var_initialisers,
            self.default_var_location,
        )?;
        let id = CurrentSourceId(self.current_sources.len());
        self.current_sources.push(source);
        self.neuron_groups[target_id.0].add_current_source(id);
        Ok(id)
    }

    /// Add a custom update over per-element variable references
    pub fn add_custom_update(
        &mut self,
        name: impl Into<String>,
        update_group_name: impl Into<String>,
        model: Arc<CustomUpdateModel>,
        params: ParamValues,
        var_initialisers: BTreeMap<String, VarInit>,
        var_references: BTreeMap<String, VarReference>,
    ) -> Result<CustomUpdateId> {
        self.check_mutable()?;
        let name = name.into();
        self.check_population_name(&name, "custom update")?;
        check_param_values(&name, &model.params, &params)?;
        Self::check_var_initialisers(&name, &model.vars, &var_initialisers)?;

        // Every reference must resolve and agree on element count
        let mut size: Option<u32> = None;
        let mut batched = false;
        for (ref_name, reference) in &var_references {
            let (ref_size, ref_batched) = self.resolve_var_reference(&name, reference)?;
            if let Some(expected) = size {
                if expected != ref_size {
                    return Err(ModelError::InvalidConfiguration(format!(
                        "Custom update '{}': variable reference '{}' spans {} elements but \
                         earlier references span {}",
                        name, ref_name, ref_size, expected
                    )));
                }
            }
            size = Some(ref_size);
            batched |= ref_batched;
        }
        let size = size.ok_or_else(|| {
            ModelError::InvalidConfiguration(format!(
                "Custom update '{}' must reference at least one variable",
                name
            ))
        })?;

        let update = CustomUpdate::new(
            name,
            update_group_name.into(),
            model,
            params,
            var_initialisers,
            var_references,
            size,
            batched,
            self.default_var_location,
        )?;
        self.custom_updates.push(update);
        Ok(CustomUpdateId(self.custom_updates.len() - 1))
    }

    /// Add a custom update over per-synapse variable references
    pub fn add_custom_wu_update(
        &mut self,
        name: impl Into<String>,
        update_group_name: impl Into<String>,
        model: Arc<CustomUpdateModel>,
        params: ParamValues,
        var_initialisers: BTreeMap<String, VarInit>,
        var_references: BTreeMap<String, WuVarReference>,
    ) -> Result<CustomUpdateWuId> {
        self.check_mutable()?;
        let name = name.into();
        self.check_population_name(&name, "custom update")?;
        check_param_values(&name, &model.params, &params)?;
        Self::check_var_initialisers(&name, &model.vars, &var_initialisers)?;

        // All references must land in the same synapse group
        let mut group: Option<SynapseGroupId> = None;
        for (ref_name, reference) in &var_references {
            if reference.group.0 >= self.synapse_groups.len() {
                return Err(ModelError::UnknownGroup {
                    kind: "synapse group",
                    name: format!("#{}", reference.group.0),
                });
            }
            let sg = &self.synapse_groups[reference.group.0];
            if sg.wu_model().var(&reference.var).is_none() {
                return Err(ModelError::UnknownVariable {
                    group: sg.name().to_string(),
                    var: reference.var.clone(),
                });
            }
            if let Some(expected) = group {
                if expected != reference.group {
                    return Err(ModelError::InvalidConfiguration(format!(
                        "Custom update '{}': variable reference '{}' crosses synapse groups",
                        name, ref_name
                    )));
                }
            }
            group = Some(reference.group);
        }
        let group = group.ok_or_else(|| {
            ModelError::InvalidConfiguration(format!(
                "Custom update '{}' must reference at least one variable",
                name
            ))
        })?;

        let update = CustomUpdateWu::new(
            name,
            update_group_name.into(),
            model,
            params,
            var_initialisers,
            var_references,
            group,
            self.default_var_location,
        )?;
        self.custom_wu_updates.push(update);
        Ok(CustomUpdateWuId(self.custom_wu_updates.len() - 1))
    }

    /// Add a custom connectivity update targeting an existing synapse
    /// group
    #[allow(clippy::too_many_arguments)]
    pub fn add_custom_connectivity_update(
        &mut self,
        name: impl Into<String>,
        update_group_name: impl Into<String>,
        target_synapse_group: &str,
        model: Arc<CustomConnectivityUpdateModel>,
        params: ParamValues,
        var_initialisers: BTreeMap<String, VarInit>,
        pre_var_initialisers: BTreeMap<String, VarInit>,
        post_var_initialisers: BTreeMap<String, VarInit>,
        var_references: BTreeMap<String, WuVarReference>,
    ) -> Result<CustomConnectivityUpdateId> {
        self.check_mutable()?;
        let name = name.into();
        self.check_population_name(&name, "custom update")?;
        let target = self
            .find_synapse_group(target_synapse_group)
            .ok_or_else(|| ModelError::UnknownGroup {
                kind: "synapse group",
                name: target_synapse_group.to_string(),
            })?;
        if !self.synapse_groups[target.0].matrix_type().is_sparse() {
            return Err(ModelError::InvalidMatrixType(format!(
                "Custom connectivity update '{}' requires sparse connectivity on its \
                 target synapse group",
                name
            )));
        }
        check_param_values(&name, &model.params, &params)?;

        let update = CustomConnectivityUpdate::new(
            name,
            update_group_name.into(),
            model,
            params,
            var_initialisers,
            pre_var_initialisers,
            post_var_initialisers,
            var_references,
            target,
        )?;
        self.custom_connectivity_updates.push(update);
        Ok(CustomConnectivityUpdateId(
            self.custom_connectivity_updates.len() - 1,
        ))
    }

    fn resolve_var_reference(
        &self,
        update_name: &str,
        reference: &VarReference,
    ) -> Result<(u32, bool)> {
        let unknown_var = |group: String, var: &str| ModelError::UnknownVariable {
            group,
            var: var.to_string(),
        };
        match &reference.target {
            VarRefTarget::NeuronVar { group, var } => {
                let ng = &self.neuron_groups[group.0];
                let v = ng
                    .model()
                    .var(var)
                    .ok_or_else(|| unknown_var(ng.name().to_string(), var))?;
                Ok((ng.num_neurons(), v.access.dims().batch))
            }
            VarRefTarget::CurrentSourceVar { source, var } => {
                let cs = &self.current_sources[source.0];
                if !cs.model().vars.iter().any(|v| &v.name == var) {
                    return Err(unknown_var(cs.name().to_string(), var));
                }
                let ng = &self.neuron_groups[cs.target().0];
                Ok((ng.num_neurons(), true))
            }
            VarRefTarget::PsmVar { group, var } => {
                let sg = &self.synapse_groups[group.0];
                if sg.ps_model().var(var).is_none() {
                    return Err(unknown_var(sg.name().to_string(), var));
                }
                let trg = &self.neuron_groups[sg.trg().0];
                Ok((trg.num_neurons(), true))
            }
            VarRefTarget::WuPreVar { group, var } => {
                let sg = &self.synapse_groups[group.0];
                if !sg.wu_model().pre_vars.iter().any(|v| &v.name == var) {
                    return Err(unknown_var(sg.name().to_string(), var));
                }
                let src = &self.neuron_groups[sg.src().0];
                Ok((src.num_neurons(), true))
            }
            VarRefTarget::WuPostVar { group, var } => {
                let sg = &self.synapse_groups[group.0];
                if !sg.wu_model().post_vars.iter().any(|v| &v.name == var) {
                    return Err(unknown_var(sg.name().to_string(), var));
                }
                let trg = &self.neuron_groups[sg.trg().0];
                Ok((trg.num_neurons(), true))
            }
            VarRefTarget::CustomUpdateVar { update, var } => {
                let cu = self.custom_updates.get(update.0).ok_or_else(|| {
                    ModelError::UnknownGroup {
                        kind: "custom update",
                        name: format!("referenced by '{}'", update_name),
                    }
                })?;
                if !cu.model().vars.iter().any(|v| &v.name == var) {
                    return Err(unknown_var(cu.name().to_string(), var));
                }
                Ok((cu.size(), cu.is_batched()))
            }
        }
    }

    // ---- cross-group setters --------------------------------------------

    /// Set the back-propagation delay, growing the target group's delay
    /// buffer to match
    pub fn set_back_prop_delay_steps(
        &mut self,
        id: SynapseGroupId,
        timesteps: u32,
    ) -> Result<()> {
        self.check_mutable()?;
        let trg = self.synapse_groups[id.0].trg();
        self.synapse_groups[id.0].set_back_prop_delay_steps_unchecked(timesteps);
        self.neuron_groups[trg.0].check_num_delay_slots(timesteps);
        Ok(())
    }

    /// Choose which source-neuron input variable presynaptic output
    /// accumulates into
    pub fn set_pre_target_var(&mut self, id: SynapseGroupId, var: &str) -> Result<()> {
        self.check_mutable()?;
        let src = self.synapse_groups[id.0].src();
        if !self.neuron_groups[src.0].supports_target_var(var) {
            return Err(ModelError::UnknownTargetVariable {
                group: self.neuron_groups[src.0].name().to_string(),
                var: var.to_string(),
            });
        }
        self.synapse_groups[id.0].set_pre_target_var_unchecked(var.to_string());
        Ok(())
    }

    /// Choose which target-neuron input variable postsynaptic output
    /// accumulates into
    pub fn set_post_target_var(&mut self, id: SynapseGroupId, var: &str) -> Result<()> {
        self.check_mutable()?;
        let trg = self.synapse_groups[id.0].trg();
        if !self.neuron_groups[trg.0].supports_target_var(var) {
            return Err(ModelError::UnknownTargetVariable {
                group: self.neuron_groups[trg.0].name().to_string(),
                var: var.to_string(),
            });
        }
        self.synapse_groups[id.0].set_post_target_var_unchecked(var.to_string());
        Ok(())
    }

    /// Choose which target-neuron input variable a current source
    /// injects into
    pub fn set_current_source_target_var(
        &mut self,
        id: CurrentSourceId,
        var: &str,
    ) -> Result<()> {
        self.check_mutable()?;
        let target = self.current_sources[id.0].target();
        if !self.neuron_groups[target.0].supports_target_var(var) {
            return Err(ModelError::UnknownTargetVariable {
                group: self.neuron_groups[target.0].name().to_string(),
                var: var.to_string(),
            });
        }
        self.current_sources[id.0].set_target_var_unchecked(var.to_string());
        Ok(())
    }

    // ---- digest wrappers -------------------------------------------------

    pub fn synapse_wu_hash_digest(&self, id: SynapseGroupId) -> HashDigest {
        let sg = &self.synapse_groups[id.0];
        let src = &self.neuron_groups[sg.src().0];
        let trg = &self.neuron_groups[sg.trg().0];
        sg.wu_hash_digest(
            src.num_delay_slots(),
            trg.num_delay_slots(),
            trg.num_neurons(),
            sg.fused_ps_target(id) != id,
        )
    }

    pub fn synapse_wu_init_hash_digest(&self, id: SynapseGroupId) -> HashDigest {
        let sg = &self.synapse_groups[id.0];
        let trg = &self.neuron_groups[sg.trg().0];
        sg.wu_init_hash_digest(trg.num_neurons())
    }

    pub fn synapse_connectivity_init_hash_digest(&self, id: SynapseGroupId) -> HashDigest {
        let sg = &self.synapse_groups[id.0];
        let trg = &self.neuron_groups[sg.trg().0];
        sg.connectivity_init_hash_digest(trg.num_neurons())
    }

    /// Model-wide digest for change detection: covers structure and
    /// concrete parameter values
    pub fn hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("model");
        hash.update_str(&self.name)
            .update_f64(self.dt)
            .update_u32(self.batch_size)
            .update_u32(self.seed)
            .update_bool(self.timing_enabled)
            .update_u32(self.precision.numeric_type().rank())
            .update_u32(self.type_context().time_type().numeric_value().map_or(0, |n| n.rank()));
        for group in &self.neuron_groups {
            hash.update_str(group.name())
                .update_u32(group.num_neurons())
                .update_digest(&group.hash_digest());
            for (name, value) in group.params() {
                hash.update_str(name).update_f64(*value);
            }
        }
        for (id, group) in self.synapse_groups.iter().enumerate() {
            hash.update_str(group.name())
                .update_digest(&self.synapse_wu_hash_digest(SynapseGroupId(id)))
                .update_digest(&group.ps_fuse_hash_digest());
            for (name, value) in group.wu_params() {
                hash.update_str(name).update_f64(*value);
            }
        }
        for source in &self.current_sources {
            hash.update_str(source.name())
                .update_digest(&source.hash_digest());
            for (name, value) in source.params() {
                hash.update_str(name).update_f64(*value);
            }
        }
        for update in &self.custom_updates {
            hash.update_str(update.name())
                .update_digest(&update.hash_digest());
        }
        hash.finalise()
    }

    // ---- finalise ---------------------------------------------------------

    /// Compute derived parameters, infer delay and spike-time
    /// requirements, run the fusion pass and freeze the IR.
    /// Idempotent: a second call is a no-op.
    pub fn finalise(&mut self, dt: f64) -> Result<()> {
        if self.finalised {
            return Ok(());
        }
        if dt <= 0.0 {
            return Err(ModelError::InvalidConfiguration(
                "integration step must be positive".to_string(),
            ));
        }
        self.dt = dt;

        for group in &mut self.neuron_groups {
            group.finalise(dt);
        }
        for group in &mut self.synapse_groups {
            group.finalise(dt);
        }
        for source in &mut self.current_sources {
            source.finalise(dt);
        }
        for update in &mut self.custom_updates {
            update.finalise(dt);
        }
        for update in &mut self.custom_wu_updates {
            update.finalise(dt);
        }
        for update in &mut self.custom_connectivity_updates {
            update.finalise(dt);
        }

        self.infer_consumer_requirements();
        self.run_fusion_pass();

        self.finalised = true;
        info!(
            model = %self.name,
            neuron_groups = self.neuron_groups.len(),
            synapse_groups = self.synapse_groups.len(),
            "model finalised"
        );
        Ok(())
    }

    /// Walk every weight-update fragment and mark which source/target
    /// state its identifiers pull across a delay
    fn infer_consumer_requirements(&mut self) {
        for sg_index in 0..self.synapse_groups.len() {
            let (src, trg) = {
                let sg = &self.synapse_groups[sg_index];
                (sg.src(), sg.trg())
            };

            let sg = &self.synapse_groups[sg_index];
            let src_vars: Vec<String> = self.neuron_groups[src.0]
                .model()
                .vars
                .iter()
                .map(|v| v.name.clone())
                .collect();
            let trg_vars: Vec<String> = self.neuron_groups[trg.0]
                .model()
                .vars
                .iter()
                .map(|v| v.name.clone())
                .collect();

            let mut src_queue = Vec::new();
            let mut trg_queue = Vec::new();
            let mut flags = [false; 6];
            for fragment in sg.all_wu_fragments() {
                for var in &src_vars {
                    if fragment.references(&format!("{}_pre", var)) {
                        src_queue.push(var.clone());
                    }
                }
                for var in &trg_vars {
                    if fragment.references(&format!("{}_post", var)) {
                        trg_queue.push(var.clone());
                    }
                }
                flags[0] |= fragment.references("st_pre");
                flags[1] |= fragment.references("prev_st_pre");
                flags[2] |= fragment.references("st_post");
                flags[3] |= fragment.references("prev_st_post");
                flags[4] |= fragment.references("set_pre");
                flags[5] |= fragment.references("prev_set_pre");
            }
            let true_spike = sg.is_true_spike_required();
            let spike_event = sg.is_spike_event_required();

            for var in src_queue {
                self.neuron_groups[src.0].set_var_queue_required(&var);
            }
            for var in trg_queue {
                self.neuron_groups[trg.0].set_var_queue_required(&var);
            }
            if flags[0] {
                self.neuron_groups[src.0].set_spike_time_required(false);
            }
            if flags[1] {
                self.neuron_groups[src.0].set_spike_time_required(true);
            }
            if flags[2] {
                self.neuron_groups[trg.0].set_spike_time_required(false);
            }
            if flags[3] {
                self.neuron_groups[trg.0].set_spike_time_required(true);
            }
            if flags[4] {
                self.neuron_groups[src.0].set_spike_event_time_required(false);
            }
            if flags[5] {
                self.neuron_groups[src.0].set_spike_event_time_required(true);
            }
            if true_spike {
                self.neuron_groups[src.0].set_true_spike_required();
            }
            if spike_event {
                self.neuron_groups[src.0].set_spike_event_required();
            }
        }
    }

    /// Partition each neuron group's connected synapse groups by fuse
    /// digest and elect archetypes. Groups that cannot fuse become
    /// their own singleton archetype; that is never an error.
    fn run_fusion_pass(&mut self) {
        for ng_index in 0..self.neuron_groups.len() {
            let in_syn: Vec<SynapseGroupId> = self.neuron_groups[ng_index].in_syn().to_vec();
            let out_syn: Vec<SynapseGroupId> = self.neuron_groups[ng_index].out_syn().to_vec();

            // Incoming postsynaptic models share outPost + dendritic
            // delay state
            let psm = self.fuse(
                &in_syn,
                self.fuse_postsynaptic_models,
                |_| true,
                |sg| sg.can_ps_be_fused(),
                |sg| sg.ps_fuse_hash_digest(),
                SynapseGroup::set_fused_ps_target,
            );

            // Outgoing groups writing presynaptic output share outPre
            let pre_output = self.fuse(
                &out_syn,
                self.fuse_postsynaptic_models,
                |sg| sg.is_pre_output_required(),
                |_| true,
                |sg| sg.pre_output_hash_digest(),
                SynapseGroup::set_fused_pre_output_target,
            );

            // Outgoing groups with presynaptic weight-update state
            let wu_pre = self.fuse(
                &out_syn,
                self.fuse_pre_post_weight_update_models,
                |sg| sg.has_wu_pre_state(),
                |sg| sg.can_wu_pre_be_fused(),
                |sg| sg.wu_pre_fuse_hash_digest(),
                SynapseGroup::set_fused_wu_pre_target,
            );

            // Incoming groups with postsynaptic weight-update state
            let wu_post = self.fuse(
                &in_syn,
                self.fuse_pre_post_weight_update_models,
                |sg| sg.has_wu_post_state(),
                |sg| sg.can_wu_post_be_fused(),
                |sg| sg.wu_post_fuse_hash_digest(),
                SynapseGroup::set_fused_wu_post_target,
            );

            self.neuron_groups[ng_index].set_fused_lists(psm, pre_output, wu_pre, wu_post);
        }
    }

    fn fuse(
        &mut self,
        candidates: &[SynapseGroupId],
        fuse_enabled: bool,
        participates: impl Fn(&SynapseGroup) -> bool,
        can_fuse: impl Fn(&SynapseGroup) -> bool,
        digest: impl Fn(&SynapseGroup) -> HashDigest,
        set_target: impl Fn(&mut SynapseGroup, SynapseGroupId),
    ) -> Vec<SynapseGroupId> {
        let mut archetypes: Vec<SynapseGroupId> = Vec::new();
        let mut partitions: Vec<(HashDigest, SynapseGroupId)> = Vec::new();

        for &id in candidates {
            let sg = &self.synapse_groups[id.0];
            if !participates(sg) {
                continue;
            }
            if fuse_enabled && can_fuse(sg) {
                let key = digest(sg);
                if let Some(&(_, archetype)) = partitions.iter().find(|(d, _)| *d == key) {
                    set_target(&mut self.synapse_groups[id.0], archetype);
                    debug!(
                        group = %self.synapse_groups[id.0].name(),
                        archetype = %self.synapse_groups[archetype.0].name(),
                        "fused synapse group state"
                    );
                    continue;
                }
                partitions.push((key, id));
            }
            set_target(&mut self.synapse_groups[id.0], id);
            archetypes.push(id);
        }
        archetypes
    }
}
