// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Custom updates: user-defined passes over referenced variables,
//! executed out-of-band from neuron/synapse updates within a named
//! update group. Custom connectivity updates additionally rewrite a
//! synapse group's connectivity.

use crate::fragment::CodeFragment;
use crate::hash::{HashBuilder, HashDigest};
use crate::init::VarInit;
use crate::model::{NeuronGroupId, SynapseGroupId};
use crate::snippet::{CustomConnectivityUpdateModel, CustomUpdateModel, ParamValues};
use crate::var_access::{VarAccessMode, VarLocation};
use crate::{CurrentSourceId, ModelError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Stable custom-update handle within a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CustomUpdateId(pub usize);

/// Stable weight-update custom-update handle within a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CustomUpdateWuId(pub usize);

/// Stable custom-connectivity-update handle within a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CustomConnectivityUpdateId(pub usize);

/// What a custom-update variable reference points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarRefTarget {
    NeuronVar { group: NeuronGroupId, var: String },
    CurrentSourceVar { source: CurrentSourceId, var: String },
    PsmVar { group: SynapseGroupId, var: String },
    WuPreVar { group: SynapseGroupId, var: String },
    WuPostVar { group: SynapseGroupId, var: String },
    CustomUpdateVar { update: CustomUpdateId, var: String },
}

/// A resolved per-element variable reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarReference {
    pub target: VarRefTarget,
    pub access: VarAccessMode,
}

/// A reference into a synapse group's per-synapse state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WuVarReference {
    pub group: SynapseGroupId,
    pub var: String,
    pub access: VarAccessMode,
}

/// A user-defined pass over per-element state
#[derive(Debug)]
pub struct CustomUpdate {
    name: String,
    update_group_name: String,
    model: Arc<CustomUpdateModel>,
    params: ParamValues,
    derived_params: ParamValues,
    var_initialisers: BTreeMap<String, VarInit>,
    var_references: BTreeMap<String, VarReference>,
    update_code: CodeFragment,
    /// Element count shared by every referenced variable
    size: u32,
    /// Whether state is duplicated across batches
    batched: bool,
    var_locations: BTreeMap<String, VarLocation>,
}

impl CustomUpdate {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        update_group_name: String,
        model: Arc<CustomUpdateModel>,
        params: ParamValues,
        var_initialisers: BTreeMap<String, VarInit>,
        var_references: BTreeMap<String, VarReference>,
        size: u32,
        batched: bool,
        default_var_location: VarLocation,
    ) -> Result<Self> {
        model.validate()?;
        for def in &model.var_refs {
            if !var_references.contains_key(&def.name) {
                return Err(ModelError::MissingParameter {
                    group: name.clone(),
                    param: def.name.clone(),
                });
            }
        }
        let update_code = CodeFragment::scan(
            &model.update_code,
            &format!("Custom update '{}' update code", name),
        )?;
        let var_locations = model
            .vars
            .iter()
            .map(|v| (v.name.clone(), default_var_location))
            .collect();
        Ok(Self {
            name,
            update_group_name,
            model,
            params,
            derived_params: ParamValues::new(),
            var_initialisers,
            var_references,
            update_code,
            size,
            batched,
            var_locations,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn update_group_name(&self) -> &str {
        &self.update_group_name
    }

    pub fn model(&self) -> &Arc<CustomUpdateModel> {
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

    pub fn var_references(&self) -> &BTreeMap<String, VarReference> {
        &self.var_references
    }

    pub fn update_code(&self) -> &CodeFragment {
        &self.update_code
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_batched(&self) -> bool {
        self.batched
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

    pub fn is_zero_copy_in_use(&self) -> bool {
        self.var_locations.values().any(|l| l.is_zero_copy())
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

    /// Digest for merging custom-update work within one update group
    pub fn hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("custom-update");
        hash.update_digest(&self.model.hash_digest());
        hash.update_str(&self.update_group_name)
            .update_bool(self.batched);
        // Reference shapes affect indexing, not their concrete targets
        for (name, reference) in &self.var_references {
            hash.update_str(name);
            let tag = match reference.target {
                VarRefTarget::NeuronVar { .. } => 0u32,
                VarRefTarget::CurrentSourceVar { .. } => 1,
                VarRefTarget::PsmVar { .. } => 2,
                VarRefTarget::WuPreVar { .. } => 3,
                VarRefTarget::WuPostVar { .. } => 4,
                VarRefTarget::CustomUpdateVar { .. } => 5,
            };
            hash.update_u32(tag);
        }
        hash.finalise()
    }

    /// Digest for merging custom-update initialisation
    pub fn init_hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("custom-update-init");
        for (name, init) in &self.var_initialisers {
            hash.update_str(name).update_digest(&init.hash_digest());
        }
        hash.update_bool(self.batched);
        hash.finalise()
    }
}

/// A user-defined pass over per-synapse state
#[derive(Debug)]
pub struct CustomUpdateWu {
    name: String,
    update_group_name: String,
    model: Arc<CustomUpdateModel>,
    params: ParamValues,
    derived_params: ParamValues,
    var_initialisers: BTreeMap<String, VarInit>,
    var_references: BTreeMap<String, WuVarReference>,
    update_code: CodeFragment,
    /// The synapse group every reference resolves into
    synapse_group: SynapseGroupId,
    var_locations: BTreeMap<String, VarLocation>,
}

impl CustomUpdateWu {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        update_group_name: String,
        model: Arc<CustomUpdateModel>,
        params: ParamValues,
        var_initialisers: BTreeMap<String, VarInit>,
        var_references: BTreeMap<String, WuVarReference>,
        synapse_group: SynapseGroupId,
        default_var_location: VarLocation,
    ) -> Result<Self> {
        model.validate()?;
        for def in &model.var_refs {
            if !var_references.contains_key(&def.name) {
                return Err(ModelError::MissingParameter {
                    group: name.clone(),
                    param: def.name.clone(),
                });
            }
        }
        let update_code = CodeFragment::scan(
            &model.update_code,
            &format!("Custom update '{}' update code", name),
        )?;
        let var_locations = model
            .vars
            .iter()
            .map(|v| (v.name.clone(), default_var_location))
            .collect();
        Ok(Self {
            name,
            update_group_name,
            model,
            params,
            derived_params: ParamValues::new(),
            var_initialisers,
            var_references,
            update_code,
            synapse_group,
            var_locations,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn update_group_name(&self) -> &str {
        &self.update_group_name
    }

    pub fn model(&self) -> &Arc<CustomUpdateModel> {
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

    pub fn var_references(&self) -> &BTreeMap<String, WuVarReference> {
        &self.var_references
    }

    pub fn update_code(&self) -> &CodeFragment {
        &self.update_code
    }

    pub fn synapse_group(&self) -> SynapseGroupId {
        self.synapse_group
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

    pub fn hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("custom-update-wu");
        hash.update_digest(&self.model.hash_digest());
        hash.update_str(&self.update_group_name);
        hash.finalise()
    }

    pub fn init_hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("custom-update-wu-init");
        for (name, init) in &self.var_initialisers {
            hash.update_str(name).update_digest(&init.hash_digest());
        }
        hash.finalise()
    }
}

/// A user-defined pass that rewrites a synapse group's rows
#[derive(Debug)]
pub struct CustomConnectivityUpdate {
    name: String,
    update_group_name: String,
    model: Arc<CustomConnectivityUpdateModel>,
    params: ParamValues,
    derived_params: ParamValues,
    var_initialisers: BTreeMap<String, VarInit>,
    pre_var_initialisers: BTreeMap<String, VarInit>,
    post_var_initialisers: BTreeMap<String, VarInit>,
    var_references: BTreeMap<String, WuVarReference>,
    row_update_code: CodeFragment,
    synapse_group: SynapseGroupId,
}

impl CustomConnectivityUpdate {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        update_group_name: String,
        model: Arc<CustomConnectivityUpdateModel>,
        params: ParamValues,
        var_initialisers: BTreeMap<String, VarInit>,
        pre_var_initialisers: BTreeMap<String, VarInit>,
        post_var_initialisers: BTreeMap<String, VarInit>,
        var_references: BTreeMap<String, WuVarReference>,
        synapse_group: SynapseGroupId,
    ) -> Result<Self> {
        model.validate()?;
        let row_update_code = CodeFragment::scan(
            &model.row_update_code,
            &format!("Custom connectivity update '{}' row update code", name),
        )?;
        Ok(Self {
            name,
            update_group_name,
            model,
            params,
            derived_params: ParamValues::new(),
            var_initialisers,
            pre_var_initialisers,
            post_var_initialisers,
            var_references,
            row_update_code,
            synapse_group,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn update_group_name(&self) -> &str {
        &self.update_group_name
    }

    pub fn model(&self) -> &Arc<CustomConnectivityUpdateModel> {
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

    pub fn pre_var_initialisers(&self) -> &BTreeMap<String, VarInit> {
        &self.pre_var_initialisers
    }

    pub fn post_var_initialisers(&self) -> &BTreeMap<String, VarInit> {
        &self.post_var_initialisers
    }

    pub fn var_references(&self) -> &BTreeMap<String, WuVarReference> {
        &self.var_references
    }

    pub fn row_update_code(&self) -> &CodeFragment {
        &self.row_update_code
    }

    pub fn synapse_group(&self) -> SynapseGroupId {
        self.synapse_group
    }

    pub(crate) fn finalise(&mut self, dt: f64) {
        self.derived_params = self
            .model
            .derived_params
            .iter()
            .map(|d| (d.name.clone(), (d.func)(&self.params, dt)))
            .collect();
        for init in self
            .var_initialisers
            .values_mut()
            .chain(self.pre_var_initialisers.values_mut())
            .chain(self.post_var_initialisers.values_mut())
        {
            init.finalise(dt);
        }
    }

    pub fn hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("custom-connectivity-update");
        hash.update_digest(&self.model.hash_digest());
        hash.update_str(&self.update_group_name);
        hash.finalise()
    }
}
