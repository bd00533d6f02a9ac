// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Current sources: per-neuron input not sourced from a synapse.

use crate::fragment::CodeFragment;
use crate::hash::{HashBuilder, HashDigest};
use crate::init::VarInit;
use crate::model::NeuronGroupId;
use crate::snippet::{CurrentSourceModel, ParamValues};
use crate::var_access::VarLocation;
use crate::{ModelError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Stable current-source handle within a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CurrentSourceId(pub usize);

/// An injection attached to one neuron group
#[derive(Debug)]
pub struct CurrentSource {
    name: String,
    target: NeuronGroupId,
    model: Arc<CurrentSourceModel>,
    params: ParamValues,
    derived_params: ParamValues,
    var_initialisers: BTreeMap<String, VarInit>,
    injection_code: CodeFragment,
    /// Which neuron input accumulator the injection feeds
    target_var: String,
    var_locations: BTreeMap<String, VarLocation>,
}

impl CurrentSource {
    pub(crate) fn new(
        name: String,
        target: NeuronGroupId,
        model: Arc<CurrentSourceModel>,
        params: ParamValues,
        var_initialisers: BTreeMap<String, VarInit>,
        default_var_location: VarLocation,
    ) -> Result<Self> {
        model.validate()?;
        let injection_code = CodeFragment::scan(
            &model.injection_code,
            &format!("Current source '{}' injection code", name),
        )?;
        let var_locations = model
            .vars
            .iter()
            .map(|v| (v.name.clone(), default_var_location))
            .collect();
        Ok(Self {
            name,
            target,
            model,
            params,
            derived_params: ParamValues::new(),
            var_initialisers,
            injection_code,
            target_var: "Isyn".to_string(),
            var_locations,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> NeuronGroupId {
        self.target
    }

    pub fn model(&self) -> &Arc<CurrentSourceModel> {
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

    pub fn injection_code(&self) -> &CodeFragment {
        &self.injection_code
    }

    pub fn target_var(&self) -> &str {
        &self.target_var
    }

    pub(crate) fn set_target_var_unchecked(&mut self, var: String) {
        self.target_var = var;
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

    pub fn is_init_rng_required(&self) -> bool {
        self.var_initialisers.values().any(|v| v.is_rng_required())
    }

    pub fn is_sim_rng_required(&self) -> bool {
        self.injection_code.is_rng_required()
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

    /// Digest for merging current-source work into neuron update groups
    pub fn hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("current-source");
        hash.update_digest(&self.model.hash_digest());
        hash.update_str(&self.target_var);
        hash.finalise()
    }

    /// Digest for merging current-source initialisation
    pub fn init_hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("current-source-init");
        for (name, init) in &self.var_initialisers {
            hash.update_str(name).update_digest(&init.hash_digest());
        }
        hash.finalise()
    }

    /// Digest over memory-placement choices
    pub fn var_location_hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("current-source-var-location");
        for (name, location) in &self.var_locations {
            hash.update_str(name).update_u32(location.hash_tag());
        }
        hash.finalise()
    }
}
