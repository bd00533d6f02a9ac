// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Snippet definitions: the capability surface shared by every model
//! kind (parameters, derived parameters, state variables with access
//! modes, extra global parameters, code fragments) plus the concrete
//! neuron / weight-update / postsynaptic / current-source /
//! custom-update / initialisation snippet types.
//!
//! Snippets are immutable definitions shared through `Arc`; the groups
//! in the model IR bind them to concrete parameter values and variable
//! initialisers.

use crate::hash::{HashBuilder, HashDigest};
use crate::var_access::{VarAccess, VarAccessMode};
use crate::{ModelError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Parameter values bound to a group, keyed by parameter name.
/// Ordered so digests are deterministic.
pub type ParamValues = BTreeMap<String, f64>;

/// Closure evaluated once at finalise with the frozen parameter map and
/// the integration step
pub type DerivedParamFn = Arc<dyn Fn(&ParamValues, f64) -> f64 + Send + Sync>;

/// A derived parameter: a name plus its evaluation closure
#[derive(Clone)]
pub struct DerivedParam {
    pub name: String,
    pub func: DerivedParamFn,
}

impl DerivedParam {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&ParamValues, f64) -> f64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for DerivedParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedParam")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A state variable: name, symbolic type, access mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Var {
    pub name: String,
    pub ty: String,
    pub access: VarAccess,
}

impl Var {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            access: VarAccess::ReadWrite,
        }
    }

    pub fn with_access(name: impl Into<String>, ty: impl Into<String>, access: VarAccess) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            access,
        }
    }
}

/// An extra global parameter: a user-managed array shared by the whole
/// group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraGlobalParam {
    pub name: String,
    /// Element type; the parameter itself is a pointer to this
    pub ty: String,
}

/// An additional per-neuron input accumulator beside `Isyn`
#[derive(Debug, Clone, PartialEq)]
pub struct AdditionalInputVar {
    pub name: String,
    pub ty: String,
    /// Value the accumulator resets to at the top of each update
    pub init_value: f64,
}

/// A variable reference slot in a custom update model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarRefDef {
    pub name: String,
    pub ty: String,
    pub access: VarAccessMode,
}

/// Verify that supplied parameter values exactly cover the declared
/// parameter names
pub(crate) fn check_param_values(
    group: &str,
    declared: &[String],
    supplied: &ParamValues,
) -> Result<()> {
    for name in declared {
        if !supplied.contains_key(name) {
            return Err(ModelError::MissingParameter {
                group: group.to_string(),
                param: name.clone(),
            });
        }
    }
    for name in supplied.keys() {
        if !declared.contains(name) {
            return Err(ModelError::UnknownParameter {
                group: group.to_string(),
                param: name.clone(),
            });
        }
    }
    Ok(())
}

fn check_unique<'a>(
    kind: &'static str,
    names: impl Iterator<Item = &'a str>,
) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for name in names {
        if name.is_empty() {
            return Err(ModelError::InvalidConfiguration(format!(
                "{} names must be non-empty",
                kind
            )));
        }
        if !seen.insert(name) {
            return Err(ModelError::DuplicateName {
                kind,
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

fn update_vars_hash(vars: &[Var], hash: &mut HashBuilder) {
    hash.update_u32(vars.len() as u32);
    for v in vars {
        hash.update_str(&v.name)
            .update_str(&v.ty)
            .update_u32(v.access.hash_tag());
    }
}

fn update_params_hash(params: &[String], derived: &[DerivedParam], hash: &mut HashBuilder) {
    hash.update_u32(params.len() as u32);
    for p in params {
        hash.update_str(p);
    }
    hash.update_u32(derived.len() as u32);
    for d in derived {
        hash.update_str(&d.name);
    }
}

fn update_egps_hash(egps: &[ExtraGlobalParam], hash: &mut HashBuilder) {
    hash.update_u32(egps.len() as u32);
    for e in egps {
        hash.update_str(&e.name).update_str(&e.ty);
    }
}

// ---------------------------------------------------------------------
// NeuronModel
// ---------------------------------------------------------------------

/// Neuron model: membrane update, threshold condition, reset
#[derive(Debug, Clone, Default)]
pub struct NeuronModel {
    pub name: String,
    pub params: Vec<String>,
    pub derived_params: Vec<DerivedParam>,
    pub vars: Vec<Var>,
    pub extra_global_params: Vec<ExtraGlobalParam>,
    pub additional_input_vars: Vec<AdditionalInputVar>,
    pub sim_code: String,
    pub threshold_condition_code: String,
    pub reset_code: String,
    /// Suppress re-triggering while the threshold condition stays true
    pub auto_refractory_required: bool,
}

impl NeuronModel {
    pub fn validate(&self) -> Result<()> {
        check_unique(
            "neuron model symbol",
            self.params
                .iter()
                .map(String::as_str)
                .chain(self.derived_params.iter().map(|d| d.name.as_str()))
                .chain(self.vars.iter().map(|v| v.name.as_str()))
                .chain(self.extra_global_params.iter().map(|e| e.name.as_str()))
                .chain(self.additional_input_vars.iter().map(|v| v.name.as_str())),
        )
    }

    pub fn var(&self, name: &str) -> Option<&Var> {
        self.vars.iter().find(|v| v.name == name)
    }

    pub fn hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("neuron-model");
        update_params_hash(&self.params, &self.derived_params, &mut hash);
        update_vars_hash(&self.vars, &mut hash);
        update_egps_hash(&self.extra_global_params, &mut hash);
        hash.update_u32(self.additional_input_vars.len() as u32);
        for v in &self.additional_input_vars {
            hash.update_str(&v.name)
                .update_str(&v.ty)
                .update_f64(v.init_value);
        }
        hash.update_str(&self.sim_code)
            .update_str(&self.threshold_condition_code)
            .update_str(&self.reset_code)
            .update_bool(self.auto_refractory_required);
        hash.finalise()
    }
}

// ---------------------------------------------------------------------
// WeightUpdateModel
// ---------------------------------------------------------------------

/// Weight update model: per-synapse spike/event processing, synapse
/// dynamics, and pre/postsynaptic state updates
#[derive(Debug, Clone, Default)]
pub struct WeightUpdateModel {
    pub name: String,
    pub params: Vec<String>,
    pub derived_params: Vec<DerivedParam>,
    /// Per-synapse state
    pub vars: Vec<Var>,
    /// Per-source-neuron state
    pub pre_vars: Vec<Var>,
    /// Per-target-neuron state
    pub post_vars: Vec<Var>,
    pub extra_global_params: Vec<ExtraGlobalParam>,
    /// Run for each presynaptic spike passing through a synapse
    pub sim_code: String,
    /// Run for each spike-like event passing through a synapse
    pub event_code: String,
    /// Condition deciding whether a presynaptic neuron emits an event
    pub event_threshold_condition_code: String,
    /// Run per synapse on postsynaptic spike (back-propagated learning)
    pub learn_post_code: String,
    /// Run per synapse every timestep
    pub synapse_dynamics_code: String,
    /// Run per source neuron when it spikes
    pub pre_spike_code: String,
    /// Run per target neuron when it spikes
    pub post_spike_code: String,
    /// Run per source neuron every timestep
    pub pre_dynamics_code: String,
    /// Run per target neuron every timestep
    pub post_dynamics_code: String,
}

impl WeightUpdateModel {
    pub fn validate(&self) -> Result<()> {
        check_unique(
            "weight update model symbol",
            self.params
                .iter()
                .map(String::as_str)
                .chain(self.derived_params.iter().map(|d| d.name.as_str()))
                .chain(self.vars.iter().map(|v| v.name.as_str()))
                .chain(self.pre_vars.iter().map(|v| v.name.as_str()))
                .chain(self.post_vars.iter().map(|v| v.name.as_str()))
                .chain(self.extra_global_params.iter().map(|e| e.name.as_str())),
        )
    }

    pub fn var(&self, name: &str) -> Option<&Var> {
        self.vars.iter().find(|v| v.name == name)
    }

    pub fn hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("weight-update-model");
        update_params_hash(&self.params, &self.derived_params, &mut hash);
        update_vars_hash(&self.vars, &mut hash);
        update_vars_hash(&self.pre_vars, &mut hash);
        update_vars_hash(&self.post_vars, &mut hash);
        update_egps_hash(&self.extra_global_params, &mut hash);
        for code in [
            &self.sim_code,
            &self.event_code,
            &self.event_threshold_condition_code,
            &self.learn_post_code,
            &self.synapse_dynamics_code,
            &self.pre_spike_code,
            &self.post_spike_code,
            &self.pre_dynamics_code,
            &self.post_dynamics_code,
        ] {
            hash.update_str(code);
        }
        hash.finalise()
    }
}

// ---------------------------------------------------------------------
// PostsynapticModel
// ---------------------------------------------------------------------

/// Postsynaptic model: converts accumulated synaptic input into neuron
/// input and decays the accumulator
#[derive(Debug, Clone, Default)]
pub struct PostsynapticModel {
    pub name: String,
    pub params: Vec<String>,
    pub derived_params: Vec<DerivedParam>,
    pub vars: Vec<Var>,
    pub extra_global_params: Vec<ExtraGlobalParam>,
    /// Applies `inSyn` to the neuron's chosen input variable
    pub apply_input_code: String,
    /// Decays / resets `inSyn` after application
    pub decay_code: String,
}

impl PostsynapticModel {
    pub fn validate(&self) -> Result<()> {
        check_unique(
            "postsynaptic model symbol",
            self.params
                .iter()
                .map(String::as_str)
                .chain(self.derived_params.iter().map(|d| d.name.as_str()))
                .chain(self.vars.iter().map(|v| v.name.as_str()))
                .chain(self.extra_global_params.iter().map(|e| e.name.as_str())),
        )
    }

    pub fn var(&self, name: &str) -> Option<&Var> {
        self.vars.iter().find(|v| v.name == name)
    }

    pub fn hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("postsynaptic-model");
        update_params_hash(&self.params, &self.derived_params, &mut hash);
        update_vars_hash(&self.vars, &mut hash);
        update_egps_hash(&self.extra_global_params, &mut hash);
        hash.update_str(&self.apply_input_code)
            .update_str(&self.decay_code);
        hash.finalise()
    }
}

// ---------------------------------------------------------------------
// CurrentSourceModel
// ---------------------------------------------------------------------

/// Current source model: per-neuron input injection
#[derive(Debug, Clone, Default)]
pub struct CurrentSourceModel {
    pub name: String,
    pub params: Vec<String>,
    pub derived_params: Vec<DerivedParam>,
    pub vars: Vec<Var>,
    pub extra_global_params: Vec<ExtraGlobalParam>,
    pub injection_code: String,
}

impl CurrentSourceModel {
    pub fn validate(&self) -> Result<()> {
        check_unique(
            "current source model symbol",
            self.params
                .iter()
                .map(String::as_str)
                .chain(self.derived_params.iter().map(|d| d.name.as_str()))
                .chain(self.vars.iter().map(|v| v.name.as_str()))
                .chain(self.extra_global_params.iter().map(|e| e.name.as_str())),
        )
    }

    pub fn hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("current-source-model");
        update_params_hash(&self.params, &self.derived_params, &mut hash);
        update_vars_hash(&self.vars, &mut hash);
        update_egps_hash(&self.extra_global_params, &mut hash);
        hash.update_str(&self.injection_code);
        hash.finalise()
    }
}

// ---------------------------------------------------------------------
// CustomUpdateModel
// ---------------------------------------------------------------------

/// Custom update model: a user-defined pass over referenced variables,
/// run out-of-band within a named update group
#[derive(Debug, Clone, Default)]
pub struct CustomUpdateModel {
    pub name: String,
    pub params: Vec<String>,
    pub derived_params: Vec<DerivedParam>,
    pub vars: Vec<Var>,
    pub var_refs: Vec<VarRefDef>,
    pub extra_global_params: Vec<ExtraGlobalParam>,
    pub update_code: String,
}

impl CustomUpdateModel {
    pub fn validate(&self) -> Result<()> {
        check_unique(
            "custom update model symbol",
            self.params
                .iter()
                .map(String::as_str)
                .chain(self.derived_params.iter().map(|d| d.name.as_str()))
                .chain(self.vars.iter().map(|v| v.name.as_str()))
                .chain(self.var_refs.iter().map(|v| v.name.as_str()))
                .chain(self.extra_global_params.iter().map(|e| e.name.as_str())),
        )
    }

    pub fn hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("custom-update-model");
        update_params_hash(&self.params, &self.derived_params, &mut hash);
        update_vars_hash(&self.vars, &mut hash);
        hash.update_u32(self.var_refs.len() as u32);
        for r in &self.var_refs {
            hash.update_str(&r.name).update_str(&r.ty).update_bool(
                matches!(r.access, VarAccessMode::ReadOnly),
            );
        }
        update_egps_hash(&self.extra_global_params, &mut hash);
        hash.update_str(&self.update_code);
        hash.finalise()
    }
}

// ---------------------------------------------------------------------
// CustomConnectivityUpdateModel
// ---------------------------------------------------------------------

/// Custom connectivity update model: a user-defined pass over a synapse
/// group's rows, able to add and remove synapses
#[derive(Debug, Clone, Default)]
pub struct CustomConnectivityUpdateModel {
    pub name: String,
    pub params: Vec<String>,
    pub derived_params: Vec<DerivedParam>,
    pub vars: Vec<Var>,
    pub pre_vars: Vec<Var>,
    pub post_vars: Vec<Var>,
    pub var_refs: Vec<VarRefDef>,
    pub extra_global_params: Vec<ExtraGlobalParam>,
    pub row_update_code: String,
}

impl CustomConnectivityUpdateModel {
    pub fn validate(&self) -> Result<()> {
        check_unique(
            "custom connectivity update model symbol",
            self.params
                .iter()
                .map(String::as_str)
                .chain(self.derived_params.iter().map(|d| d.name.as_str()))
                .chain(self.vars.iter().map(|v| v.name.as_str()))
                .chain(self.pre_vars.iter().map(|v| v.name.as_str()))
                .chain(self.post_vars.iter().map(|v| v.name.as_str()))
                .chain(self.var_refs.iter().map(|v| v.name.as_str()))
                .chain(self.extra_global_params.iter().map(|e| e.name.as_str())),
        )
    }

    pub fn hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("custom-connectivity-update-model");
        update_params_hash(&self.params, &self.derived_params, &mut hash);
        update_vars_hash(&self.vars, &mut hash);
        update_vars_hash(&self.pre_vars, &mut hash);
        update_vars_hash(&self.post_vars, &mut hash);
        update_egps_hash(&self.extra_global_params, &mut hash);
        hash.update_str(&self.row_update_code);
        hash.finalise()
    }
}

// ---------------------------------------------------------------------
// VarInitSnippet
// ---------------------------------------------------------------------

/// Variable initialisation snippet. The code assigns the `value`
/// identifier.
#[derive(Debug, Clone, Default)]
pub struct VarInitSnippet {
    pub name: String,
    pub params: Vec<String>,
    pub derived_params: Vec<DerivedParam>,
    pub extra_global_params: Vec<ExtraGlobalParam>,
    pub code: String,
}

impl VarInitSnippet {
    pub fn hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("var-init-snippet");
        update_params_hash(&self.params, &self.derived_params, &mut hash);
        update_egps_hash(&self.extra_global_params, &mut hash);
        hash.update_str(&self.code);
        hash.finalise()
    }
}

// ---------------------------------------------------------------------
// SparseConnectivitySnippet
// ---------------------------------------------------------------------

/// Closure computing a row/column length bound from the population
/// sizes and snippet parameters
pub type CalcMaxLengthFn = Arc<dyn Fn(u32, u32, &ParamValues) -> u32 + Send + Sync>;

/// Closure computing kernel dimensions from snippet parameters
pub type CalcKernelSizeFn = Arc<dyn Fn(&ParamValues) -> Vec<u32> + Send + Sync>;

/// Sparse connectivity initialisation snippet: row-wise and optionally
/// column-wise build code
#[derive(Clone, Default)]
pub struct SparseConnectivitySnippet {
    pub name: String,
    pub params: Vec<String>,
    pub derived_params: Vec<DerivedParam>,
    pub extra_global_params: Vec<ExtraGlobalParam>,
    pub row_build_code: String,
    pub col_build_code: String,
    pub calc_max_row_length: Option<CalcMaxLengthFn>,
    pub calc_max_col_length: Option<CalcMaxLengthFn>,
    pub calc_kernel_size: Option<CalcKernelSizeFn>,
}

impl fmt::Debug for SparseConnectivitySnippet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseConnectivitySnippet")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl SparseConnectivitySnippet {
    pub fn hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("sparse-connectivity-snippet");
        update_params_hash(&self.params, &self.derived_params, &mut hash);
        update_egps_hash(&self.extra_global_params, &mut hash);
        hash.update_str(&self.row_build_code)
            .update_str(&self.col_build_code);
        hash.finalise()
    }
}

// ---------------------------------------------------------------------
// ToeplitzConnectivitySnippet
// ---------------------------------------------------------------------

/// Toeplitz connectivity snippet: diagonal build code over a kernel
#[derive(Clone, Default)]
pub struct ToeplitzConnectivitySnippet {
    pub name: String,
    pub params: Vec<String>,
    pub derived_params: Vec<DerivedParam>,
    pub diagonal_build_code: String,
    pub calc_max_row_length: Option<CalcMaxLengthFn>,
    pub calc_kernel_size: Option<CalcKernelSizeFn>,
}

impl fmt::Debug for ToeplitzConnectivitySnippet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToeplitzConnectivitySnippet")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ToeplitzConnectivitySnippet {
    pub fn hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("toeplitz-connectivity-snippet");
        update_params_hash(&self.params, &self.derived_params, &mut hash);
        hash.update_str(&self.diagonal_build_code);
        hash.finalise()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_symbol_rejected() {
        let model = NeuronModel {
            name: "bad".into(),
            params: vec!["a".into()],
            vars: vec![Var::new("a", "scalar")],
            ..Default::default()
        };
        assert!(matches!(
            model.validate(),
            Err(ModelError::DuplicateName { .. })
        ));
    }

    #[test]
    fn test_hash_ignores_model_name() {
        let a = NeuronModel {
            name: "a".into(),
            sim_code: "V += 1.0;".into(),
            ..Default::default()
        };
        let b = NeuronModel {
            name: "b".into(),
            sim_code: "V += 1.0;".into(),
            ..Default::default()
        };
        assert_eq!(a.hash_digest(), b.hash_digest());
    }

    #[test]
    fn test_hash_sensitive_to_code() {
        let a = NeuronModel {
            sim_code: "V += 1.0;".into(),
            ..Default::default()
        };
        let b = NeuronModel {
            sim_code: "V += 2.0;".into(),
            ..Default::default()
        };
        assert_ne!(a.hash_digest(), b.hash_digest());
    }

    #[test]
    fn test_hash_sensitive_to_access_mode() {
        let a = NeuronModel {
            vars: vec![Var::new("V", "scalar")],
            ..Default::default()
        };
        let b = NeuronModel {
            vars: vec![Var::with_access("V", "scalar", VarAccess::ReadOnly)],
            ..Default::default()
        };
        assert_ne!(a.hash_digest(), b.hash_digest());
    }
}
