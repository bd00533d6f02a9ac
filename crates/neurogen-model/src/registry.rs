// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Explicit snippet registry.
//!
//! Models and snippets are looked up by name through a registry that is
//! passed around explicitly; there is no global registration state. A
//! registry pre-populated with the stock library is one call away.

use crate::models;
use crate::snippet::{
    CurrentSourceModel, NeuronModel, PostsynapticModel, SparseConnectivitySnippet,
    ToeplitzConnectivitySnippet, VarInitSnippet, WeightUpdateModel,
};
use crate::{ModelError, Result};
use ahash::AHashMap;
use std::sync::Arc;

/// Named lookup for every snippet kind
#[derive(Debug, Default)]
pub struct SnippetRegistry {
    neuron_models: AHashMap<String, Arc<NeuronModel>>,
    weight_update_models: AHashMap<String, Arc<WeightUpdateModel>>,
    postsynaptic_models: AHashMap<String, Arc<PostsynapticModel>>,
    current_source_models: AHashMap<String, Arc<CurrentSourceModel>>,
    var_init_snippets: AHashMap<String, Arc<VarInitSnippet>>,
    connectivity_snippets: AHashMap<String, Arc<SparseConnectivitySnippet>>,
    toeplitz_snippets: AHashMap<String, Arc<ToeplitzConnectivitySnippet>>,
}

macro_rules! register {
    ($map:expr, $kind:literal, $snippet:expr) => {{
        let snippet = $snippet;
        let name = snippet.name.clone();
        if $map.insert(name.clone(), snippet).is_some() {
            return Err(ModelError::DuplicateName { kind: $kind, name });
        }
        Ok(())
    }};
}

macro_rules! lookup {
    ($map:expr, $kind:literal, $name:expr) => {
        $map.get($name).cloned().ok_or(ModelError::UnknownGroup {
            kind: $kind,
            name: $name.to_string(),
        })
    };
}

impl SnippetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the stock library
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register_neuron_model(models::izhikevich())
            .and_then(|_| registry.register_neuron_model(models::lif()))
            .and_then(|_| registry.register_neuron_model(models::spike_source()))
            .and_then(|_| registry.register_weight_update_model(models::static_pulse()))
            .and_then(|_| {
                registry.register_weight_update_model(models::static_pulse_dendritic_delay())
            })
            .and_then(|_| registry.register_weight_update_model(models::static_graded()))
            .and_then(|_| registry.register_postsynaptic_model(models::delta_curr()))
            .and_then(|_| registry.register_postsynaptic_model(models::exp_curr()))
            .and_then(|_| registry.register_postsynaptic_model(models::alpha_curr()))
            .and_then(|_| registry.register_current_source_model(models::dc_source()))
            .and_then(|_| registry.register_current_source_model(models::gaussian_noise_source()))
            .and_then(|_| registry.register_var_init_snippet(models::constant_var_init()))
            .and_then(|_| registry.register_var_init_snippet(models::uninitialised_var_init()))
            .and_then(|_| registry.register_var_init_snippet(models::uniform_var_init()))
            .and_then(|_| registry.register_var_init_snippet(models::normal_var_init()))
            .and_then(|_| registry.register_var_init_snippet(models::kernel_var_init()))
            .and_then(|_| {
                registry.register_connectivity_snippet(models::uninitialised_connectivity())
            })
            .and_then(|_| registry.register_connectivity_snippet(models::one_to_one_connectivity()))
            .and_then(|_| {
                registry.register_connectivity_snippet(models::fixed_probability_connectivity())
            })
            .and_then(|_| {
                registry.register_connectivity_snippet(models::fixed_number_post_connectivity())
            })
            .and_then(|_| registry.register_toeplitz_snippet(models::conv2d_toeplitz()))
            .expect("stock library names are unique");
        registry
    }

    pub fn register_neuron_model(&mut self, model: Arc<NeuronModel>) -> Result<()> {
        model.validate()?;
        register!(self.neuron_models, "neuron model", model)
    }

    pub fn register_weight_update_model(&mut self, model: Arc<WeightUpdateModel>) -> Result<()> {
        model.validate()?;
        register!(self.weight_update_models, "weight update model", model)
    }

    pub fn register_postsynaptic_model(&mut self, model: Arc<PostsynapticModel>) -> Result<()> {
        model.validate()?;
        register!(self.postsynaptic_models, "postsynaptic model", model)
    }

    pub fn register_current_source_model(
        &mut self,
        model: Arc<CurrentSourceModel>,
    ) -> Result<()> {
        model.validate()?;
        register!(self.current_source_models, "current source model", model)
    }

    pub fn register_var_init_snippet(&mut self, snippet: Arc<VarInitSnippet>) -> Result<()> {
        register!(self.var_init_snippets, "variable initialisation snippet", snippet)
    }

    pub fn register_connectivity_snippet(
        &mut self,
        snippet: Arc<SparseConnectivitySnippet>,
    ) -> Result<()> {
        register!(self.connectivity_snippets, "connectivity snippet", snippet)
    }

    pub fn register_toeplitz_snippet(
        &mut self,
        snippet: Arc<ToeplitzConnectivitySnippet>,
    ) -> Result<()> {
        register!(self.toeplitz_snippets, "toeplitz connectivity snippet", snippet)
    }

    pub fn neuron_model(&self, name: &str) -> Result<Arc<NeuronModel>> {
        lookup!(self.neuron_models, "neuron model", name)
    }

    pub fn weight_update_model(&self, name: &str) -> Result<Arc<WeightUpdateModel>> {
        lookup!(self.weight_update_models, "weight update model", name)
    }

    pub fn postsynaptic_model(&self, name: &str) -> Result<Arc<PostsynapticModel>> {
        lookup!(self.postsynaptic_models, "postsynaptic model", name)
    }

    pub fn current_source_model(&self, name: &str) -> Result<Arc<CurrentSourceModel>> {
        lookup!(self.current_source_models, "current source model", name)
    }

    pub fn var_init_snippet(&self, name: &str) -> Result<Arc<VarInitSnippet>> {
        lookup!(self.var_init_snippets, "variable initialisation snippet", name)
    }

    pub fn connectivity_snippet(&self, name: &str) -> Result<Arc<SparseConnectivitySnippet>> {
        lookup!(self.connectivity_snippets, "connectivity snippet", name)
    }

    pub fn toeplitz_snippet(&self, name: &str) -> Result<Arc<ToeplitzConnectivitySnippet>> {
        lookup!(self.toeplitz_snippets, "toeplitz connectivity snippet", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let registry = SnippetRegistry::with_builtins();
        assert!(registry.neuron_model("Izhikevich").is_ok());
        assert!(registry.weight_update_model("StaticPulse").is_ok());
        assert!(registry.postsynaptic_model("DeltaCurr").is_ok());
        assert!(registry.connectivity_snippet("FixedProbability").is_ok());
    }

    #[test]
    fn test_unknown_lookup_fails() {
        let registry = SnippetRegistry::with_builtins();
        assert!(matches!(
            registry.neuron_model("HodgkinHuxley42"),
            Err(ModelError::UnknownGroup { .. })
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = SnippetRegistry::with_builtins();
        assert!(matches!(
            registry.register_neuron_model(models::izhikevich()),
            Err(ModelError::DuplicateName { .. })
        ));
    }
}
