// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Code-generation preferences.
//!
//! Type-safe preference struct loadable from TOML, with the load /
//! validate split kept separate so embedding callers can construct
//! preferences programmatically and still validate them.

use crate::backend::Kernel;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Preference loading and validation errors
#[derive(Error, Debug)]
pub enum PreferencesError {
    #[error("Failed to read preferences file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML syntax: {0}")]
    Parse(String),

    #[error("Invalid preference value: {0}")]
    InvalidValue(String),
}

impl From<toml::de::Error> for PreferencesError {
    fn from(err: toml::de::Error) -> Self {
        PreferencesError::Parse(err.to_string())
    }
}

/// Threads per block for each generated kernel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct KernelBlockSizes {
    pub neuron_update: u32,
    pub presynaptic_update: u32,
    pub postsynaptic_update: u32,
    pub synapse_dynamics: u32,
    pub init: u32,
    pub init_sparse: u32,
    pub custom_update: u32,
    pub custom_transpose_update: u32,
    pub neuron_spike_queue_update: u32,
    pub neuron_prev_spike_time_update: u32,
    pub synapse_dendritic_delay_update: u32,
}

impl Default for KernelBlockSizes {
    fn default() -> Self {
        Self {
            neuron_update: 64,
            presynaptic_update: 32,
            postsynaptic_update: 32,
            synapse_dynamics: 64,
            init: 64,
            init_sparse: 64,
            custom_update: 64,
            custom_transpose_update: 32,
            neuron_spike_queue_update: 32,
            neuron_prev_spike_time_update: 32,
            synapse_dendritic_delay_update: 32,
        }
    }
}

impl KernelBlockSizes {
    pub fn get(&self, kernel: Kernel) -> u32 {
        match kernel {
            Kernel::NeuronUpdate => self.neuron_update,
            Kernel::PresynapticUpdate => self.presynaptic_update,
            Kernel::PostsynapticUpdate => self.postsynaptic_update,
            Kernel::SynapseDynamicsUpdate => self.synapse_dynamics,
            Kernel::Initialize => self.init,
            Kernel::InitializeSparse => self.init_sparse,
            Kernel::CustomUpdate => self.custom_update,
            Kernel::CustomTransposeUpdate => self.custom_transpose_update,
            Kernel::NeuronSpikeQueueUpdate => self.neuron_spike_queue_update,
            Kernel::NeuronPrevSpikeTimeUpdate => self.neuron_prev_spike_time_update,
            Kernel::SynapseDendriticDelayUpdate => self.synapse_dendritic_delay_update,
        }
    }

    fn values(&self) -> [(&'static str, u32); 11] {
        [
            ("neuron_update", self.neuron_update),
            ("presynaptic_update", self.presynaptic_update),
            ("postsynaptic_update", self.postsynaptic_update),
            ("synapse_dynamics", self.synapse_dynamics),
            ("init", self.init),
            ("init_sparse", self.init_sparse),
            ("custom_update", self.custom_update),
            ("custom_transpose_update", self.custom_transpose_update),
            ("neuron_spike_queue_update", self.neuron_spike_queue_update),
            (
                "neuron_prev_spike_time_update",
                self.neuron_prev_spike_time_update,
            ),
            (
                "synapse_dendritic_delay_update",
                self.synapse_dendritic_delay_update,
            ),
        ]
    }
}

/// Recognised code-generation options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Preferences {
    /// Generate code with debug symbols and assertions
    pub debug_code: bool,
    /// Backend manages host/device coherence itself; no explicit
    /// push/pull calls are generated
    pub automatic_copy: bool,
    /// Walk bitmask words with count-leading-zeros instead of per-bit
    /// tests
    pub enable_bitmask_optimisations: bool,
    /// Prefer straight-line code over cooperative optimisation
    pub generate_simple_code: bool,
    /// Emit zero-length state structs for groups whose state fused away
    pub generate_empty_state_for_fused_groups: bool,
    pub block_sizes: KernelBlockSizes,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            debug_code: false,
            automatic_copy: false,
            enable_bitmask_optimisations: true,
            generate_simple_code: false,
            generate_empty_state_for_fused_groups: false,
            block_sizes: KernelBlockSizes::default(),
        }
    }
}

/// Load preferences from a TOML file and validate them
pub fn load_preferences(path: impl AsRef<Path>) -> Result<Preferences, PreferencesError> {
    let text = std::fs::read_to_string(path)?;
    let preferences: Preferences = toml::from_str(&text)?;
    validate_preferences(&preferences)?;
    Ok(preferences)
}

/// Reject preference combinations the generators cannot honour
pub fn validate_preferences(preferences: &Preferences) -> Result<(), PreferencesError> {
    for (name, value) in preferences.block_sizes.values() {
        if value == 0 {
            return Err(PreferencesError::InvalidValue(format!(
                "block size '{}' must be non-zero",
                name
            )));
        }
        if !value.is_power_of_two() {
            return Err(PreferencesError::InvalidValue(format!(
                "block size '{}' must be a power of two, got {}",
                name, value
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(validate_preferences(&Preferences::default()).is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let preferences = Preferences {
            debug_code: true,
            ..Default::default()
        };
        let text = toml::to_string(&preferences).unwrap();
        let parsed: Preferences = toml::from_str(&text).unwrap();
        assert_eq!(parsed, preferences);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: Preferences =
            toml::from_str("debug_code = true\n[block_sizes]\nneuron_update = 128\n").unwrap();
        assert!(parsed.debug_code);
        assert_eq!(parsed.block_sizes.neuron_update, 128);
        assert_eq!(parsed.block_sizes.init, 64);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(toml::from_str::<Preferences>("emit_fortran = true\n").is_err());
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let mut preferences = Preferences::default();
        preferences.block_sizes.init = 0;
        assert!(matches!(
            validate_preferences(&preferences),
            Err(PreferencesError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_non_power_of_two_rejected() {
        let mut preferences = Preferences::default();
        preferences.block_sizes.neuron_update = 48;
        assert!(validate_preferences(&preferences).is_err());
    }
}
