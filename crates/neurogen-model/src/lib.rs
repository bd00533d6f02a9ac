// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # Neurogen Model IR
//!
//! In-memory description of a spiking neural network: populations of
//! neurons, synapse groups connecting them with weight-update and
//! postsynaptic models, current sources, and custom update passes.
//!
//! The [`Model`] is an arena that exclusively owns every group; groups
//! refer to each other by stable index, valid for the model's lifetime.
//! Every user code fragment is scanned into tokens the moment it enters
//! the IR; downstream components only see token streams.
//!
//! [`Model::finalise`] computes derived parameters, infers delay-queue
//! requirements from consumer code, runs the fusion pass and freezes
//! the IR. Structural 160-bit digests over each group drive the
//! merging and fusion decisions in the code generator.

pub mod current_source;
pub mod custom_update;
pub mod fragment;
pub mod hash;
pub mod init;
pub mod matrix;
pub mod model;
pub mod models;
pub mod neuron_group;
pub mod registry;
pub mod snippet;
pub mod synapse_group;
pub mod var_access;

pub use current_source::{CurrentSource, CurrentSourceId};
pub use custom_update::{
    CustomConnectivityUpdate, CustomConnectivityUpdateId, CustomUpdate, CustomUpdateId,
    CustomUpdateWu, CustomUpdateWuId, VarRefTarget, VarReference, WuVarReference,
};
pub use fragment::CodeFragment;
pub use hash::{HashBuilder, HashDigest};
pub use init::{ConnectivityInit, ToeplitzInit, VarInit};
pub use matrix::{SpanType, SynapseMatrixConnectivity, SynapseMatrixType, SynapseMatrixWeight};
pub use model::{Model, NeuronGroupId, SynapseGroupId, SynapsePopulation};
pub use neuron_group::NeuronGroup;
pub use registry::SnippetRegistry;
pub use snippet::{
    AdditionalInputVar, CurrentSourceModel, CustomConnectivityUpdateModel, CustomUpdateModel,
    DerivedParam, ExtraGlobalParam, NeuronModel, ParamValues, PostsynapticModel,
    SparseConnectivitySnippet, ToeplitzConnectivitySnippet, Var, VarInitSnippet, VarRefDef,
    WeightUpdateModel,
};
pub use synapse_group::SynapseGroup;
pub use var_access::{VarAccess, VarAccessDim, VarAccessMode, VarLocation};

use neurogen_transpiler::ScanError;
use thiserror::Error;

/// Configuration errors detected at IR construction, plus the frozen
/// guard. Unrecoverable; surfaced immediately.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Duplicate {kind} name '{name}'")]
    DuplicateName { kind: &'static str, name: String },

    #[error("{kind} '{name}' not found")]
    UnknownGroup { kind: &'static str, name: String },

    #[error("Invalid matrix type: {0}")]
    InvalidMatrixType(String),

    #[error("Incompatible initialiser: {0}")]
    IncompatibleInitialiser(String),

    #[error("Group '{group}' has no target variable '{var}'")]
    UnknownTargetVariable { group: String, var: String },

    #[error("Group '{group}' has no variable '{var}'")]
    UnknownVariable { group: String, var: String },

    #[error("Missing value for parameter '{param}' of '{group}'")]
    MissingParameter { group: String, param: String },

    #[error("Unknown parameter '{param}' supplied to '{group}'")]
    UnknownParameter { group: String, param: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Model is finalised; no further mutation is allowed")]
    Frozen,

    #[error(transparent)]
    Syntax(#[from] ScanError),
}

pub type Result<T> = std::result::Result<T, ModelError>;
