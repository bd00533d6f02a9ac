// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # Neurogen Code Generator
//!
//! Walks the finalised model IR, collapses structurally identical
//! groups into merged groups, opens environments over their fields and
//! stitches the transpiled user code fragments into complete neuron /
//! synapse / init kernels plus a runner translation unit. The concrete
//! device dialect comes entirely through the [`Backend`] contract.
//!
//! ## Emission flow
//!
//! ```text
//! Model (finalised)
//!   └─ MergedModel::new        group by per-pass digests
//!       └─ generate()          per merged group:
//!            environment over fields → transpile fragments → kernel text
//!       └─ runner assembly     allocate/free/init/stepTime + push functions
//! ```

pub mod backend;
pub mod code_stream;
pub mod custom_update;
pub mod environment;
pub mod generator;
pub mod init_groups;
pub mod merged;
pub mod neuron_update;
pub mod preferences;
pub mod reference;
pub mod runner;
pub mod synapse_update;

pub use backend::{
    Array, AtomicMemSpace, AtomicOperation, Backend, BackendError, Kernel,
};
pub use code_stream::CodeStream;
pub use environment::{CachedVar, KernelEnvironment};
pub use generator::{generate, GeneratedModule};
pub use merged::{
    is_param_heterogeneous, Field, FieldInit, GroupRef, MergedGroup, MergedModel,
};
pub use preferences::{
    load_preferences, validate_preferences, KernelBlockSizes, Preferences, PreferencesError,
};
pub use reference::ReferenceBackend;

use neurogen_transpiler::Diagnostic;
use thiserror::Error;

/// Code generation failures
#[derive(Error, Debug)]
pub enum CodegenError {
    /// One or more user code fragments failed to transpile; every
    /// diagnostic collected across the pass is carried
    #[error("code generation failed with {} diagnostic(s)", .0.len())]
    Transpile(Vec<Diagnostic>),

    #[error("model must be finalised before code generation")]
    ModelNotFinalised,

    #[error("duplicate field '{0}' in merged group")]
    DuplicateField(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, CodegenError>;
