// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # Neurogen - Spiking Neural Network Code Generation
//!
//! Neurogen turns an in-memory description of a spiking neural network
//! - populations of neurons, synapse groups with weight-update and
//! postsynaptic models, current sources, custom update passes - into a
//! native shared library that simulates the model step by step, and
//! drives that library at runtime.
//!
//! ## Crates
//!
//! - [`types`]: resolved types, numeric limits, the precision-policy
//!   type context
//! - [`transpiler`]: scan / parse / type-check / pretty-print for the
//!   embedded model-code DSL
//! - [`model`]: the model IR with validation, structural hashing and
//!   fusion
//! - [`codegen`]: merged groups, emission environments, kernel
//!   emitters and the backend contract
//! - [`runtime`]: dynamic library loading, array ownership, time
//!   stepping
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use neurogen::prelude::*;
//! use std::collections::BTreeMap;
//!
//! let mut model = Model::new("tutorial");
//! let mut params = ParamValues::new();
//! for (name, value) in [("a", 0.02), ("b", 0.2), ("c", -65.0), ("d", 8.0)] {
//!     params.insert(name.into(), value);
//! }
//! let mut vars = BTreeMap::new();
//! vars.insert("V".to_string(), VarInit::constant(-65.0));
//! vars.insert("U".to_string(), VarInit::constant(-20.0));
//! model.add_neuron_population("Neurons", 100, models::izhikevich(), params, vars)?;
//! model.finalise(0.1)?;
//!
//! let backend = ReferenceBackend::default();
//! let module = neurogen::codegen::generate(&model, &backend)?;
//! println!("{}", module.runner);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub use neurogen_codegen as codegen;
pub use neurogen_model as model;
pub use neurogen_runtime as runtime;
pub use neurogen_transpiler as transpiler;
pub use neurogen_types as types;

/// The names most models touch
pub mod prelude {
    pub use neurogen_codegen::{
        generate, Backend, GeneratedModule, MergedModel, Preferences, ReferenceBackend,
    };
    pub use neurogen_model::{
        models, Model, ModelError, ParamValues, SnippetRegistry, SpanType, SynapseMatrixType,
        SynapsePopulation, VarAccess, VarInit, VarLocation,
    };
    pub use neurogen_runtime::{Runtime, RuntimeError};
    pub use neurogen_types::{ScalarPrecision, TimePrecision, TypeContext};
}
