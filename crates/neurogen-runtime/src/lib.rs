// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # Neurogen Runtime
//!
//! Loads the compiled model library, binds its exported entry points,
//! owns every backing array created through the backend, and advances
//! simulation time.
//!
//! Ownership: the runtime owns the library handle and the map from
//! (group, variable name) to array. Arrays are released in reverse
//! allocation order on destruction, followed by the exported `freeMem`
//! and the library unload.

pub mod allocation;

pub use allocation::{allocate_arrays, ArrayMap};

use neurogen_codegen::{Backend, BackendError, GroupRef, MergedModel};
use neurogen_model::{Model, ModelError};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Runtime environment errors; fatal for the run
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Unable to load library: {0}")]
    LoadFailure(String),

    #[error("Cannot find symbol '{0}'")]
    SymbolMissing(String),

    #[error("Cannot use the recording system without specifying the number of recording timesteps")]
    RecordingUnset,

    #[error("Unable to allocate array with duplicate name '{name}'")]
    DuplicateArray { name: String },

    #[error("Array '{name}' was fused into another group's state and can only be retrieved through the fused archetype")]
    FusedArray { name: String },

    #[error("No array '{name}' allocated for this group")]
    UnknownArray { name: String },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

type VoidFn = unsafe extern "C" fn();
type StepTimeFn = unsafe extern "C" fn(u64, u64);
type PushGroupFn = unsafe extern "C" fn(u32, *const u8);

/// The loaded simulation: library handle, entry points, arrays, time
pub struct Runtime<'m> {
    model: &'m Model,
    merged: &'m MergedModel<'m>,
    backend: &'m dyn Backend,
    arrays: Option<ArrayMap>,
    timestep: u64,
    num_recording_timesteps: Option<u64>,

    allocate_mem_fn: VoidFn,
    free_mem_fn: VoidFn,
    initialize_fn: VoidFn,
    initialize_sparse_fn: VoidFn,
    step_time_fn: StepTimeFn,

    // Dropped last so the function pointers above stay valid
    library: libloading::Library,
}

impl<'m> Runtime<'m> {
    /// Load the compiled library and bind the exported entry points
    pub fn open(
        path: impl AsRef<Path>,
        model: &'m Model,
        merged: &'m MergedModel<'m>,
        backend: &'m dyn Backend,
    ) -> Result<Self> {
        let library = unsafe { libloading::Library::new(path.as_ref()) }
            .map_err(|e| RuntimeError::LoadFailure(e.to_string()))?;

        let allocate_mem_fn = lookup::<VoidFn>(&library, "allocateMem")?;
        let free_mem_fn = lookup::<VoidFn>(&library, "freeMem")?;
        let initialize_fn = lookup::<VoidFn>(&library, "initialize")?;
        let initialize_sparse_fn = lookup::<VoidFn>(&library, "initializeSparse")?;
        let step_time_fn = lookup::<StepTimeFn>(&library, "stepTime")?;

        info!(model = %model.name(), "model library loaded");
        Ok(Self {
            model,
            merged,
            backend,
            arrays: None,
            timestep: 0,
            num_recording_timesteps: None,
            allocate_mem_fn,
            free_mem_fn,
            initialize_fn,
            initialize_sparse_fn,
            step_time_fn,
            library,
        })
    }

    /// Call the exported `allocateMem`, create every backing array the
    /// model needs and push the merged-group field data to the device
    pub fn allocate(&mut self, num_recording_timesteps: Option<u64>) -> Result<()> {
        unsafe { (self.allocate_mem_fn)() };
        self.num_recording_timesteps = num_recording_timesteps;

        let arrays = allocate_arrays(
            self.model,
            self.merged,
            self.backend,
            num_recording_timesteps,
        )?;
        self.push_merged_groups(&arrays)?;
        debug!(arrays = arrays.len(), "backing arrays allocated");
        self.arrays = Some(arrays);
        Ok(())
    }

    fn push_merged_groups(&self, arrays: &ArrayMap) -> Result<()> {
        let mut push = |kind: &str, index: usize, fields: &[neurogen_codegen::Field], ids: usize| -> Result<()> {
            let symbol = format!("pushMerged{}Group{}ToDevice", kind, index);
            // Push functions are optional: a backend may bind state
            // statically
            let Some(push_fn) = lookup_optional::<PushGroupFn>(&self.library, &symbol) else {
                return Ok(());
            };
            for member in 0..ids {
                let data = allocation::marshal_fields(fields, member, arrays)?;
                unsafe { push_fn(member as u32, data.as_ptr()) };
            }
            Ok(())
        };

        let merged = self.merged;
        for (i, g) in merged.neuron_update_groups.iter().enumerate() {
            push("NeuronUpdate", i, g.merged.fields(), g.merged.len())?;
        }
        for (i, g) in merged.presynaptic_update_groups.iter().enumerate() {
            push("PresynapticUpdate", i, g.merged.fields(), g.merged.len())?;
        }
        for (i, g) in merged.postsynaptic_update_groups.iter().enumerate() {
            push("PostsynapticUpdate", i, g.merged.fields(), g.merged.len())?;
        }
        for (i, g) in merged.synapse_dynamics_groups.iter().enumerate() {
            push("SynapseDynamics", i, g.merged.fields(), g.merged.len())?;
        }
        for (i, g) in merged.neuron_init_groups.iter().enumerate() {
            push("NeuronInit", i, g.merged.fields(), g.merged.len())?;
        }
        for (i, g) in merged.synapse_init_groups.iter().enumerate() {
            push("SynapseInit", i, g.merged.fields(), g.merged.len())?;
        }
        for (i, g) in merged.connectivity_init_groups.iter().enumerate() {
            push("SynapseConnectivityInit", i, g.merged.fields(), g.merged.len())?;
        }
        for (i, g) in merged.sparse_init_groups.iter().enumerate() {
            push("SynapseSparseInit", i, g.merged.fields(), g.merged.len())?;
        }
        for (i, g) in merged.custom_update_init_groups.iter().enumerate() {
            push("CustomUpdateInit", i, g.merged.fields(), g.merged.len())?;
        }
        for (i, g) in merged.custom_update_groups.iter().enumerate() {
            push("CustomUpdate", i, g.merged.fields(), g.merged.len())?;
        }
        for (i, g) in merged.custom_wu_update_groups.iter().enumerate() {
            push("CustomUpdateWU", i, g.merged.fields(), g.merged.len())?;
        }
        for (i, g) in merged.custom_connectivity_update_groups.iter().enumerate() {
            push("CustomConnectivityUpdate", i, g.merged.fields(), g.merged.len())?;
        }
        for (i, g) in merged.spike_queue_update_groups.iter().enumerate() {
            push("NeuronSpikeQueueUpdate", i, g.merged.fields(), g.merged.len())?;
        }
        for (i, g) in merged.dendritic_delay_update_groups.iter().enumerate() {
            push("SynapseDendriticDelayUpdate", i, g.merged.fields(), g.merged.len())?;
        }
        Ok(())
    }

    /// Run the exported `initialize`
    pub fn initialize(&mut self) {
        unsafe { (self.initialize_fn)() };
    }

    /// Run the exported `initializeSparse`; the host uploads any
    /// uninitialised connectivity and state beforehand
    pub fn initialize_sparse(&mut self) {
        unsafe { (self.initialize_sparse_fn)() };
    }

    /// Advance the simulation one timestep
    pub fn step_time(&mut self) {
        unsafe {
            (self.step_time_fn)(
                self.timestep,
                self.num_recording_timesteps.unwrap_or(0),
            )
        };
        self.timestep += 1;
    }

    pub fn timestep(&self) -> u64 {
        self.timestep
    }

    pub fn time(&self) -> f64 {
        self.timestep as f64 * self.model.dt()
    }

    /// Retrieve a backing array. Arrays fused into another group's
    /// state can only be retrieved through the fused archetype.
    pub fn array(&self, group: GroupRef, name: &str) -> Result<&dyn neurogen_codegen::Array> {
        // Reject reads through a non-archetype member of a fused group
        if let GroupRef::Synapse(id) = group {
            let sg = self.model.synapse_group(id);
            let fused = match name {
                "outPost" | "denDelay" | "denDelayPtr" => sg.fused_ps_target(id) != id,
                "outPre" => sg.fused_pre_output_target(id) != id,
                _ => false,
            };
            if fused {
                return Err(RuntimeError::FusedArray {
                    name: name.to_string(),
                });
            }
        }
        self.arrays
            .as_ref()
            .ok_or_else(|| RuntimeError::UnknownArray {
                name: name.to_string(),
            })?
            .get(group, name)
    }
}

impl Drop for Runtime<'_> {
    fn drop(&mut self) {
        // Arrays first, in reverse allocation order
        if let Some(arrays) = self.arrays.take() {
            arrays.free_all();
        }
        unsafe { (self.free_mem_fn)() };
        // Library unloads when the field drops
    }
}

fn lookup<T: Copy>(library: &libloading::Library, name: &str) -> Result<T> {
    unsafe {
        library
            .get::<T>(name.as_bytes())
            .map(|symbol| *symbol)
            .map_err(|_| RuntimeError::SymbolMissing(name.to_string()))
    }
}

fn lookup_optional<T: Copy>(library: &libloading::Library, name: &str) -> Option<T> {
    unsafe { library.get::<T>(name.as_bytes()).map(|symbol| *symbol).ok() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neurogen_codegen::ReferenceBackend;

    #[test]
    fn test_load_failure_carries_os_error() {
        let mut model = Model::new("missing");
        model.finalise(1.0).unwrap();
        let backend = ReferenceBackend::default();
        let merged = MergedModel::new(&model, &backend).unwrap();
        let err = Runtime::open("/nonexistent/librunner.so", &model, &merged, &backend)
            .err()
            .expect("loading a missing library must fail");
        match err {
            RuntimeError::LoadFailure(text) => assert!(!text.is_empty()),
            other => panic!("expected LoadFailure, got {:?}", other),
        }
    }
}
