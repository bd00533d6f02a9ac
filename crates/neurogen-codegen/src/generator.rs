// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Top-level generation: build every merged group, emit every kernel,
//! then assemble the runner translation unit.
//!
//! Diagnostics from the transpiler accumulate across the whole pass;
//! a fragment failure aborts only that fragment's emission, and the
//! pass fails at the end with every diagnostic attached.

use crate::backend::Backend;
use crate::custom_update::{
    CustomConnectivityUpdateGroupMerged, CustomUpdateGroupMerged, CustomUpdateWuGroupMerged,
};
use crate::init_groups::{
    ConnectivityInitGroupMerged, CustomUpdateInitGroupMerged, NeuronInitGroupMerged,
    SparseInitGroupMerged, SynapseInitGroupMerged,
};
use crate::merged::{partition_by_digest, Field, FieldInit, GroupRef, MergedGroup};
use crate::neuron_update::NeuronUpdateGroupMerged;
use crate::runner;
use crate::synapse_update::{SynapseGroupMerged, SynapsePass};
use crate::{CodegenError, Result};
use neurogen_model::{
    HashBuilder, HashDigest, Model, NeuronGroup, NeuronGroupId, SynapseGroup, SynapseGroupId,
};
use neurogen_transpiler::Diagnostic;
use neurogen_types::{NumericType, ResolvedType};
use tracing::info;

/// Merged group advancing spike queues and zeroing spike counts at the
/// top of each step
pub struct SpikeQueueUpdateGroupMerged<'m> {
    pub merged: MergedGroup<'m, NeuronGroupId, NeuronGroup>,
}

impl<'m> SpikeQueueUpdateGroupMerged<'m> {
    fn digest(ng: &NeuronGroup) -> HashDigest {
        let mut hash = HashBuilder::new("spike-queue-update-merge");
        hash.update_u32(ng.num_delay_slots())
            .update_bool(ng.is_delay_required())
            .update_bool(ng.is_true_spike_required())
            .update_bool(ng.is_spike_event_required());
        hash.finalise()
    }

    pub fn build(model: &'m Model) -> Vec<SpikeQueueUpdateGroupMerged<'m>> {
        let members = model.neuron_groups().filter(|(_, ng)| {
            ng.is_true_spike_required() || ng.is_spike_event_required() || ng.is_delay_required()
        });
        partition_by_digest(members, |_, ng| Self::digest(ng))
            .into_iter()
            .map(|merged| SpikeQueueUpdateGroupMerged { merged })
            .collect()
    }

    /// Body operating on one member's merged struct
    pub fn generate(&mut self, model: &Model) -> Result<String> {
        let archetype = self.merged.archetype();
        let slots = archetype.num_delay_slots();
        let batch = model.batch_size();
        let uint = ResolvedType::numeric(NumericType::Uint32);
        let mut out = String::new();

        if archetype.is_delay_required() {
            self.merged.add_field(Field {
                name: "spkQuePtr".into(),
                ty: uint.create_pointer(),
                values: self
                    .merged
                    .ids()
                    .iter()
                    .map(|&id| FieldInit::Array {
                        group: GroupRef::Neuron(id),
                        var: "spkQuePtr".into(),
                    })
                    .collect(),
            })?;
            out.push_str(&format!(
                "*group->spkQuePtr = (*group->spkQuePtr + 1) % {};\n",
                slots
            ));
        }
        let write_slot = if archetype.is_delay_required() {
            "(*group->spkQuePtr)".to_string()
        } else {
            "0".to_string()
        };
        if archetype.is_true_spike_required() {
            self.merged.add_field(Field {
                name: "spkCnt".into(),
                ty: uint.create_pointer(),
                values: self
                    .merged
                    .ids()
                    .iter()
                    .map(|&id| FieldInit::Array {
                        group: GroupRef::Neuron(id),
                        var: "spkCnt".into(),
                    })
                    .collect(),
            })?;
            out.push_str(&format!(
                "for (unsigned int b = 0; b < {}; b++) {{\n    group->spkCnt[(b * {}) + {}] = 0;\n}}\n",
                batch, slots, write_slot
            ));
        }
        if archetype.is_spike_event_required() {
            self.merged.add_field(Field {
                name: "spkEvntCnt".into(),
                ty: uint.create_pointer(),
                values: self
                    .merged
                    .ids()
                    .iter()
                    .map(|&id| FieldInit::Array {
                        group: GroupRef::Neuron(id),
                        var: "spkEvntCnt".into(),
                    })
                    .collect(),
            })?;
            out.push_str(&format!(
                "for (unsigned int b = 0; b < {}; b++) {{\n    group->spkEvntCnt[(b * {}) + {}] = 0;\n}}\n",
                batch, slots, write_slot
            ));
        }
        Ok(out)
    }
}

/// Merged group advancing the dendritic delay head pointer per step
pub struct DendriticDelayUpdateGroupMerged<'m> {
    pub merged: MergedGroup<'m, SynapseGroupId, SynapseGroup>,
}

impl<'m> DendriticDelayUpdateGroupMerged<'m> {
    pub fn build(model: &'m Model) -> Vec<DendriticDelayUpdateGroupMerged<'m>> {
        // Only fused archetypes own a live buffer
        let members = model.synapse_groups().filter(|(id, sg)| {
            sg.is_dendritic_delay_required() && sg.fused_ps_target(*id) == *id
        });
        partition_by_digest(members, |_, sg| sg.dendritic_delay_update_hash_digest())
            .into_iter()
            .map(|merged| DendriticDelayUpdateGroupMerged { merged })
            .collect()
    }

    pub fn generate(&mut self) -> Result<String> {
        let uint = ResolvedType::numeric(NumericType::Uint32);
        self.merged.add_field(Field {
            name: "denDelayPtr".into(),
            ty: uint.create_pointer(),
            values: self
                .merged
                .ids()
                .iter()
                .map(|&id| FieldInit::Array {
                    group: GroupRef::Synapse(id),
                    var: "denDelayPtr".into(),
                })
                .collect(),
        })?;
        Ok(format!(
            "*group->denDelayPtr = (*group->denDelayPtr + 1) % {};\n",
            self.merged.archetype().max_dendritic_delay_timesteps()
        ))
    }
}

/// Every merged group of the model, partitioned per emission pass
pub struct MergedModel<'m> {
    pub neuron_update_groups: Vec<NeuronUpdateGroupMerged<'m>>,
    pub presynaptic_update_groups: Vec<SynapseGroupMerged<'m>>,
    pub postsynaptic_update_groups: Vec<SynapseGroupMerged<'m>>,
    pub synapse_dynamics_groups: Vec<SynapseGroupMerged<'m>>,
    pub neuron_init_groups: Vec<NeuronInitGroupMerged<'m>>,
    pub synapse_init_groups: Vec<SynapseInitGroupMerged<'m>>,
    pub connectivity_init_groups: Vec<ConnectivityInitGroupMerged<'m>>,
    pub sparse_init_groups: Vec<SparseInitGroupMerged<'m>>,
    pub custom_update_init_groups: Vec<CustomUpdateInitGroupMerged<'m>>,
    pub custom_update_groups: Vec<CustomUpdateGroupMerged<'m>>,
    pub custom_wu_update_groups: Vec<CustomUpdateWuGroupMerged<'m>>,
    pub custom_connectivity_update_groups: Vec<CustomConnectivityUpdateGroupMerged<'m>>,
    pub spike_queue_update_groups: Vec<SpikeQueueUpdateGroupMerged<'m>>,
    pub dendritic_delay_update_groups: Vec<DendriticDelayUpdateGroupMerged<'m>>,
}

impl<'m> MergedModel<'m> {
    pub fn new(model: &'m Model, backend: &dyn Backend) -> Result<Self> {
        if !model.is_finalised() {
            return Err(CodegenError::ModelNotFinalised);
        }
        let mut custom_update_groups = Vec::new();
        let mut custom_wu_update_groups = Vec::new();
        let mut custom_connectivity_update_groups = Vec::new();
        for group_name in model.custom_update_group_names() {
            custom_update_groups.extend(CustomUpdateGroupMerged::build(model, &group_name));
            custom_wu_update_groups.extend(CustomUpdateWuGroupMerged::build(model, &group_name));
            custom_connectivity_update_groups
                .extend(CustomConnectivityUpdateGroupMerged::build(model, &group_name));
        }

        let merged = Self {
            neuron_update_groups: NeuronUpdateGroupMerged::build(model),
            presynaptic_update_groups: SynapseGroupMerged::build(
                model,
                SynapsePass::PresynapticUpdate,
            ),
            postsynaptic_update_groups: SynapseGroupMerged::build(
                model,
                SynapsePass::PostsynapticUpdate,
            ),
            synapse_dynamics_groups: SynapseGroupMerged::build(model, SynapsePass::SynapseDynamics),
            neuron_init_groups: NeuronInitGroupMerged::build(model),
            synapse_init_groups: SynapseInitGroupMerged::build(model),
            connectivity_init_groups: ConnectivityInitGroupMerged::build(model),
            sparse_init_groups: SparseInitGroupMerged::build(model, backend),
            custom_update_init_groups: CustomUpdateInitGroupMerged::build(model),
            custom_update_groups,
            custom_wu_update_groups,
            custom_connectivity_update_groups,
            spike_queue_update_groups: SpikeQueueUpdateGroupMerged::build(model),
            dendritic_delay_update_groups: DendriticDelayUpdateGroupMerged::build(model),
        };
        info!(
            neuron_update = merged.neuron_update_groups.len(),
            presynaptic = merged.presynaptic_update_groups.len(),
            neuron_init = merged.neuron_init_groups.len(),
            "merged model built"
        );
        Ok(merged)
    }
}

/// The complete generated module, one string per translation unit
#[derive(Debug, Clone)]
pub struct GeneratedModule {
    /// Typedefs, merged-group structures and push-function definitions
    pub definitions: String,
    pub neuron_update: String,
    pub synapse_update: String,
    pub init: String,
    pub custom_update: String,
    /// allocateMem / freeMem / initialize / initializeSparse / stepTime
    pub runner: String,
}

/// Generate the full module for a finalised model.
///
/// Kernel emission walks every merged group; transpiler diagnostics
/// accumulate and fail the pass at the end so the user sees everything
/// at once.
pub fn generate(model: &Model, backend: &dyn Backend) -> Result<GeneratedModule> {
    let mut merged = MergedModel::new(model, backend)?;
    let mut diagnostics: Vec<Diagnostic> = Vec::new();

    // Kernel bodies; field registration happens as a side effect
    let mut neuron_bodies = Vec::new();
    for group in &mut merged.neuron_update_groups {
        neuron_bodies.push(group.generate(model, backend, &mut diagnostics)?);
    }
    let mut presynaptic_bodies = Vec::new();
    for group in &mut merged.presynaptic_update_groups {
        presynaptic_bodies.push(group.generate(model, backend, &mut diagnostics)?);
    }
    let mut postsynaptic_bodies = Vec::new();
    for group in &mut merged.postsynaptic_update_groups {
        postsynaptic_bodies.push(group.generate(model, backend, &mut diagnostics)?);
    }
    let mut dynamics_bodies = Vec::new();
    for group in &mut merged.synapse_dynamics_groups {
        dynamics_bodies.push(group.generate(model, backend, &mut diagnostics)?);
    }
    let mut neuron_init_bodies = Vec::new();
    for group in &mut merged.neuron_init_groups {
        neuron_init_bodies.push(group.generate(model, backend, &mut diagnostics)?);
    }
    let mut synapse_init_bodies = Vec::new();
    for group in &mut merged.synapse_init_groups {
        synapse_init_bodies.push(group.generate(model, backend, &mut diagnostics)?);
    }
    let mut connectivity_init_bodies = Vec::new();
    for group in &mut merged.connectivity_init_groups {
        connectivity_init_bodies.push(group.generate(model, backend, &mut diagnostics)?);
    }
    let mut sparse_init_bodies = Vec::new();
    for group in &mut merged.sparse_init_groups {
        sparse_init_bodies.push(group.generate(model, backend, &mut diagnostics)?);
    }
    let mut custom_init_bodies = Vec::new();
    for group in &mut merged.custom_update_init_groups {
        custom_init_bodies.push(group.generate(model, backend, &mut diagnostics)?);
    }
    let mut custom_bodies = Vec::new();
    for group in &mut merged.custom_update_groups {
        custom_bodies.push(group.generate(model, backend, &mut diagnostics)?);
    }
    let mut custom_wu_bodies = Vec::new();
    for group in &mut merged.custom_wu_update_groups {
        custom_wu_bodies.push(group.generate(model, backend, &mut diagnostics)?);
    }
    let mut custom_connectivity_bodies = Vec::new();
    for group in &mut merged.custom_connectivity_update_groups {
        custom_connectivity_bodies.push(group.generate(model, backend, &mut diagnostics)?);
    }
    let mut spike_queue_bodies = Vec::new();
    for group in &mut merged.spike_queue_update_groups {
        spike_queue_bodies.push(group.generate(model)?);
    }
    let mut dendritic_bodies = Vec::new();
    for group in &mut merged.dendritic_delay_update_groups {
        dendritic_bodies.push(group.generate()?);
    }

    if !diagnostics.is_empty() {
        return Err(CodegenError::Transpile(diagnostics));
    }

    let module = runner::assemble(
        model,
        backend,
        &merged,
        runner::KernelBodies {
            neuron_update: neuron_bodies,
            presynaptic_update: presynaptic_bodies,
            postsynaptic_update: postsynaptic_bodies,
            synapse_dynamics: dynamics_bodies,
            neuron_init: neuron_init_bodies,
            synapse_init: synapse_init_bodies,
            connectivity_init: connectivity_init_bodies,
            sparse_init: sparse_init_bodies,
            custom_update_init: custom_init_bodies,
            custom_update: custom_bodies,
            custom_wu_update: custom_wu_bodies,
            custom_connectivity_update: custom_connectivity_bodies,
            spike_queue_update: spike_queue_bodies,
            dendritic_delay_update: dendritic_bodies,
        },
    );
    info!(model = %model.name(), "code generation complete");
    Ok(module)
}
