// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Runner assembly.
//!
//! Stitches the emitted kernel bodies into complete translation units:
//! merged-group structure definitions with their push functions, the
//! per-pass kernel files, and the runner exporting `allocateMem`,
//! `freeMem`, `initialize`, `initializeSparse` and
//! `stepTime(timestep, numRecordingTimesteps)`.
//!
//! Within one `stepTime` the kernel order is fixed and visible to user
//! code: queue pointers advance first, then the neuron update, the
//! presynaptic update, postsynaptic learning and synapse dynamics.
//! Custom updates run out-of-band through their exported
//! `customUpdate<Group>` entry points.

use crate::backend::Backend;
use crate::code_stream::CodeStream;
use crate::generator::{GeneratedModule, MergedModel};
use crate::merged::Field;
use neurogen_model::{Model, SpanType, SynapseMatrixConnectivity};

/// Kernel bodies per merged group, in merged-group order
pub struct KernelBodies {
    pub neuron_update: Vec<String>,
    pub presynaptic_update: Vec<String>,
    pub postsynaptic_update: Vec<String>,
    pub synapse_dynamics: Vec<String>,
    pub neuron_init: Vec<String>,
    pub synapse_init: Vec<String>,
    pub connectivity_init: Vec<String>,
    pub sparse_init: Vec<String>,
    pub custom_update_init: Vec<String>,
    pub custom_update: Vec<String>,
    pub custom_wu_update: Vec<String>,
    pub custom_connectivity_update: Vec<String>,
    pub spike_queue_update: Vec<String>,
    pub dendritic_delay_update: Vec<String>,
}

fn struct_name(kind: &str, index: usize) -> String {
    format!("Merged{}Group{}", kind, index)
}

fn instance_name(kind: &str, index: usize) -> String {
    format!("merged{}Group{}", kind, index)
}

/// Emit one merged-group structure, its instance array and its push
/// function
fn emit_struct(stream: &mut CodeStream, kind: &str, index: usize, fields: &[Field], count: usize) {
    stream.open(&format!("typedef struct {}_t", struct_name(kind, index)));
    if fields.is_empty() {
        stream.line("char _empty;");
    }
    for field in fields {
        stream.line(format!("{} {};", field.ty.name(), field.name));
    }
    stream.close_with(&format!(" {};", struct_name(kind, index)));
    stream.line(format!(
        "static {} {}[{}];",
        struct_name(kind, index),
        instance_name(kind, index),
        count
    ));
    stream.open(&format!(
        "void pushMerged{}Group{}ToDevice(unsigned int idx, const void *fieldData)",
        kind, index
    ));
    stream.line(format!(
        "memcpy(&{}[idx], fieldData, sizeof({}));",
        instance_name(kind, index),
        struct_name(kind, index)
    ));
    stream.close();
    stream.blank();
}

/// Emit the per-group kernel function wrapping a body
fn emit_kernel_function(
    stream: &mut CodeStream,
    kind: &str,
    index: usize,
    params: &str,
    body: &str,
) {
    stream.open(&format!(
        "static void update{}Group{}({} *group{})",
        kind,
        index,
        struct_name(kind, index),
        params
    ));
    stream.raw(body);
    stream.close();
    stream.blank();
}

/// Emit a driver looping over a merged group's members and thread
/// domain
fn emit_driver(
    stream: &mut CodeStream,
    kind: &str,
    index: usize,
    count: usize,
    thread_count: &str,
    batch_loop: Option<u32>,
    call_args: &str,
) {
    stream.open(&format!("for (unsigned int g = 0; g < {}; g++)", count));
    stream.line(format!(
        "{} *group = &{}[g];",
        struct_name(kind, index),
        instance_name(kind, index)
    ));
    if let Some(batch_size) = batch_loop {
        stream.open(&format!(
            "for (unsigned int batch = 0; batch < {}; batch++)",
            batch_size
        ));
    }
    stream.open(&format!(
        "for (unsigned int lid = 0; lid < {}; lid++)",
        thread_count
    ));
    stream.line(format!("update{}Group{}(group{});", kind, index, call_args));
    stream.close();
    if batch_loop.is_some() {
        stream.close();
    }
    stream.close();
}

pub fn assemble(
    model: &Model,
    _backend: &dyn Backend,
    merged: &MergedModel<'_>,
    bodies: KernelBodies,
) -> GeneratedModule {
    let ctx = model.type_context();
    let scalar = ctx.scalar_type();
    let time = ctx.time_type();
    let batch_size = model.batch_size();

    // ---- definitions --------------------------------------------------
    let mut definitions = CodeStream::new();
    definitions.line(format!("// definitions for model '{}'", model.name()));
    definitions.line("#include <stdint.h>");
    definitions.line("#include <string.h>");
    definitions.line("#include <math.h>");
    definitions.blank();
    definitions.line(format!("typedef {} scalar;", scalar.name()));
    definitions.line(format!("typedef {} timepoint;", time.name()));
    definitions.line(format!("#define DT {}", model.dt()));
    definitions.line(format!("static unsigned int deviceRngSeed = {};", model.seed()));
    if model.is_timing_enabled() {
        definitions.line("static double neuronUpdateTime = 0.0;");
        definitions.line("static double presynapticUpdateTime = 0.0;");
        definitions.line("static double postsynapticUpdateTime = 0.0;");
        definitions.line("static double synapseDynamicsTime = 0.0;");
        definitions.line("static double initTime = 0.0;");
        definitions.line("static double initSparseTime = 0.0;");
    }
    definitions.blank();

    for (i, group) in merged.neuron_update_groups.iter().enumerate() {
        emit_struct(&mut definitions, "NeuronUpdate", i, group.merged.fields(), group.merged.len());
    }
    for (i, group) in merged.presynaptic_update_groups.iter().enumerate() {
        emit_struct(&mut definitions, "PresynapticUpdate", i, group.merged.fields(), group.merged.len());
    }
    for (i, group) in merged.postsynaptic_update_groups.iter().enumerate() {
        emit_struct(&mut definitions, "PostsynapticUpdate", i, group.merged.fields(), group.merged.len());
    }
    for (i, group) in merged.synapse_dynamics_groups.iter().enumerate() {
        emit_struct(&mut definitions, "SynapseDynamics", i, group.merged.fields(), group.merged.len());
    }
    for (i, group) in merged.neuron_init_groups.iter().enumerate() {
        emit_struct(&mut definitions, "NeuronInit", i, group.merged.fields(), group.merged.len());
    }
    for (i, group) in merged.synapse_init_groups.iter().enumerate() {
        emit_struct(&mut definitions, "SynapseInit", i, group.merged.fields(), group.merged.len());
    }
    for (i, group) in merged.connectivity_init_groups.iter().enumerate() {
        emit_struct(&mut definitions, "SynapseConnectivityInit", i, group.merged.fields(), group.merged.len());
    }
    for (i, group) in merged.sparse_init_groups.iter().enumerate() {
        emit_struct(&mut definitions, "SynapseSparseInit", i, group.merged.fields(), group.merged.len());
    }
    for (i, group) in merged.custom_update_init_groups.iter().enumerate() {
        emit_struct(&mut definitions, "CustomUpdateInit", i, group.merged.fields(), group.merged.len());
    }
    for (i, group) in merged.custom_update_groups.iter().enumerate() {
        emit_struct(&mut definitions, "CustomUpdate", i, group.merged.fields(), group.merged.len());
    }
    for (i, group) in merged.custom_wu_update_groups.iter().enumerate() {
        emit_struct(&mut definitions, "CustomUpdateWU", i, group.merged.fields(), group.merged.len());
    }
    for (i, group) in merged.custom_connectivity_update_groups.iter().enumerate() {
        emit_struct(&mut definitions, "CustomConnectivityUpdate", i, group.merged.fields(), group.merged.len());
    }
    for (i, group) in merged.spike_queue_update_groups.iter().enumerate() {
        emit_struct(&mut definitions, "NeuronSpikeQueueUpdate", i, group.merged.fields(), group.merged.len());
    }
    for (i, group) in merged.dendritic_delay_update_groups.iter().enumerate() {
        emit_struct(&mut definitions, "SynapseDendriticDelayUpdate", i, group.merged.fields(), group.merged.len());
    }

    // ---- neuron update ------------------------------------------------
    let mut neuron_update = CodeStream::new();
    neuron_update.line("#include \"definitions.h\"");
    neuron_update.blank();
    for (i, body) in bodies.neuron_update.iter().enumerate() {
        emit_kernel_function(
            &mut neuron_update,
            "NeuronUpdate",
            i,
            ", unsigned int lid, unsigned int batch, timepoint t, unsigned long long recordingTimestep",
            body,
        );
    }
    neuron_update.open("void updateNeurons(timepoint t, unsigned long long recordingTimestep)");
    for (i, group) in merged.neuron_update_groups.iter().enumerate() {
        emit_driver(
            &mut neuron_update,
            "NeuronUpdate",
            i,
            group.merged.len(),
            "group->numNeurons",
            Some(batch_size),
            ", lid, batch, t, recordingTimestep",
        );
    }
    neuron_update.close();

    // ---- synapse update -----------------------------------------------
    let mut synapse_update = CodeStream::new();
    synapse_update.line("#include \"definitions.h\"");
    synapse_update.blank();
    for (i, body) in bodies.presynaptic_update.iter().enumerate() {
        emit_kernel_function(
            &mut synapse_update,
            "PresynapticUpdate",
            i,
            ", unsigned int lid, unsigned int batch, timepoint t",
            body,
        );
    }
    for (i, body) in bodies.postsynaptic_update.iter().enumerate() {
        emit_kernel_function(
            &mut synapse_update,
            "PostsynapticUpdate",
            i,
            ", unsigned int lid, unsigned int batch, timepoint t",
            body,
        );
    }
    for (i, body) in bodies.synapse_dynamics.iter().enumerate() {
        emit_kernel_function(
            &mut synapse_update,
            "SynapseDynamics",
            i,
            ", unsigned int lid, unsigned int batch, timepoint t",
            body,
        );
    }

    synapse_update.open("void updatePresynaptic(timepoint t)");
    for (i, group) in merged.presynaptic_update_groups.iter().enumerate() {
        let sg = group.merged.archetype();
        let threads = match (sg.span_type(), sg.matrix_type().connectivity) {
            (SpanType::Presynaptic, _) => sg.num_threads_per_spike().to_string(),
            (_, SynapseMatrixConnectivity::Toeplitz) => {
                sg.kernel_size_flattened().max(1).to_string()
            }
            (_, SynapseMatrixConnectivity::Sparse) => "group->rowStride".to_string(),
            _ => "group->numTrgNeurons".to_string(),
        };
        emit_driver(
            &mut synapse_update,
            "PresynapticUpdate",
            i,
            group.merged.len(),
            &threads,
            Some(batch_size),
            ", lid, batch, t",
        );
    }
    synapse_update.close();
    synapse_update.blank();
    synapse_update.open("void updatePostsynaptic(timepoint t)");
    for (i, group) in merged.postsynaptic_update_groups.iter().enumerate() {
        emit_driver(
            &mut synapse_update,
            "PostsynapticUpdate",
            i,
            group.merged.len(),
            "1",
            Some(batch_size),
            ", lid, batch, t",
        );
    }
    synapse_update.close();
    synapse_update.blank();
    synapse_update.open("void updateSynapseDynamics(timepoint t)");
    for (i, group) in merged.synapse_dynamics_groups.iter().enumerate() {
        let threads = "(group->numSrcNeurons * group->rowStride)".to_string();
        emit_driver(
            &mut synapse_update,
            "SynapseDynamics",
            i,
            group.merged.len(),
            &threads,
            Some(batch_size),
            ", lid, batch, t",
        );
    }
    synapse_update.close();

    // ---- init ----------------------------------------------------------
    let mut init = CodeStream::new();
    init.line("#include \"definitions.h\"");
    init.blank();
    for (i, body) in bodies.neuron_init.iter().enumerate() {
        emit_kernel_function(&mut init, "NeuronInit", i, ", unsigned int lid", body);
    }
    for (i, body) in bodies.synapse_init.iter().enumerate() {
        emit_kernel_function(&mut init, "SynapseInit", i, ", unsigned int lid", body);
    }
    for (i, body) in bodies.connectivity_init.iter().enumerate() {
        emit_kernel_function(&mut init, "SynapseConnectivityInit", i, ", unsigned int lid", body);
    }
    for (i, body) in bodies.custom_update_init.iter().enumerate() {
        emit_kernel_function(&mut init, "CustomUpdateInit", i, ", unsigned int lid", body);
    }
    for (i, body) in bodies.sparse_init.iter().enumerate() {
        emit_kernel_function(&mut init, "SynapseSparseInit", i, ", unsigned int lid", body);
    }

    init.open("void initializeInternal(void)");
    for (i, group) in merged.neuron_init_groups.iter().enumerate() {
        emit_driver(&mut init, "NeuronInit", i, group.merged.len(), "group->numNeurons", None, ", lid");
    }
    for (i, group) in merged.synapse_init_groups.iter().enumerate() {
        let sg = group.merged.archetype();
        let threads = if sg.matrix_type().has_kernel_weights() {
            sg.kernel_size_flattened().max(1).to_string()
        } else {
            "group->numTrgNeurons".to_string()
        };
        emit_driver(&mut init, "SynapseInit", i, group.merged.len(), &threads, None, ", lid");
    }
    for (i, group) in merged.connectivity_init_groups.iter().enumerate() {
        let threads = "((group->numSrcNeurons > group->numTrgNeurons) ? group->numSrcNeurons : group->numTrgNeurons)"
            .to_string();
        emit_driver(&mut init, "SynapseConnectivityInit", i, group.merged.len(), &threads, None, ", lid");
    }
    for (i, group) in merged.custom_update_init_groups.iter().enumerate() {
        let threads = "group->size".to_string();
        emit_driver(&mut init, "CustomUpdateInit", i, group.merged.len(), &threads, None, ", lid");
    }
    init.close();
    init.blank();
    init.open("void initializeSparseInternal(void)");
    for (i, group) in merged.sparse_init_groups.iter().enumerate() {
        let threads = "group->rowStride".to_string();
        emit_driver(&mut init, "SynapseSparseInit", i, group.merged.len(), &threads, None, ", lid");
    }
    init.close();

    // ---- custom update --------------------------------------------------
    let mut custom_update = CodeStream::new();
    custom_update.line("#include \"definitions.h\"");
    custom_update.blank();
    for (i, body) in bodies.custom_update.iter().enumerate() {
        emit_kernel_function(
            &mut custom_update,
            "CustomUpdate",
            i,
            ", unsigned int lid, unsigned int batch",
            body,
        );
    }
    for (i, body) in bodies.custom_wu_update.iter().enumerate() {
        emit_kernel_function(
            &mut custom_update,
            "CustomUpdateWU",
            i,
            ", unsigned int lid, unsigned int batch",
            body,
        );
    }
    for (i, body) in bodies.custom_connectivity_update.iter().enumerate() {
        emit_kernel_function(
            &mut custom_update,
            "CustomConnectivityUpdate",
            i,
            ", unsigned int lid",
            body,
        );
    }
    for group_name in model.custom_update_group_names() {
        custom_update.open(&format!("void customUpdate{}(void)", sanitise(&group_name)));
        for (i, group) in merged.custom_update_groups.iter().enumerate() {
            if group.update_group_name != group_name {
                continue;
            }
            let threads = "group->size".to_string();
            emit_driver(
                &mut custom_update,
                "CustomUpdate",
                i,
                group.merged.len(),
                &threads,
                Some(batch_size),
                ", lid, batch",
            );
        }
        for (i, group) in merged.custom_wu_update_groups.iter().enumerate() {
            if group.update_group_name != group_name {
                continue;
            }
            let threads = "(group->numSrcNeurons * group->rowStride)".to_string();
            emit_driver(
                &mut custom_update,
                "CustomUpdateWU",
                i,
                group.merged.len(),
                &threads,
                Some(batch_size),
                ", lid, batch",
            );
        }
        for (i, group) in merged.custom_connectivity_update_groups.iter().enumerate() {
            if group.update_group_name != group_name {
                continue;
            }
            let threads = "group->numSrcNeurons".to_string();
            emit_driver(
                &mut custom_update,
                "CustomConnectivityUpdate",
                i,
                group.merged.len(),
                &threads,
                None,
                ", lid",
            );
        }
        custom_update.close();
        custom_update.blank();
    }

    // ---- runner ----------------------------------------------------------
    let mut runner = CodeStream::new();
    runner.line("#include \"definitions.h\"");
    runner.blank();
    for (i, body) in bodies.spike_queue_update.iter().enumerate() {
        emit_kernel_function(&mut runner, "NeuronSpikeQueueUpdate", i, "", body);
    }
    for (i, body) in bodies.dendritic_delay_update.iter().enumerate() {
        emit_kernel_function(&mut runner, "SynapseDendriticDelayUpdate", i, "", body);
    }

    runner.open("void allocateMem(void)");
    runner.line("// backing arrays are created and bound by the runtime");
    runner.close();
    runner.blank();
    runner.open("void freeMem(void)");
    runner.close();
    runner.blank();
    runner.open("void initialize(void)");
    runner.line("initializeInternal();");
    runner.close();
    runner.blank();
    runner.open("void initializeSparse(void)");
    runner.line("initializeSparseInternal();");
    runner.close();
    runner.blank();

    runner.open("void stepTime(unsigned long long timestep, unsigned long long numRecordingTimesteps)");
    runner.line("const timepoint t = timestep * DT;");
    runner.line(
        "const unsigned long long recordingTimestep = (numRecordingTimesteps == 0) ? 0 : (timestep % numRecordingTimesteps);",
    );
    runner.line("// advance spike queues and reset spike counts");
    for (i, group) in merged.spike_queue_update_groups.iter().enumerate() {
        runner.open(&format!("for (unsigned int g = 0; g < {}; g++)", group.merged.len()));
        runner.line(format!(
            "update{}Group{}(&{}[g]);",
            "NeuronSpikeQueueUpdate",
            i,
            instance_name("NeuronSpikeQueueUpdate", i)
        ));
        runner.close();
    }
    runner.line("// advance dendritic delay pointers");
    for (i, group) in merged.dendritic_delay_update_groups.iter().enumerate() {
        runner.open(&format!("for (unsigned int g = 0; g < {}; g++)", group.merged.len()));
        runner.line(format!(
            "update{}Group{}(&{}[g]);",
            "SynapseDendriticDelayUpdate",
            i,
            instance_name("SynapseDendriticDelayUpdate", i)
        ));
        runner.close();
    }
    runner.line("// neuron update");
    runner.line("updateNeurons(t, recordingTimestep);");
    runner.line("// presynaptic update");
    runner.line("updatePresynaptic(t);");
    runner.line("// postsynaptic learning");
    runner.line("updatePostsynaptic(t);");
    runner.line("// synapse dynamics");
    runner.line("updateSynapseDynamics(t);");
    runner.close();

    GeneratedModule {
        definitions: definitions.into_string(),
        neuron_update: neuron_update.into_string(),
        synapse_update: synapse_update.into_string(),
        init: init.into_string(),
        custom_update: custom_update.into_string(),
        runner: runner.into_string(),
    }
}

fn sanitise(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
