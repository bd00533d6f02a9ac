// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Initialisation merged groups.
//!
//! The init pass seeds per-neuron RNG state where the backend keeps
//! any, runs every variable initialiser, zeroes spike state and fused
//! input accumulators, builds sparse connectivity (row build then
//! column build, with atomic row-length increments and bounds checks),
//! and initialises kernel weights by modular decomposition of the
//! thread index across kernel dimensions.

use crate::backend::{AtomicMemSpace, AtomicOperation, Backend};
use crate::code_stream::CodeStream;
use crate::environment::{emit_statements, KernelEnvironment};
use crate::merged::{partition_by_digest, Field, FieldInit, GroupRef, MergedGroup};
use crate::neuron_update::{add_array_field, add_param_bindings, resolve_residual};
use crate::synapse_update::{add_synapse_size_fields, bind_rng_functions};
use crate::Result;
use neurogen_model::{
    HashBuilder, HashDigest, Model, NeuronGroup, NeuronGroupId, SynapseGroup, SynapseGroupId,
    VarInit,
};
use neurogen_transpiler::{Diagnostic, ErrorHandler};
use neurogen_types::{write_numeric, NumericType, ResolvedType};

/// Run one variable initialiser: bind `value` to a local, emit the
/// snippet code, then store the local through `write_targets`
#[allow(clippy::too_many_arguments)]
fn emit_var_init(
    env: &mut KernelEnvironment<'_>,
    stream: &mut CodeStream,
    init: &VarInit,
    var_name: &str,
    var_ty: &ResolvedType,
    context: &str,
    write_targets: &[String],
    diagnostics: &mut Vec<Diagnostic>,
) {
    if !init.is_code_required() {
        return;
    }
    stream.open("");
    env.push_scope();
    stream.line(format!("{} initVal;", var_ty.remove_const().name()));
    env.add("value", var_ty.remove_const(), "initVal");

    let mut handler = ErrorHandler::new(format!("{} variable '{}' initialisation", context, var_name));
    if !emit_statements(env, init.code(), &mut handler, stream) {
        diagnostics.extend(handler.into_diagnostics());
    }
    for target in write_targets {
        env.print_line(stream, format!("{} = initVal;", target));
    }
    env.pop_scope(stream);
    stream.close();
}

fn add_init_param_bindings<I: Copy, G>(
    env: &mut KernelEnvironment<'_>,
    merged: &MergedGroup<'_, I, G>,
    init_of: impl Fn(&G) -> &VarInit + Clone,
    suffix: &str,
) {
    let snippet = init_of(merged.archetype()).snippet().clone();
    let params_of = init_of.clone();
    add_param_bindings(env, merged, snippet.params.iter().cloned(), suffix, move |g| {
        params_of(g).params()
    });
    add_param_bindings(
        env,
        merged,
        snippet.derived_params.iter().map(|d| d.name.clone()),
        suffix,
        move |g| init_of(g).derived_params(),
    );
}

// ---------------------------------------------------------------------
// Neuron initialisation
// ---------------------------------------------------------------------

/// Merged neuron-init group: spike state, neuron variables, fused
/// input accumulators and fused pre/post weight-update state
pub struct NeuronInitGroupMerged<'m> {
    pub merged: MergedGroup<'m, NeuronGroupId, NeuronGroup>,
}

impl<'m> NeuronInitGroupMerged<'m> {
    pub fn merge_digest(model: &Model, id: NeuronGroupId) -> HashDigest {
        let ng = model.neuron_group(id);
        let mut hash = HashBuilder::new("neuron-init-merge");
        hash.update_digest(&ng.init_hash_digest());
        for &sg in ng.fused_psm_in_syn() {
            hash.update_digest(&model.synapse_group(sg).ps_init_hash_digest());
        }
        for &sg in ng.fused_pre_output_out_syn() {
            hash.update_digest(&model.synapse_group(sg).pre_output_hash_digest());
        }
        for &cs in ng.current_sources() {
            hash.update_digest(&model.current_source(cs).init_hash_digest());
        }
        for &sg in ng.fused_wu_pre_out_syn() {
            hash.update_digest(&model.synapse_group(sg).wu_pre_init_hash_digest());
        }
        for &sg in ng.fused_wu_post_in_syn() {
            hash.update_digest(&model.synapse_group(sg).wu_post_init_hash_digest());
        }
        hash.finalise()
    }

    pub fn build(model: &'m Model) -> Vec<NeuronInitGroupMerged<'m>> {
        partition_by_digest(model.neuron_groups(), |id, _| Self::merge_digest(model, id))
            .into_iter()
            .map(|merged| NeuronInitGroupMerged { merged })
            .collect()
    }

    /// Emit the per-neuron init body (thread index `lid`)
    pub fn generate(
        &mut self,
        model: &'m Model,
        backend: &dyn Backend,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<String> {
        let ctx = model.type_context();
        let scalar = ctx.scalar_type();
        let time = ctx.time_type();
        let uint = ResolvedType::numeric(NumericType::Uint32);
        let batch_size = model.batch_size();
        let archetype = self.merged.archetype();
        let slots = archetype.num_delay_slots();

        let mut stream = CodeStream::new();
        let mut env = KernelEnvironment::new(&ctx);
        env.push_scope();
        env.add("id", uint.add_const(), "lid");
        env.add("num_neurons", uint.add_const(), "group->numNeurons");
        self.merged.add_field(crate::merged::Field {
            name: "numNeurons".into(),
            ty: uint.clone(),
            values: self
                .merged
                .groups()
                .iter()
                .map(|g| crate::merged::FieldInit::U32(g.num_neurons()))
                .collect(),
        })?;

        let rng_required = archetype
            .var_initialisers()
            .values()
            .any(|v| v.is_rng_required())
            || archetype
                .current_sources()
                .iter()
                .any(|&cs| model.current_source(cs).is_init_rng_required());
        if rng_required {
            let rng = backend.gen_global_rng_skip_ahead(&mut stream, "lid");
            bind_rng_functions(&mut env, model, &rng);
        }
        if backend.is_population_rng_required() {
            add_array_field(&mut env, &self.merged, "_rng", "rng".into(), uint.clone(), "rng", GroupRef::Neuron);
            env.mark_used("_rng");
            env.flush(&mut stream);
            stream.line("// seed population RNG");
            let rng_element = env.resolve("$(_rng)[lid]");
            backend.gen_population_rng_init(&mut stream, &rng_element, "deviceRngSeed", "lid");
        }

        // Zero spike state across every delay slot and batch
        let copies = batch_size * slots;
        if archetype.is_true_spike_required() {
            add_array_field(&mut env, &self.merged, "_spk_cnt", "spkCnt".into(), uint.clone(), "spkCnt", GroupRef::Neuron);
            add_array_field(&mut env, &self.merged, "_spk", "spk".into(), uint.clone(), "spk", GroupRef::Neuron);
            stream.line("// zero spike state");
            stream.open(&format!("for (unsigned int d = 0; d < {}; d++)", copies));
            env.print_line(&mut stream, "$(_spk)[(d * $(num_neurons)) + lid] = 0;");
            stream.open("if (lid == 0)");
            env.print_line(&mut stream, "$(_spk_cnt)[d] = 0;");
            stream.close();
            stream.close();
        }
        if archetype.is_spike_event_required() {
            add_array_field(&mut env, &self.merged, "_spk_evnt_cnt", "spkEvntCnt".into(), uint.clone(), "spkEvntCnt", GroupRef::Neuron);
            add_array_field(&mut env, &self.merged, "_spk_evnt", "spkEvnt".into(), uint.clone(), "spkEvnt", GroupRef::Neuron);
            stream.open(&format!("for (unsigned int d = 0; d < {}; d++)", copies));
            env.print_line(&mut stream, "$(_spk_evnt)[(d * $(num_neurons)) + lid] = 0;");
            stream.open("if (lid == 0)");
            env.print_line(&mut stream, "$(_spk_evnt_cnt)[d] = 0;");
            stream.close();
            stream.close();
        }
        for (required, env_name, field, var) in [
            (archetype.is_spike_time_required(), "_st", "sT", "sT"),
            (archetype.is_prev_spike_time_required(), "_prev_st", "prevST", "prevST"),
            (archetype.is_spike_event_time_required(), "_set", "seT", "seT"),
            (
                archetype.is_prev_spike_event_time_required(),
                "_prev_set",
                "prevSET",
                "prevSET",
            ),
        ] {
            if required {
                add_array_field(&mut env, &self.merged, env_name, field.into(), time.clone(), var, GroupRef::Neuron);
                stream.open(&format!("for (unsigned int d = 0; d < {}; d++)", copies));
                env.print_line(
                    &mut stream,
                    format!(
                        "$({})[(d * $(num_neurons)) + lid] = {};",
                        env_name,
                        write_numeric(-1.0e38, &time)
                    ),
                );
                stream.close();
            }
        }

        // Neuron variables
        stream.line("// neuron state variables");
        for var in &archetype.model().vars {
            let var_ty = ctx.resolve(&var.ty).unwrap_or_else(|_| scalar.clone());
            add_array_field(
                &mut env,
                &self.merged,
                &format!("_{}_array", var.name),
                var.name.clone(),
                var_ty.clone(),
                &var.name,
                GroupRef::Neuron,
            );
            let queued = archetype.is_var_queue_required(&var.name) && slots > 1;
            let dims = var.access.dims();
            let copies = match (dims.element, dims.batch) {
                (true, true) => {
                    if queued {
                        batch_size * slots
                    } else {
                        batch_size
                    }
                }
                (true, false) => {
                    if queued {
                        slots
                    } else {
                        1
                    }
                }
                (false, true) => batch_size,
                (false, false) => 1,
            };
            let targets: Vec<String> = (0..copies)
                .map(|c| {
                    if dims.element {
                        format!("$(_{}_array)[({} * $(num_neurons)) + lid]", var.name, c)
                    } else {
                        format!("$(_{}_array)[{}]", var.name, c)
                    }
                })
                .collect();
            add_init_param_bindings(
                &mut env,
                &self.merged,
                {
                    let name = var.name.clone();
                    move |g: &NeuronGroup| &g.var_initialisers()[&name]
                },
                &format!("{}Init", var.name),
            );
            emit_var_init(
                &mut env,
                &mut stream,
                &archetype.var_initialisers()[&var.name],
                &var.name,
                &var_ty,
                &format!("Neuron group '{}'", archetype.name()),
                &targets,
                diagnostics,
            );
        }

        // Fused incoming postsynaptic state: zero the accumulator and
        // the dendritic delay buffer, init PSM variables
        let psm_children = build_children(model, &self.merged, |g| g.fused_psm_in_syn().to_vec());
        for (k, child) in psm_children.iter().enumerate() {
            let suffix = format!("InSyn{}", k);
            let sg = child.archetype();
            stream.line(format!("// fused postsynaptic model {}", k));
            let mut child_fields = Vec::new();
            {
                env.push_scope();
                add_array_field(&mut env, child, "_out_post", format!("outPost{}", suffix), scalar.clone(), "outPost", GroupRef::Synapse);
                stream.open(&format!("for (unsigned int b = 0; b < {}; b++)", batch_size));
                env.print_line(
                    &mut stream,
                    format!("$(_out_post)[(b * $(num_neurons)) + lid] = {};", write_numeric(0.0, &scalar)),
                );
                stream.close();
                if sg.is_dendritic_delay_required() {
                    add_array_field(&mut env, child, "_den_delay", format!("denDelay{}", suffix), scalar.clone(), "denDelay", GroupRef::Synapse);
                    let den_copies = batch_size * sg.max_dendritic_delay_timesteps();
                    stream.open(&format!("for (unsigned int d = 0; d < {}; d++)", den_copies));
                    env.print_line(
                        &mut stream,
                        format!("$(_den_delay)[(d * $(num_neurons)) + lid] = {};", write_numeric(0.0, &scalar)),
                    );
                    stream.close();
                    stream.open("if (lid == 0)");
                    add_array_field(&mut env, child, "_den_delay_ptr", format!("denDelayPtr{}", suffix), uint.clone(), "denDelayPtr", GroupRef::Synapse);
                    env.print_line(&mut stream, "*$(_den_delay_ptr) = 0;");
                    stream.close();
                }
                for var in &sg.ps_model().vars {
                    let var_ty = ctx.resolve(&var.ty).unwrap_or_else(|_| scalar.clone());
                    add_array_field(
                        &mut env,
                        child,
                        &format!("_{}_array", var.name),
                        format!("{}{}", var.name, suffix),
                        var_ty.clone(),
                        &var.name,
                        GroupRef::Synapse,
                    );
                    let targets: Vec<String> = (0..batch_size)
                        .map(|b| format!("$(_{}_array)[({} * $(num_neurons)) + lid]", var.name, b))
                        .collect();
                    add_init_param_bindings(
                        &mut env,
                        child,
                        {
                            let name = var.name.clone();
                            move |g: &SynapseGroup| &g.ps_var_initialisers()[&name]
                        },
                        &format!("{}{}", var.name, suffix),
                    );
                    emit_var_init(
                        &mut env,
                        &mut stream,
                        &sg.ps_var_initialisers()[&var.name],
                        &var.name,
                        &var_ty,
                        &format!("Synapse group '{}' postsynaptic model", sg.name()),
                        &targets,
                        diagnostics,
                    );
                }
                env.pop_scope(&mut stream);
                child_fields.extend(env.take_fields());
            }
            self.merged.add_fields(child_fields)?;
        }

        // Fused presynaptic output accumulators
        let pre_output_children =
            build_children(model, &self.merged, |g| g.fused_pre_output_out_syn().to_vec());
        for (k, child) in pre_output_children.iter().enumerate() {
            env.push_scope();
            add_array_field(&mut env, child, "_out_pre", format!("outPre{}", k), scalar.clone(), "outPre", GroupRef::Synapse);
            stream.open(&format!("for (unsigned int b = 0; b < {}; b++)", batch_size));
            env.print_line(
                &mut stream,
                format!("$(_out_pre)[(b * $(num_neurons)) + lid] = {};", write_numeric(0.0, &scalar)),
            );
            stream.close();
            env.pop_scope(&mut stream);
            let fields = env.take_fields();
            self.merged.add_fields(fields)?;
        }

        // Current source variables
        let cs_lists: Vec<Vec<neurogen_model::CurrentSourceId>> = self
            .merged
            .groups()
            .iter()
            .map(|g| g.current_sources().to_vec())
            .collect();
        for k in 0..cs_lists[0].len() {
            let child: MergedGroup<'m, neurogen_model::CurrentSourceId, neurogen_model::CurrentSource> =
                MergedGroup::new(
                    k,
                    cs_lists
                        .iter()
                        .map(|l| (l[k], model.current_source(l[k])))
                        .collect(),
                );
            let cs = child.archetype();
            env.push_scope();
            for var in &cs.model().vars {
                let var_ty = ctx.resolve(&var.ty).unwrap_or_else(|_| scalar.clone());
                add_array_field(
                    &mut env,
                    &child,
                    &format!("_{}_array", var.name),
                    format!("{}CS{}", var.name, k),
                    var_ty.clone(),
                    &var.name,
                    GroupRef::CurrentSource,
                );
                let targets: Vec<String> = (0..batch_size)
                    .map(|b| format!("$(_{}_array)[({} * $(num_neurons)) + lid]", var.name, b))
                    .collect();
                add_init_param_bindings(
                    &mut env,
                    &child,
                    {
                        let name = var.name.clone();
                        move |g: &neurogen_model::CurrentSource| &g.var_initialisers()[&name]
                    },
                    &format!("{}CS{}", var.name, k),
                );
                emit_var_init(
                    &mut env,
                    &mut stream,
                    &cs.var_initialisers()[&var.name],
                    &var.name,
                    &var_ty,
                    &format!("Current source '{}'", cs.name()),
                    &targets,
                    diagnostics,
                );
            }
            env.pop_scope(&mut stream);
            let fields = env.take_fields();
            self.merged.add_fields(fields)?;
        }

        // Fused pre / post weight-update variables
        for (pre, select) in [
            (true, (|g: &NeuronGroup| g.fused_wu_pre_out_syn().to_vec()) as fn(&NeuronGroup) -> Vec<SynapseGroupId>),
            (false, |g: &NeuronGroup| g.fused_wu_post_in_syn().to_vec()),
        ] {
            let children = build_children(model, &self.merged, select);
            for (k, child) in children.iter().enumerate() {
                let sg = child.archetype();
                let (vars, inits, suffix, delay_slots) = if pre {
                    (
                        &sg.wu_model().pre_vars,
                        sg.wu_pre_var_initialisers(),
                        format!("OutSynWUMPre{}", k),
                        if sg.delay_steps() != 0 { slots } else { 1 },
                    )
                } else {
                    (
                        &sg.wu_model().post_vars,
                        sg.wu_post_var_initialisers(),
                        format!("InSynWUMPost{}", k),
                        if sg.back_prop_delay_steps() != 0 { slots } else { 1 },
                    )
                };
                env.push_scope();
                for var in vars {
                    let var_ty = ctx.resolve(&var.ty).unwrap_or_else(|_| scalar.clone());
                    add_array_field(
                        &mut env,
                        child,
                        &format!("_{}_array", var.name),
                        format!("{}{}", var.name, suffix),
                        var_ty.clone(),
                        &var.name,
                        GroupRef::Synapse,
                    );
                    let targets: Vec<String> = (0..(batch_size * delay_slots))
                        .map(|c| format!("$(_{}_array)[({} * $(num_neurons)) + lid]", var.name, c))
                        .collect();
                    {
                        let name = var.name.clone();
                        if pre {
                            add_init_param_bindings(
                                &mut env,
                                child,
                                move |g: &SynapseGroup| &g.wu_pre_var_initialisers()[&name],
                                &format!("{}{}", var.name, suffix),
                            );
                        } else {
                            add_init_param_bindings(
                                &mut env,
                                child,
                                move |g: &SynapseGroup| &g.wu_post_var_initialisers()[&name],
                                &format!("{}{}", var.name, suffix),
                            );
                        }
                    }
                    emit_var_init(
                        &mut env,
                        &mut stream,
                        &inits[&var.name],
                        &var.name,
                        &var_ty,
                        &format!("Synapse group '{}' weight update model", sg.name()),
                        &targets,
                        diagnostics,
                    );
                }
                env.pop_scope(&mut stream);
                let fields = env.take_fields();
                self.merged.add_fields(fields)?;
            }
        }

        env.pop_scope(&mut stream);
        env.flush(&mut stream);
        self.merged.add_fields(env.take_fields())?;
        Ok(resolve_residual(&stream.into_string()))
    }
}

fn build_children<'m>(
    model: &'m Model,
    merged: &MergedGroup<'m, NeuronGroupId, NeuronGroup>,
    select: impl Fn(&NeuronGroup) -> Vec<SynapseGroupId>,
) -> Vec<MergedGroup<'m, SynapseGroupId, SynapseGroup>> {
    let lists: Vec<Vec<SynapseGroupId>> = merged.groups().iter().map(|g| select(g)).collect();
    (0..lists[0].len())
        .map(|k| {
            MergedGroup::new(
                k,
                lists
                    .iter()
                    .map(|l| (l[k], model.synapse_group(l[k])))
                    .collect(),
            )
        })
        .collect()
}

// ---------------------------------------------------------------------
// Synapse initialisation (dense / kernel weights)
// ---------------------------------------------------------------------

/// Merged synapse-init group: per-synapse weight initialisation for
/// dense matrices, and kernel-weight initialisation by modular
/// decomposition of the thread index
pub struct SynapseInitGroupMerged<'m> {
    pub merged: MergedGroup<'m, SynapseGroupId, SynapseGroup>,
}

impl<'m> SynapseInitGroupMerged<'m> {
    pub fn build(model: &'m Model) -> Vec<SynapseInitGroupMerged<'m>> {
        let members = model.synapse_groups().filter(|(_, sg)| {
            (sg.matrix_type().is_dense() && sg.is_wu_var_init_required())
                || (sg.matrix_type().has_kernel_weights() && !sg.kernel_size().is_empty())
        });
        partition_by_digest(members, |id, _| model.synapse_wu_init_hash_digest(id))
            .into_iter()
            .map(|merged| SynapseInitGroupMerged { merged })
            .collect()
    }

    pub fn generate(
        &mut self,
        model: &Model,
        backend: &dyn Backend,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<String> {
        let ctx = model.type_context();
        let scalar = ctx.scalar_type();
        let uint = ResolvedType::numeric(NumericType::Uint32);
        let sg = self.merged.archetype();
        let kernel = sg.matrix_type().has_kernel_weights();

        let mut stream = CodeStream::new();
        let mut env = KernelEnvironment::new(&ctx);
        env.push_scope();
        add_synapse_size_fields(&mut env, &mut self.merged, model, backend)?;

        let rng_required = sg
            .wu_var_initialisers()
            .values()
            .any(|v| v.is_rng_required());
        if rng_required {
            let rng = backend.gen_global_rng_skip_ahead(&mut stream, "lid");
            bind_rng_functions(&mut env, model, &rng);
        }

        if kernel {
            // Modular decomposition of lid across kernel dimensions
            let dims = sg.kernel_size();
            stream.line("// kernel weight initialisation");
            stream.open(&format!(
                "if (lid < {})",
                sg.kernel_size_flattened().max(1)
            ));
            for (i, _) in dims.iter().enumerate() {
                let trailing: u64 = dims[i + 1..].iter().map(|&d| d as u64).product();
                let mut expr = if trailing > 1 {
                    format!("(lid / {})", trailing)
                } else {
                    "lid".to_string()
                };
                if i > 0 {
                    expr = format!("({} % {})", expr, dims[i]);
                }
                stream.line(format!("const unsigned int kernelID{} = {};", i, expr));
                env.add(format!("id_kernel_{}", i), uint.add_const(), format!("kernelID{}", i));
            }
            env.add("id_kernel", uint.add_const(), "lid");
        } else {
            stream.line("// dense per-synapse weight initialisation");
            env.print_open(&mut stream, "if (lid < $(num_post))");
            env.add("id_post", uint.add_const(), "lid");
        }

        for var in &sg.wu_model().vars {
            let var_ty = ctx.resolve(&var.ty).unwrap_or_else(|_| scalar.clone());
            add_array_field(
                &mut env,
                &self.merged,
                &format!("_{}_array", var.name),
                var.name.clone(),
                var_ty.clone(),
                &var.name,
                GroupRef::Synapse,
            );
            add_init_param_bindings(
                &mut env,
                &self.merged,
                {
                    let name = var.name.clone();
                    move |g: &SynapseGroup| &g.wu_var_initialisers()[&name]
                },
                &format!("{}Init", var.name),
            );
            if kernel {
                let targets = vec![format!("$(_{}_array)[lid]", var.name)];
                emit_var_init(
                    &mut env,
                    &mut stream,
                    &sg.wu_var_initialisers()[&var.name],
                    &var.name,
                    &var_ty,
                    &format!("Synapse group '{}'", sg.name()),
                    &targets,
                    diagnostics,
                );
            } else {
                env.push_scope();
                env.print_open(&mut stream, "for (unsigned int i = 0; i < $(num_pre); i++)");
                env.add("id_pre", uint.add_const(), "i");
                env.add("id_syn", uint.add_const(), "((i * $(row_stride)) + lid)");
                let targets = vec![format!("$(_{}_array)[$(id_syn)]", var.name)];
                emit_var_init(
                    &mut env,
                    &mut stream,
                    &sg.wu_var_initialisers()[&var.name],
                    &var.name,
                    &var_ty,
                    &format!("Synapse group '{}'", sg.name()),
                    &targets,
                    diagnostics,
                );
                stream.close();
                env.pop_scope(&mut stream);
            }
        }
        stream.close();

        env.pop_scope(&mut stream);
        env.flush(&mut stream);
        self.merged.add_fields(env.take_fields())?;
        Ok(resolve_residual(&stream.into_string()))
    }
}

// ---------------------------------------------------------------------
// Sparse connectivity build
// ---------------------------------------------------------------------

/// Merged connectivity-init group: row build then, when present,
/// column build
pub struct ConnectivityInitGroupMerged<'m> {
    pub merged: MergedGroup<'m, SynapseGroupId, SynapseGroup>,
}

impl<'m> ConnectivityInitGroupMerged<'m> {
    pub fn build(model: &'m Model) -> Vec<ConnectivityInitGroupMerged<'m>> {
        let members = model
            .synapse_groups()
            .filter(|(_, sg)| sg.is_sparse_connectivity_init_required());
        partition_by_digest(members, |id, _| {
            model.synapse_connectivity_init_hash_digest(id)
        })
        .into_iter()
        .map(|merged| ConnectivityInitGroupMerged { merged })
        .collect()
    }

    /// Emit the build body: one thread per row for row build, one per
    /// column for column build
    pub fn generate(
        &mut self,
        model: &Model,
        backend: &dyn Backend,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<String> {
        let ctx = model.type_context();
        let uint = ResolvedType::numeric(NumericType::Uint32);
        let sg = self.merged.archetype();
        let trg = model.neuron_group(sg.trg());
        let connectivity = sg.connectivity_initialiser();
        let snippet = connectivity.snippet().clone();
        let bitmask = sg.matrix_type().is_bitmask();
        let atomic_add =
            backend.atomic(NumericType::Uint32, AtomicOperation::Add, AtomicMemSpace::Global);
        let atomic_or =
            backend.atomic(NumericType::Uint32, AtomicOperation::Or, AtomicMemSpace::Global);

        let mut stream = CodeStream::new();
        let mut env = KernelEnvironment::new(&ctx);
        env.push_scope();
        add_synapse_size_fields(&mut env, &mut self.merged, model, backend)?;
        self.merged.add_field(Field {
            name: "maxRowLength".into(),
            ty: uint.clone(),
            values: self
                .merged
                .groups()
                .iter()
                .map(|g| FieldInit::U32(g.max_connections()))
                .collect(),
        })?;

        if bitmask {
            add_array_field(&mut env, &self.merged, "_gp", "gp".into(), uint.clone(), "gp", GroupRef::Synapse);
        } else {
            add_array_field(&mut env, &self.merged, "_row_length", "rowLength".into(), uint.clone(), "rowLength", GroupRef::Synapse);
            let ind_ty = ResolvedType::numeric(sg.sparse_ind_type(trg.num_neurons()));
            add_array_field(&mut env, &self.merged, "_ind", "ind".into(), ind_ty, "ind", GroupRef::Synapse);
        }

        let rng_required = connectivity.row_build().is_rng_required()
            || connectivity.col_build().is_rng_required();
        if rng_required {
            let rng = backend.gen_global_rng_skip_ahead(&mut stream, "lid");
            bind_rng_functions(&mut env, model, &rng);
        }

        add_param_bindings(&mut env, &self.merged, snippet.params.iter().cloned(), "Conn", |g| {
            g.connectivity_initialiser().params()
        });
        add_param_bindings(
            &mut env,
            &self.merged,
            snippet.derived_params.iter().map(|d| d.name.clone()),
            "Conn",
            |g| g.connectivity_initialiser().derived_params(),
        );

        // Row build: thread per source neuron
        if !connectivity.row_build().is_empty() {
            stream.line("// build connectivity rows");
            env.print_open(&mut stream, "if (lid < $(num_pre))");
            env.push_scope();
            env.add("id_pre", uint.add_const(), "lid");
            if bitmask {
                env.add(
                    "addSynapse",
                    ResolvedType::function(ResolvedType::void(), vec![uint.clone()]),
                    format!(
                        "{}(&$(_gp)[((lid * $(row_stride)) + $(0)) / 32], 1 << (((lid * $(row_stride)) + $(0)) % 32))",
                        atomic_or
                    ),
                );
            } else {
                // Bounds-checked append with an atomic row-length bump
                env.add(
                    "addSynapse",
                    ResolvedType::function(ResolvedType::void(), vec![uint.clone()]),
                    format!(
                        "{{ const unsigned int rowIdx = {}(&$(_row_length)[lid], 1); if (rowIdx < group->maxRowLength) $(_ind)[(lid * $(row_stride)) + rowIdx] = $(0); }}",
                        atomic_add
                    ),
                );
            }
            let mut handler = ErrorHandler::new(format!(
                "Synapse group '{}' connectivity row build code",
                sg.name()
            ));
            if !emit_statements(&mut env, connectivity.row_build(), &mut handler, &mut stream) {
                diagnostics.extend(handler.into_diagnostics());
            }
            env.pop_scope(&mut stream);
            stream.close();
        }

        // Column build: thread per target neuron, appending into rows
        // through atomic row-length counters
        if !connectivity.col_build().is_empty() && !bitmask {
            stream.line("// build connectivity columns");
            env.print_open(&mut stream, "if (lid < $(num_post))");
            env.push_scope();
            env.add("id_post", uint.add_const(), "lid");
            env.add(
                "addSynapse",
                ResolvedType::function(ResolvedType::void(), vec![uint.clone()]),
                format!(
                    "{{ const unsigned int rowIdx = {}(&$(_row_length)[$(0)], 1); if (rowIdx < group->maxRowLength) $(_ind)[($(0) * $(row_stride)) + rowIdx] = lid; }}",
                    atomic_add
                ),
            );
            let mut handler = ErrorHandler::new(format!(
                "Synapse group '{}' connectivity column build code",
                sg.name()
            ));
            if !emit_statements(&mut env, connectivity.col_build(), &mut handler, &mut stream) {
                diagnostics.extend(handler.into_diagnostics());
            }
            env.pop_scope(&mut stream);
            stream.close();
        }

        env.pop_scope(&mut stream);
        env.flush(&mut stream);
        self.merged.add_fields(env.take_fields())?;
        Ok(resolve_residual(&stream.into_string()))
    }
}

// ---------------------------------------------------------------------
// Sparse variable initialisation & postsynaptic remap
// ---------------------------------------------------------------------

/// Merged sparse-init group: per-synapse variable initialisation over
/// built rows, plus the column-major remap for postsynaptic learning
pub struct SparseInitGroupMerged<'m> {
    pub merged: MergedGroup<'m, SynapseGroupId, SynapseGroup>,
}

impl<'m> SparseInitGroupMerged<'m> {
    pub fn build(model: &'m Model, backend: &dyn Backend) -> Vec<SparseInitGroupMerged<'m>> {
        let members = model.synapse_groups().filter(|(_, sg)| {
            sg.matrix_type().is_sparse()
                && (sg.is_wu_var_init_required()
                    || (backend.is_postsynaptic_remap_required()
                        && !sg.wu_learn_post_code().is_empty()))
        });
        partition_by_digest(members, |id, _| model.synapse_wu_init_hash_digest(id))
            .into_iter()
            .map(|merged| SparseInitGroupMerged { merged })
            .collect()
    }

    pub fn generate(
        &mut self,
        model: &Model,
        backend: &dyn Backend,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<String> {
        let ctx = model.type_context();
        let scalar = ctx.scalar_type();
        let uint = ResolvedType::numeric(NumericType::Uint32);
        let sg = self.merged.archetype();
        let trg = model.neuron_group(sg.trg());
        let atomic_add =
            backend.atomic(NumericType::Uint32, AtomicOperation::Add, AtomicMemSpace::Global);

        let mut stream = CodeStream::new();
        let mut env = KernelEnvironment::new(&ctx);
        env.push_scope();
        add_synapse_size_fields(&mut env, &mut self.merged, model, backend)?;
        add_array_field(&mut env, &self.merged, "_row_length", "rowLength".into(), uint.clone(), "rowLength", GroupRef::Synapse);
        let ind_ty = ResolvedType::numeric(sg.sparse_ind_type(trg.num_neurons()));
        add_array_field(&mut env, &self.merged, "_ind", "ind".into(), ind_ty, "ind", GroupRef::Synapse);

        let rng_required = sg
            .wu_var_initialisers()
            .values()
            .any(|v| v.is_rng_required());
        if rng_required {
            let rng = backend.gen_global_rng_skip_ahead(&mut stream, "lid");
            bind_rng_functions(&mut env, model, &rng);
        }

        // Walk rows with this thread's column index
        if sg.is_wu_var_init_required() {
            stream.line("// sparse per-synapse variable initialisation");
            env.print_open(&mut stream, "for (unsigned int r = 0; r < $(num_pre); r++)");
            env.print_open(&mut stream, "if (lid < $(_row_length)[r])");
            env.push_scope();
            env.add("id_pre", uint.add_const(), "r");
            env.add("id_syn", uint.add_const(), "((r * $(row_stride)) + lid)");
            env.add("id_post", uint.add_const(), "$(_ind)[$(id_syn)]");
            for var in &sg.wu_model().vars {
                let var_ty = ctx.resolve(&var.ty).unwrap_or_else(|_| scalar.clone());
                add_array_field(
                    &mut env,
                    &self.merged,
                    &format!("_{}_array", var.name),
                    var.name.clone(),
                    var_ty.clone(),
                    &var.name,
                    GroupRef::Synapse,
                );
                add_init_param_bindings(
                    &mut env,
                    &self.merged,
                    {
                        let name = var.name.clone();
                        move |g: &SynapseGroup| &g.wu_var_initialisers()[&name]
                    },
                    &format!("{}Init", var.name),
                );
                let targets = vec![format!("$(_{}_array)[$(id_syn)]", var.name)];
                emit_var_init(
                    &mut env,
                    &mut stream,
                    &sg.wu_var_initialisers()[&var.name],
                    &var.name,
                    &var_ty,
                    &format!("Synapse group '{}'", sg.name()),
                    &targets,
                    diagnostics,
                );
            }
            env.pop_scope(&mut stream);
            stream.close();
            stream.close();
        }

        // Column-major remap for postsynaptic learning
        if backend.is_postsynaptic_remap_required() && !sg.wu_learn_post_code().is_empty() {
            add_array_field(&mut env, &self.merged, "_col_length", "colLength".into(), uint.clone(), "colLength", GroupRef::Synapse);
            add_array_field(&mut env, &self.merged, "_remap", "remap".into(), uint.clone(), "remap", GroupRef::Synapse);
            self.merged.add_field(Field {
                name: "colStride".into(),
                ty: uint.clone(),
                values: self
                    .merged
                    .groups()
                    .iter()
                    .map(|g| FieldInit::U32(g.max_source_connections()))
                    .collect(),
            })?;
            stream.line("// build postsynaptic remap");
            env.print_open(&mut stream, "for (unsigned int r = 0; r < $(num_pre); r++)");
            env.print_open(&mut stream, "if (lid < $(_row_length)[r])");
            env.print_line(&mut stream, "const unsigned int synAddress = (r * $(row_stride)) + lid;");
            env.print_line(&mut stream, "const unsigned int postInd = $(_ind)[synAddress];");
            env.print_line(
                &mut stream,
                format!(
                    "const unsigned int colIdx = {}(&$(_col_length)[postInd], 1);",
                    atomic_add
                ),
            );
            env.print_line(
                &mut stream,
                "if (colIdx < group->colStride) $(_remap)[(postInd * group->colStride) + colIdx] = synAddress;",
            );
            stream.close();
            stream.close();
        }

        env.pop_scope(&mut stream);
        env.flush(&mut stream);
        self.merged.add_fields(env.take_fields())?;
        Ok(resolve_residual(&stream.into_string()))
    }
}

/// Custom-update variable initialisation shares the neuron-style var
/// init path; collected here so the init kernel covers every group kind
pub struct CustomUpdateInitGroupMerged<'m> {
    pub merged: MergedGroup<'m, neurogen_model::CustomUpdateId, neurogen_model::CustomUpdate>,
}

impl<'m> CustomUpdateInitGroupMerged<'m> {
    pub fn build(model: &'m Model) -> Vec<CustomUpdateInitGroupMerged<'m>> {
        let members = model
            .custom_updates()
            .filter(|(_, cu)| !cu.var_initialisers().is_empty());
        partition_by_digest(members, |_, cu| cu.init_hash_digest())
            .into_iter()
            .map(|merged| CustomUpdateInitGroupMerged { merged })
            .collect()
    }

    pub fn generate(
        &mut self,
        model: &Model,
        backend: &dyn Backend,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<String> {
        let ctx = model.type_context();
        let scalar = ctx.scalar_type();
        let uint = ResolvedType::numeric(NumericType::Uint32);
        let cu = self.merged.archetype();
        let batch_copies = if cu.is_batched() { model.batch_size() } else { 1 };

        let mut stream = CodeStream::new();
        let mut env = KernelEnvironment::new(&ctx);
        env.push_scope();
        env.add("id", uint.add_const(), "lid");
        env.add("size", uint.add_const(), "group->size");
        self.merged.add_field(Field {
            name: "size".into(),
            ty: uint.clone(),
            values: self
                .merged
                .groups()
                .iter()
                .map(|g| FieldInit::U32(g.size()))
                .collect(),
        })?;

        let rng_required = cu.var_initialisers().values().any(|v| v.is_rng_required());
        if rng_required {
            let rng = backend.gen_global_rng_skip_ahead(&mut stream, "lid");
            bind_rng_functions(&mut env, model, &rng);
        }

        env.print_open(&mut stream, "if (lid < $(size))");
        for var in &cu.model().vars {
            let var_ty = ctx.resolve(&var.ty).unwrap_or_else(|_| scalar.clone());
            add_array_field(
                &mut env,
                &self.merged,
                &format!("_{}_array", var.name),
                var.name.clone(),
                var_ty.clone(),
                &var.name,
                GroupRef::CustomUpdate,
            );
            let targets: Vec<String> = (0..batch_copies)
                .map(|b| format!("$(_{}_array)[({} * $(size)) + lid]", var.name, b))
                .collect();
            emit_var_init(
                &mut env,
                &mut stream,
                &cu.var_initialisers()[&var.name],
                &var.name,
                &var_ty,
                &format!("Custom update '{}'", cu.name()),
                &targets,
                diagnostics,
            );
        }
        stream.close();

        env.pop_scope(&mut stream);
        env.flush(&mut stream);
        self.merged.add_fields(env.take_fields())?;
        Ok(resolve_residual(&stream.into_string()))
    }
}
