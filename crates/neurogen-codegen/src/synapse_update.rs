// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Synapse-update merged groups: presynaptic spike propagation,
//! postsynaptic learning and per-timestep synapse dynamics.
//!
//! Presynaptic propagation chooses between a presynaptic span (one
//! thread per source neuron, iterating its row) and a postsynaptic
//! span (one thread per target neuron, iterating the incoming spike
//! buffer). Accumulation uses a per-thread register when the matrix
//! guarantees one thread per target (dense / bitmask under a
//! postsynaptic span), block-shared accumulation when the target
//! population fits the block and the backend's shared atomics are
//! fast, and global atomics otherwise. Dendritic-delay writes always
//! use atomics because the delay offset is data-dependent.

use crate::backend::{AtomicMemSpace, AtomicOperation, Backend, Kernel};
use crate::code_stream::CodeStream;
use crate::environment::{emit_expression, emit_statements, KernelEnvironment};
use crate::merged::{partition_by_digest, Field, FieldInit, GroupRef, MergedGroup};
use crate::neuron_update::{
    add_array_field, add_egp_bindings, add_param_bindings, resolve_residual,
};
use crate::Result;
use neurogen_model::{
    Model, NeuronGroup, SpanType, SynapseGroup, SynapseGroupId, SynapseMatrixConnectivity,
};
use neurogen_transpiler::{Diagnostic, ErrorHandler};
use neurogen_types::{write_numeric, NumericType, ResolvedType};

/// Which accumulation strategy the presynaptic kernel uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accumulation {
    /// One thread per target neuron: accumulate in a register
    Register,
    /// Target population fits the block: accumulate in shared memory
    Shared,
    /// Fall back to global atomics
    GlobalAtomic,
}

/// Which emission pass a merged synapse group belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynapsePass {
    PresynapticUpdate,
    PostsynapticUpdate,
    SynapseDynamics,
}


/// Register the per-member population sizes and row stride as struct
/// fields: they never enter the merge digest, so they can differ
/// between members of one merged group
pub(crate) fn add_synapse_size_fields(
    env: &mut KernelEnvironment<'_>,
    merged: &mut MergedGroup<'_, SynapseGroupId, SynapseGroup>,
    model: &Model,
    backend: &dyn Backend,
) -> crate::Result<()> {
    let uint = ResolvedType::numeric(NumericType::Uint32);
    let values = |f: &dyn Fn(&SynapseGroup) -> u32| -> Vec<FieldInit> {
        merged.groups().iter().map(|g| FieldInit::U32(f(g))).collect()
    };
    let num_src = values(&|g| model.neuron_group(g.src()).num_neurons());
    let num_trg = values(&|g| model.neuron_group(g.trg()).num_neurons());
    let stride = values(&|g| {
        backend.synaptic_matrix_row_stride(g, model.neuron_group(g.trg()).num_neurons()) as u32
    });
    merged.add_field(Field {
        name: "numSrcNeurons".into(),
        ty: uint.clone(),
        values: num_src,
    })?;
    merged.add_field(Field {
        name: "numTrgNeurons".into(),
        ty: uint.clone(),
        values: num_trg,
    })?;
    merged.add_field(Field {
        name: "rowStride".into(),
        ty: uint.clone(),
        values: stride,
    })?;
    env.add("num_pre", uint.add_const(), "group->numSrcNeurons");
    env.add("num_post", uint.add_const(), "group->numTrgNeurons");
    env.add("row_stride", uint.add_const(), "group->rowStride");
    Ok(())
}

/// A merged group of synapse groups for one emission pass
pub struct SynapseGroupMerged<'m> {
    pub merged: MergedGroup<'m, SynapseGroupId, SynapseGroup>,
    pass: SynapsePass,
}

impl<'m> SynapseGroupMerged<'m> {
    pub fn build(model: &'m Model, pass: SynapsePass) -> Vec<SynapseGroupMerged<'m>> {
        let members = model.synapse_groups().filter(|(_, sg)| match pass {
            SynapsePass::PresynapticUpdate => {
                sg.is_true_spike_required() || sg.is_spike_event_required()
            }
            SynapsePass::PostsynapticUpdate => !sg.wu_learn_post_code().is_empty(),
            SynapsePass::SynapseDynamics => !sg.wu_synapse_dynamics_code().is_empty(),
        });
        partition_by_digest(members, |id, _| model.synapse_wu_hash_digest(id))
            .into_iter()
            .map(|merged| SynapseGroupMerged { merged, pass })
            .collect()
    }

    fn src<'a>(&self, model: &'a Model) -> &'a NeuronGroup {
        model.neuron_group(self.merged.archetype().src())
    }

    fn trg<'a>(&self, model: &'a Model) -> &'a NeuronGroup {
        model.neuron_group(self.merged.archetype().trg())
    }

    /// Read slot expression for the source spike queue, per the delay
    /// contract: (queuePtr + numSlots - delaySteps) mod numSlots
    fn src_spike_read_slot(&self, model: &Model) -> String {
        let sg = self.merged.archetype();
        let src = self.src(model);
        if src.is_delay_required() {
            format!(
                "(((*$(_src_spk_que_ptr)) + {}) % {})",
                src.num_delay_slots() - sg.delay_steps(),
                src.num_delay_slots()
            )
        } else {
            "0".to_string()
        }
    }

    fn trg_spike_read_slot(&self, model: &Model) -> String {
        let sg = self.merged.archetype();
        let trg = self.trg(model);
        if trg.is_delay_required() {
            format!(
                "(((*$(_trg_spk_que_ptr)) + {}) % {})",
                trg.num_delay_slots() - sg.back_prop_delay_steps(),
                trg.num_delay_slots()
            )
        } else {
            "0".to_string()
        }
    }

    fn accumulation(&self, model: &Model, backend: &dyn Backend) -> Accumulation {
        let sg = self.merged.archetype();
        let matrix = sg.matrix_type();
        if sg.span_type() == SpanType::Postsynaptic
            && (matrix.is_dense() || matrix.is_bitmask())
        {
            return Accumulation::Register;
        }
        let block_size = backend
            .preferences()
            .block_sizes
            .get(Kernel::PresynapticUpdate);
        if self.trg(model).num_neurons() <= block_size && !backend.are_shared_mem_atomics_slow()
        {
            Accumulation::Shared
        } else {
            Accumulation::GlobalAtomic
        }
    }

    /// Common environment: sizes, spike buffers, connectivity, weight
    /// state and pre/post neuron variable views
    #[allow(clippy::too_many_arguments)]
    fn bind_common(
        &mut self,
        model: &Model,
        backend: &dyn Backend,
        env: &mut KernelEnvironment<'_>,
    ) -> Result<()> {
        let ctx = model.type_context();
        let scalar = ctx.scalar_type();
        let time = ctx.time_type();
        let uint = ResolvedType::numeric(NumericType::Uint32);
        add_synapse_size_fields(env, &mut self.merged, model, backend)?;
        let sg = self.merged.archetype();
        let src = self.src(model);
        let trg = self.trg(model);
        let merged = &self.merged;

        env.add("t", time.add_const(), "t");
        env.add("dt", scalar.add_const(), write_numeric(model.dt(), &scalar));
        env.add("_batch_offset_pre", uint.add_const(), "(batch * group->numSrcNeurons)");
        env.add("_batch_offset_post", uint.add_const(), "(batch * group->numTrgNeurons)");

        // Source / target state lives on each member's own populations
        let src_ref = |id: SynapseGroupId| GroupRef::Neuron(model.synapse_group(id).src());
        let trg_ref = |id: SynapseGroupId| GroupRef::Neuron(model.synapse_group(id).trg());
        if src.is_true_spike_required() {
            add_array_field(env, merged, "_src_spk_cnt", "srcSpkCnt".into(), uint.clone(), "spkCnt", src_ref);
            add_array_field(env, merged, "_src_spk", "srcSpk".into(), uint.clone(), "spk", src_ref);
        }
        if src.is_spike_event_required() {
            add_array_field(env, merged, "_src_spk_evnt_cnt", "srcSpkEvntCnt".into(), uint.clone(), "spkEvntCnt", src_ref);
            add_array_field(env, merged, "_src_spk_evnt", "srcSpkEvnt".into(), uint.clone(), "spkEvnt", src_ref);
        }
        if trg.is_true_spike_required() {
            add_array_field(env, merged, "_trg_spk_cnt", "trgSpkCnt".into(), uint.clone(), "spkCnt", trg_ref);
            add_array_field(env, merged, "_trg_spk", "trgSpk".into(), uint.clone(), "spk", trg_ref);
        }
        if src.is_delay_required() {
            add_array_field(env, merged, "_src_spk_que_ptr", "srcSpkQuePtr".into(), uint.clone(), "spkQuePtr", src_ref);
        }
        if trg.is_delay_required() {
            add_array_field(env, merged, "_trg_spk_que_ptr", "trgSpkQuePtr".into(), uint.clone(), "spkQuePtr", trg_ref);
        }

        // Connectivity
        let matrix = sg.matrix_type();
        match matrix.connectivity {
            SynapseMatrixConnectivity::Sparse => {
                add_array_field(env, merged, "_row_length", "rowLength".into(), uint.clone(), "rowLength", GroupRef::Synapse);
                let ind_ty = ResolvedType::numeric(sg.sparse_ind_type(trg.num_neurons()));
                add_array_field(env, merged, "_ind", "ind".into(), ind_ty, "ind", GroupRef::Synapse);
            }
            SynapseMatrixConnectivity::Bitmask => {
                add_array_field(env, merged, "_gp", "gp".into(), uint.clone(), "gp", GroupRef::Synapse);
            }
            _ => {}
        }

        // Weight state
        let wum = sg.wu_model().clone();
        if matrix.has_individual_weights() || matrix.has_kernel_weights() {
            for var in &wum.vars {
                let var_ty = ctx.resolve(&var.ty).unwrap_or_else(|_| scalar.clone());
                add_array_field(
                    env,
                    merged,
                    &format!("_{}_array", var.name),
                    var.name.clone(),
                    var_ty.clone(),
                    &var.name,
                    GroupRef::Synapse,
                );
                let index = if matrix.has_kernel_weights() {
                    "$(id_kernel)"
                } else {
                    "$(id_syn)"
                };
                env.add(
                    var.name.clone(),
                    var_ty.add_const(),
                    format!("$(_{}_array)[{}]", var.name, index),
                );
            }
        } else if matrix.weight == neurogen_model::SynapseMatrixWeight::Global {
            // Global weights are compile-time constants from the
            // constant initialisers
            for var in &wum.vars {
                let var_ty = ctx.resolve(&var.ty).unwrap_or_else(|_| scalar.clone());
                let value = sg
                    .wu_var_initialisers()
                    .get(&var.name)
                    .and_then(|i| i.constant_value())
                    .unwrap_or(0.0);
                env.add(var.name.clone(), var_ty.add_const(), write_numeric(value, &var_ty));
            }
        }

        add_param_bindings(env, merged, wum.params.iter().cloned(), "", |g| g.wu_params());
        add_param_bindings(
            env,
            merged,
            wum.derived_params.iter().map(|d| d.name.clone()),
            "",
            |g| g.wu_derived_params(),
        );
        add_egp_bindings(env, merged, &wum.extra_global_params, "", GroupRef::Synapse);

        // Pre / post views of neuron state, delay-aware
        let src_delay = src.is_delay_required();
        let trg_delay = trg.is_delay_required();
        let pre_read = if src_delay {
            format!("({} * {})", self.src_spike_read_slot(model), src.num_neurons())
        } else {
            "0".to_string()
        };
        let post_read = if trg_delay {
            format!("({} * {})", self.trg_spike_read_slot(model), trg.num_neurons())
        } else {
            "0".to_string()
        };
        for var in &src.model().vars {
            let var_ty = ctx.resolve(&var.ty).unwrap_or_else(|_| scalar.clone());
            add_array_field(
                env,
                merged,
                &format!("_{}_pre_array", var.name),
                format!("{}Pre", var.name),
                var_ty.clone(),
                &var.name,
                src_ref,
            );
            let offset = if src.is_var_queue_required(&var.name) && src_delay {
                &pre_read
            } else {
                "0"
            };
            env.add(
                format!("{}_pre", var.name),
                var_ty.add_const(),
                format!("$(_{}_pre_array)[{} + $(id_pre)]", var.name, offset),
            );
        }
        for var in &trg.model().vars {
            let var_ty = ctx.resolve(&var.ty).unwrap_or_else(|_| scalar.clone());
            add_array_field(
                env,
                merged,
                &format!("_{}_post_array", var.name),
                format!("{}Post", var.name),
                var_ty.clone(),
                &var.name,
                trg_ref,
            );
            let offset = if trg.is_var_queue_required(&var.name) && trg_delay {
                &post_read
            } else {
                "0"
            };
            env.add(
                format!("{}_post", var.name),
                var_ty.add_const(),
                format!("$(_{}_post_array)[{} + $(id_post)]", var.name, offset),
            );
        }

        // Spike times
        if src.is_spike_time_required() {
            add_array_field(env, merged, "_st_pre_array", "sTPre".into(), time.clone(), "sT", src_ref);
            env.add(
                "st_pre",
                time.add_const(),
                format!("$(_st_pre_array)[{} + $(id_pre)]", pre_read),
            );
        }
        if src.is_prev_spike_time_required() {
            add_array_field(env, merged, "_prev_st_pre_array", "prevSTPre".into(), time.clone(), "prevST", src_ref);
            env.add(
                "prev_st_pre",
                time.add_const(),
                format!("$(_prev_st_pre_array)[{} + $(id_pre)]", pre_read),
            );
        }
        if trg.is_spike_time_required() {
            add_array_field(env, merged, "_st_post_array", "sTPost".into(), time.clone(), "sT", trg_ref);
            env.add(
                "st_post",
                time.add_const(),
                format!("$(_st_post_array)[{} + $(id_post)]", post_read),
            );
        }
        if trg.is_prev_spike_time_required() {
            add_array_field(env, merged, "_prev_st_post_array", "prevSTPost".into(), time.clone(), "prevST", trg_ref);
            env.add(
                "prev_st_post",
                time.add_const(),
                format!("$(_prev_st_post_array)[{} + $(id_post)]", post_read),
            );
        }
        if src.is_spike_event_time_required() {
            add_array_field(env, merged, "_set_pre_array", "seTPre".into(), time.clone(), "seT", src_ref);
            env.add(
                "set_pre",
                time.add_const(),
                format!("$(_set_pre_array)[{} + $(id_pre)]", pre_read),
            );
        }

        // Output targets: the fused archetype owns the arrays
        let ps_target = move |id: SynapseGroupId| {
            GroupRef::Synapse(model.synapse_group(id).fused_ps_target(id))
        };
        add_array_field(env, merged, "_out_post", "outPost".into(), scalar.clone(), "outPost", ps_target);
        if sg.is_dendritic_delay_required() {
            add_array_field(env, merged, "_den_delay", "denDelay".into(), scalar.clone(), "denDelay", ps_target);
            add_array_field(env, merged, "_den_delay_ptr", "denDelayPtr".into(), uint.clone(), "denDelayPtr", ps_target);
        }
        if sg.is_pre_output_required() {
            let pre_output_target = move |id: SynapseGroupId| {
                GroupRef::Synapse(model.synapse_group(id).fused_pre_output_target(id))
            };
            add_array_field(env, merged, "_out_pre", "outPre".into(), scalar.clone(), "outPre", pre_output_target);
        }

        Ok(())
    }

    /// addToPost / addToPostDelay / addToPre function substitutions for
    /// the chosen accumulation strategy
    fn bind_output_functions(
        &self,
        model: &Model,
        backend: &dyn Backend,
        env: &mut KernelEnvironment<'_>,
        accumulation: Accumulation,
    ) {
        let ctx = model.type_context();
        let scalar = ctx.scalar_type();
        let scalar_numeric = scalar.numeric_value().unwrap_or(NumericType::Float);
        let sg = self.merged.archetype();
        let void = ResolvedType::void();

        let add_to_post = match accumulation {
            Accumulation::Register => "linSyn += $(0)".to_string(),
            Accumulation::Shared => format!(
                "{}(&shLg[$(id_post)], $(0))",
                backend.atomic(scalar_numeric, AtomicOperation::Add, AtomicMemSpace::Shared)
            ),
            Accumulation::GlobalAtomic => format!(
                "{}(&$(_out_post)[$(_batch_offset_post) + $(id_post)], $(0))",
                backend.atomic(scalar_numeric, AtomicOperation::Add, AtomicMemSpace::Global)
            ),
        };
        env.add(
            "addToPost",
            ResolvedType::function(void.clone(), vec![scalar.clone()]),
            add_to_post,
        );

        // Dendritic delay always uses atomics: the slot depends on data
        if sg.is_dendritic_delay_required() {
            let max_delay = sg.max_dendritic_delay_timesteps();
            env.add(
                "addToPostDelay",
                ResolvedType::function(void.clone(), vec![scalar.clone(), scalar.clone()]),
                format!(
                    "{}(&$(_den_delay)[((((*$(_den_delay_ptr)) + (unsigned int)$(1)) % {}) * $(num_post)) + $(id_post)], $(0))",
                    backend.atomic(scalar_numeric, AtomicOperation::Add, AtomicMemSpace::Global),
                    max_delay
                ),
            );
        }
        if sg.is_pre_output_required() {
            env.add(
                "addToPre",
                ResolvedType::function(void, vec![scalar.clone()]),
                format!(
                    "{}(&$(_out_pre)[$(_batch_offset_pre) + $(id_pre)], $(0))",
                    backend.atomic(scalar_numeric, AtomicOperation::Add, AtomicMemSpace::Global)
                ),
            );
        }
    }

    /// Emit the kernel body for this merged group's pass
    pub fn generate(
        &mut self,
        model: &Model,
        backend: &dyn Backend,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<String> {
        let ctx = model.type_context();
        let mut stream = CodeStream::new();
        let mut env = KernelEnvironment::new(&ctx);
        env.push_scope();
        self.bind_common(model, backend, &mut env)?;

        match self.pass {
            SynapsePass::PresynapticUpdate => {
                let accumulation = self.accumulation(model, backend);
                self.bind_output_functions(model, backend, &mut env, accumulation);
                if self.merged.archetype().is_spike_event_required() {
                    self.generate_presynaptic_spike(
                        model, backend, &mut env, &mut stream, accumulation, false, diagnostics,
                    )?;
                }
                if self.merged.archetype().is_true_spike_required() {
                    self.generate_presynaptic_spike(
                        model, backend, &mut env, &mut stream, accumulation, true, diagnostics,
                    )?;
                }
            }
            SynapsePass::PostsynapticUpdate => {
                self.generate_postsynaptic_learning(model, backend, &mut env, &mut stream, diagnostics)?;
            }
            SynapsePass::SynapseDynamics => {
                self.bind_output_functions(model, backend, &mut env, Accumulation::GlobalAtomic);
                self.generate_synapse_dynamics(model, &mut env, &mut stream, diagnostics)?;
            }
        }

        env.pop_scope(&mut stream);
        env.flush(&mut stream);
        self.merged.add_fields(env.take_fields())?;
        Ok(resolve_residual(&stream.into_string()))
    }

    /// Spike (or spike-event) propagation under the configured span
    #[allow(clippy::too_many_arguments)]
    fn generate_presynaptic_spike(
        &mut self,
        model: &Model,
        backend: &dyn Backend,
        env: &mut KernelEnvironment<'_>,
        stream: &mut CodeStream,
        accumulation: Accumulation,
        true_spike: bool,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<()> {
        let sg = self.merged.archetype();
        let trg = self.trg(model);
        let matrix = sg.matrix_type();
        let scalar = model.type_context().scalar_type();
        let (cnt, buffer, label) = if true_spike {
            ("$(_src_spk_cnt)", "$(_src_spk)", "true spikes")
        } else {
            ("$(_src_spk_evnt_cnt)", "$(_src_spk_evnt)", "spike events")
        };
        let slot = self.src_spike_read_slot(model);
        let spike_offset = if self.src(model).is_delay_required() {
            format!("({} * $(num_pre))", slot)
        } else {
            "0".to_string()
        };

        stream.line(format!("// process incoming {}", label));
        if accumulation == Accumulation::Shared {
            stream.line(format!(
                "{}{} shLg[{}];",
                backend.shared_prefix(),
                scalar.name(),
                backend.preferences().block_sizes.get(Kernel::PresynapticUpdate)
            ));
            env.print_open(stream, format!("if ({} < $(num_post))", backend.thread_id(0)));
            stream.line(format!("shLg[{}] = 0;", backend.thread_id(0)));
            stream.close();
            backend.gen_shared_mem_barrier(stream);
        }
        if accumulation == Accumulation::Register {
            stream.line(format!("{} linSyn = 0;", scalar.name()));
        }

        match sg.span_type() {
            SpanType::Presynaptic => {
                // One thread per spike (times threadsPerSpike);
                // iterate the row of targets
                env.push_scope();
                env.add(
                    "id_pre",
                    ResolvedType::numeric(NumericType::Uint32).add_const(),
                    "preInd",
                );
                env.print_open(stream, format!(
                    "for (unsigned int i = 0; i < {}[{}]; i++)",
                    cnt, slot
                ));
                env.print_line(stream, format!(
                    "const unsigned int preInd = {}[{} + i];",
                    buffer, spike_offset
                ));
                self.generate_row_walk(model, env, stream, true_spike, diagnostics)?;
                stream.close();
                env.pop_scope(stream);
            }
            SpanType::Postsynaptic => {
                // One thread per target neuron; iterate the incoming
                // spike buffer
                env.push_scope();
                env.add(
                    "id_pre",
                    ResolvedType::numeric(NumericType::Uint32).add_const(),
                    "preInd",
                );
                env.print_open(stream, format!(
                    "for (unsigned int i = 0; i < {}[{}]; i++)",
                    cnt, slot
                ));
                env.print_line(stream, format!(
                    "const unsigned int preInd = {}[{} + i];",
                    buffer, spike_offset
                ));

                match matrix.connectivity {
                    SynapseMatrixConnectivity::Dense => {
                        env.add("id_post", ResolvedType::numeric(NumericType::Uint32).add_const(), "lid");
                        env.add(
                            "id_syn",
                            ResolvedType::numeric(NumericType::Uint32).add_const(),
                            "((preInd * $(row_stride)) + lid)",
                        );
                        self.emit_spike_code(env, stream, true_spike, diagnostics);
                    }
                    SynapseMatrixConnectivity::Sparse => {
                        env.print_open(stream, "if (lid < $(_row_length)[preInd])");
                        env.add(
                            "id_syn",
                            ResolvedType::numeric(NumericType::Uint32).add_const(),
                            "((preInd * $(row_stride)) + lid)",
                        );
                        env.add(
                            "id_post",
                            ResolvedType::numeric(NumericType::Uint32).add_const(),
                            "$(_ind)[$(id_syn)]",
                        );
                        self.emit_spike_code(env, stream, true_spike, diagnostics);
                        stream.close();
                    }
                    SynapseMatrixConnectivity::Bitmask => {
                        env.add(
                            "id_syn",
                            ResolvedType::numeric(NumericType::Uint32).add_const(),
                            "((preInd * $(row_stride)) + lid)",
                        );
                        env.add("id_post", ResolvedType::numeric(NumericType::Uint32).add_const(), "lid");
                        env.print_open(stream, "if ($(_gp)[$(id_syn) / 32] & (1 << ($(id_syn) % 32)))");
                        self.emit_spike_code(env, stream, true_spike, diagnostics);
                        stream.close();
                    }
                    SynapseMatrixConnectivity::Procedural => {
                        self.generate_procedural_row(model, backend, env, stream, true_spike, diagnostics)?;
                    }
                    SynapseMatrixConnectivity::Toeplitz => {
                        self.generate_toeplitz_diagonal(model, env, stream, true_spike, diagnostics)?;
                    }
                }
                stream.close();
                env.pop_scope(stream);
            }
        }

        // Publish accumulated input
        match accumulation {
            Accumulation::Register => {
                env.print_line(stream, "$(_out_post)[$(_batch_offset_post) + lid] += linSyn;");
            }
            Accumulation::Shared => {
                backend.gen_shared_mem_barrier(stream);
                env.print_open(stream, format!("if ({} < $(num_post))", backend.thread_id(0)));
                env.print_line(stream, format!(
                    "$(_out_post)[$(_batch_offset_post) + {}] += shLg[{}];",
                    backend.thread_id(0),
                    backend.thread_id(0)
                ));
                stream.close();
            }
            Accumulation::GlobalAtomic => {}
        }
        Ok(())
    }

    /// Iterate a row under a presynaptic span
    fn generate_row_walk(
        &mut self,
        model: &Model,
        env: &mut KernelEnvironment<'_>,
        stream: &mut CodeStream,
        true_spike: bool,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<()> {
        let sg = self.merged.archetype();
        let threads = sg.num_threads_per_spike();
        let uint = ResolvedType::numeric(NumericType::Uint32);
        match sg.matrix_type().connectivity {
            SynapseMatrixConnectivity::Sparse => {
                if threads > 1 {
                    env.print_line(stream, format!(
                        "const unsigned int numPerThread = ($(_row_length)[preInd] + {} - 1) / {};",
                        threads, threads
                    ));
                    env.print_open(
                        stream,
                        "for (unsigned int j = lid * numPerThread; j < min((lid + 1) * numPerThread, $(_row_length)[preInd]); j++)",
                    );
                } else {
                    env.print_open(stream, "for (unsigned int j = 0; j < $(_row_length)[preInd]; j++)");
                }
                env.add("id_syn", uint.add_const(), "((preInd * $(row_stride)) + j)");
                env.add("id_post", uint.add_const(), "$(_ind)[$(id_syn)]");
                self.emit_spike_code(env, stream, true_spike, diagnostics);
                stream.close();
            }
            _ => {
                env.print_open(stream, "for (unsigned int j = 0; j < $(num_post); j++)");
                env.add("id_syn", uint.add_const(), "((preInd * $(row_stride)) + j)");
                env.add("id_post", uint.add_const(), "j");
                if sg.matrix_type().is_bitmask() {
                    env.print_open(stream, "if ($(_gp)[$(id_syn) / 32] & (1 << ($(id_syn) % 32)))");
                    self.emit_spike_code(env, stream, true_spike, diagnostics);
                    stream.close();
                } else {
                    self.emit_spike_code(env, stream, true_spike, diagnostics);
                }
                stream.close();
            }
        }
        Ok(())
    }

    /// Procedural connectivity: regenerate the row inline from the
    /// build code, running the per-synapse code at each addSynapse
    fn generate_procedural_row(
        &mut self,
        model: &Model,
        backend: &dyn Backend,
        env: &mut KernelEnvironment<'_>,
        stream: &mut CodeStream,
        true_spike: bool,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<()> {
        let sg = self.merged.archetype();
        let connectivity = sg.connectivity_initialiser();
        let snippet = connectivity.snippet();
        let uint = ResolvedType::numeric(NumericType::Uint32);

        env.push_scope();
        if sg.is_procedural_connectivity_rng_required() {
            let rng = backend.gen_global_rng_skip_ahead(stream, "preInd");
            bind_rng_functions(env, model, &rng);
        }
        add_param_bindings(env, &self.merged, snippet.params.iter().cloned(), "Conn", |g| {
            g.connectivity_initialiser().params()
        });
        add_param_bindings(
            env,
            &self.merged,
            snippet.derived_params.iter().map(|d| d.name.clone()),
            "Conn",
            |g| g.connectivity_initialiser().derived_params(),
        );

        // addSynapse(j) runs the user's per-synapse code for target j.
        // The synapse body is emitted into a local lambda-like block so
        // the build code stays a straight translation.
        let mut body = CodeStream::new();
        env.push_scope();
        env.add("id_post", uint.add_const(), "procJ");
        env.add("id_syn", uint.add_const(), "((preInd * $(row_stride)) + procJ)");
        self.emit_spike_code(env, &mut body, true_spike, diagnostics);
        env.pop_scope(&mut body);
        // Inline the synapse body at every addSynapse site
        let body_text = body.into_string();
        env.add(
            "addSynapse",
            ResolvedType::function(ResolvedType::void(), vec![uint.remove_const()]),
            format!("{{ const unsigned int procJ = $(0); {} }}", body_text.replace('\n', " ")),
        );

        let mut handler = ErrorHandler::new(format!(
            "Synapse group '{}' procedural connectivity row build code",
            sg.name()
        ));
        if !emit_statements(env, connectivity.row_build(), &mut handler, stream) {
            diagnostics.extend(handler.into_diagnostics());
        }
        env.pop_scope(stream);
        Ok(())
    }

    /// Toeplitz connectivity: one thread per kernel diagonal,
    /// regenerating target indices from the diagonal build code
    fn generate_toeplitz_diagonal(
        &mut self,
        model: &Model,
        env: &mut KernelEnvironment<'_>,
        stream: &mut CodeStream,
        true_spike: bool,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<()> {
        let sg = self.merged.archetype();
        let toeplitz = sg
            .toeplitz_initialiser()
            .expect("toeplitz matrix type always carries an initialiser");
        let snippet = toeplitz.snippet();
        let uint = ResolvedType::numeric(NumericType::Uint32);

        env.push_scope();
        env.add("id_diag", uint.add_const(), "lid");
        add_param_bindings(env, &self.merged, snippet.params.iter().cloned(), "Toeplitz", |g| {
            g.toeplitz_initialiser()
                .expect("members share the archetype's matrix type")
                .params()
        });
        add_param_bindings(
            env,
            &self.merged,
            snippet.derived_params.iter().map(|d| d.name.clone()),
            "Toeplitz",
            |g| {
                g.toeplitz_initialiser()
                    .expect("members share the archetype's matrix type")
                    .derived_params()
            },
        );

        let mut body = CodeStream::new();
        env.push_scope();
        env.add("id_post", uint.add_const(), "toeplitzJ");
        env.add("id_kernel", uint.add_const(), "((kernRowArg * $(_kernel_dim_1)) + kernColArg)");
        let kernel_size = sg.kernel_size();
        if kernel_size.len() > 1 {
            env.add("_kernel_dim_1", uint.add_const(), kernel_size[1].to_string());
        } else {
            env.add("_kernel_dim_1", uint.add_const(), "1");
        }
        self.emit_spike_code(env, &mut body, true_spike, diagnostics);
        env.pop_scope(&mut body);
        let body_text = body.into_string();
        env.add(
            "addSynapse",
            ResolvedType::function(
                ResolvedType::void(),
                vec![uint.remove_const(), uint.remove_const(), uint.remove_const()],
            ),
            format!(
                "{{ const unsigned int toeplitzJ = $(0); const unsigned int kernRowArg = $(1); const unsigned int kernColArg = $(2); {} }}",
                body_text.replace('\n', " ")
            ),
        );

        let mut handler = ErrorHandler::new(format!(
            "Synapse group '{}' Toeplitz diagonal build code",
            sg.name()
        ));
        if !emit_statements(env, toeplitz.diagonal_build(), &mut handler, stream) {
            diagnostics.extend(handler.into_diagnostics());
        }
        env.pop_scope(stream);
        Ok(())
    }

    fn emit_spike_code(
        &self,
        env: &mut KernelEnvironment<'_>,
        stream: &mut CodeStream,
        true_spike: bool,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        let sg = self.merged.archetype();
        let (fragment, context) = if true_spike {
            (
                sg.wu_sim_code(),
                format!("Synapse group '{}' weight update model sim code", sg.name()),
            )
        } else {
            (
                sg.wu_event_code(),
                format!("Synapse group '{}' weight update model event code", sg.name()),
            )
        };

        // Spike events re-test the threshold per synapse when the
        // group demands it
        if !true_spike && sg.is_event_threshold_retest_required() {
            let mut handler = ErrorHandler::new(format!(
                "Synapse group '{}' event threshold condition",
                sg.name()
            ));
            match emit_expression(env, sg.wu_event_threshold_code(), &mut handler, stream) {
                Some(condition) => {
                    stream.open(&format!("if ({})", condition));
                    let mut handler = ErrorHandler::new(context);
                    if !emit_statements(env, fragment, &mut handler, stream) {
                        diagnostics.extend(handler.into_diagnostics());
                    }
                    stream.close();
                    return;
                }
                None => {
                    diagnostics.extend(handler.into_diagnostics());
                    return;
                }
            }
        }

        let mut handler = ErrorHandler::new(context);
        if !emit_statements(env, fragment, &mut handler, stream) {
            diagnostics.extend(handler.into_diagnostics());
        }
    }

    /// Postsynaptic learning: one thread per incoming spike on the
    /// target side, walking the column through the remap when the
    /// backend requires it and a dense column otherwise
    fn generate_postsynaptic_learning(
        &mut self,
        model: &Model,
        backend: &dyn Backend,
        env: &mut KernelEnvironment<'_>,
        stream: &mut CodeStream,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<()> {
        let sg = self.merged.archetype();
        let uint = ResolvedType::numeric(NumericType::Uint32);
        let slot = self.trg_spike_read_slot(model);
        let spike_offset = if self.trg(model).is_delay_required() {
            format!("({} * $(num_post))", slot)
        } else {
            "0".to_string()
        };

        stream.line("// postsynaptic learning from target spikes");
        env.push_scope();
        env.add("id_post", uint.add_const(), "postInd");
        env.print_open(stream, format!(
            "for (unsigned int i = 0; i < $(_trg_spk_cnt)[{}]; i++)",
            slot
        ));
        env.print_line(stream, format!(
            "const unsigned int postInd = $(_trg_spk)[{} + i];",
            spike_offset
        ));

        if sg.matrix_type().is_sparse() && backend.is_postsynaptic_remap_required() {
            add_array_field(env, &self.merged, "_col_length", "colLength".into(), uint.clone(), "colLength", GroupRef::Synapse);
            add_array_field(env, &self.merged, "_remap", "remap".into(), uint.clone(), "remap", GroupRef::Synapse);
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
            env.print_open(stream, "for (unsigned int j = 0; j < $(_col_length)[postInd]; j++)");
            env.print_line(stream, "const unsigned int synAddress = $(_remap)[(postInd * group->colStride) + j];");
            env.add("id_syn", uint.add_const(), "synAddress");
            env.add("id_pre", uint.add_const(), "(synAddress / $(row_stride))");
        } else if sg.matrix_type().is_sparse() {
            // Without a remap, walk every row looking for this column
            env.print_open(stream, "for (unsigned int preInd = 0; preInd < $(num_pre); preInd++)");
            env.print_open(stream, "for (unsigned int j = 0; j < $(_row_length)[preInd]; j++)");
            env.print_line(stream, "const unsigned int synAddress = (preInd * $(row_stride)) + j;");
            env.print_open(stream, "if ($(_ind)[synAddress] == postInd)");
            env.add("id_syn", uint.add_const(), "synAddress");
            env.add("id_pre", uint.add_const(), "preInd");
        } else {
            env.print_open(stream, "for (unsigned int preInd = 0; preInd < $(num_pre); preInd++)");
            env.add("id_pre", uint.add_const(), "preInd");
            env.add("id_syn", uint.add_const(), "((preInd * $(row_stride)) + postInd)");
        }

        let mut handler = ErrorHandler::new(format!(
            "Synapse group '{}' weight update model learn post code",
            sg.name()
        ));
        if !emit_statements(env, sg.wu_learn_post_code(), &mut handler, stream) {
            diagnostics.extend(handler.into_diagnostics());
        }

        if sg.matrix_type().is_sparse() && backend.is_postsynaptic_remap_required() {
            stream.close();
        } else if sg.matrix_type().is_sparse() {
            stream.close();
            stream.close();
            stream.close();
        } else {
            stream.close();
        }
        stream.close();
        env.pop_scope(stream);
        Ok(())
    }

    /// Per-timestep synapse dynamics: one thread per synapse
    fn generate_synapse_dynamics(
        &mut self,
        model: &Model,
        env: &mut KernelEnvironment<'_>,
        stream: &mut CodeStream,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<()> {
        let sg = self.merged.archetype();
        let uint = ResolvedType::numeric(NumericType::Uint32);

        stream.line("// synapse dynamics");
        env.push_scope();
        env.add("id_pre", uint.add_const(), "(lid / $(row_stride))");
        if sg.matrix_type().is_sparse() {
            env.print_open(stream, "if ((lid % $(row_stride)) < $(_row_length)[lid / $(row_stride)])");
            env.add("id_syn", uint.add_const(), "lid");
            env.add("id_post", uint.add_const(), "$(_ind)[lid]");
        } else {
            env.add("id_syn", uint.add_const(), "lid");
            env.add("id_post", uint.add_const(), "(lid % $(row_stride))");
        }

        let mut handler = ErrorHandler::new(format!(
            "Synapse group '{}' synapse dynamics code",
            sg.name()
        ));
        if !emit_statements(env, sg.wu_synapse_dynamics_code(), &mut handler, stream) {
            diagnostics.extend(handler.into_diagnostics());
        }

        if sg.matrix_type().is_sparse() {
            stream.close();
        }
        env.pop_scope(stream);
        Ok(())
    }
}

/// Bind the rand* function family over a backend RNG expression
pub(crate) fn bind_rng_functions(
    env: &mut KernelEnvironment<'_>,
    model: &Model,
    rng: &str,
) {
    let scalar = model.type_context().scalar_type();
    for (name, callee, arity) in [
        ("randUniform", "rngUniform", 0usize),
        ("randNormal", "rngNormal", 0),
        ("randExponential", "rngExponential", 0),
        ("randLogNormal", "rngLogNormal", 2),
        ("randGamma", "rngGamma", 1),
        ("randBinomial", "rngBinomial", 2),
    ] {
        let args = vec![scalar.clone(); arity];
        let mut call_args = vec![rng.to_string()];
        for i in 0..arity {
            call_args.push(format!("$({})", i));
        }
        env.add(
            name,
            ResolvedType::function(scalar.clone(), args),
            format!("{}({})", callee, call_args.join(", ")),
        );
    }
}
