// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Neuron-update merged groups.
//!
//! For each merged neuron-update group the emitter produces one kernel
//! body that, per neuron: applies incoming fused postsynaptic input,
//! accumulates fused presynaptic output, injects current sources,
//! runs the membrane update, the pre/post weight-update dynamics and
//! spike-event conditions, then tests the threshold on a rising edge,
//! emits the spike and runs the reset code.

use crate::backend::{AtomicMemSpace, AtomicOperation, Backend};
use crate::code_stream::CodeStream;
use crate::environment::{emit_expression, emit_statements, CachedVar, KernelEnvironment};
use crate::merged::{
    is_param_heterogeneous, Field, FieldInit, GroupRef, MergedGroup, partition_by_digest,
};
use crate::Result;
use neurogen_model::{
    CurrentSource, CurrentSourceId, HashBuilder, HashDigest, Model, NeuronGroup, NeuronGroupId,
    ParamValues, SynapseGroup, SynapseGroupId, VarAccessDim, VarAccessMode,
};
use neurogen_transpiler::{Diagnostic, ErrorHandler};
use neurogen_types::{write_numeric, NumericType, ResolvedType};

/// Bind parameters as compile-time constants where homogeneous across
/// the merged group, or as per-member scalar fields where not
pub(crate) fn add_param_bindings<I: Copy, G>(
    env: &mut KernelEnvironment<'_>,
    merged: &MergedGroup<'_, I, G>,
    names: impl Iterator<Item = String>,
    suffix: &str,
    access: impl Fn(&G) -> &ParamValues,
) {
    let scalar = env.type_context().scalar_type();
    for name in names {
        if is_param_heterogeneous(merged.groups(), &name, &access) {
            let field_name = format!("{}{}", name, suffix);
            let values = merged
                .groups()
                .iter()
                .map(|g| FieldInit::F64(access(g).get(&name).copied().unwrap_or(0.0)))
                .collect();
            env.add_field(
                name,
                scalar.add_const(),
                format!("group->{}", field_name),
                Field {
                    name: field_name,
                    ty: scalar.clone(),
                    values,
                },
            );
        } else {
            let value = access(merged.archetype()).get(&name).copied().unwrap_or(0.0);
            env.add(name, scalar.add_const(), write_numeric(value, &scalar));
        }
    }
}

/// Bind extra global parameters as per-member pointer fields
pub(crate) fn add_egp_bindings<I: Copy, G>(
    env: &mut KernelEnvironment<'_>,
    merged: &MergedGroup<'_, I, G>,
    egps: &[neurogen_model::ExtraGlobalParam],
    suffix: &str,
    group_ref: impl Fn(I) -> GroupRef,
) {
    for egp in egps {
        let element = env
            .type_context()
            .resolve(&egp.ty)
            .unwrap_or_else(|_| env.type_context().scalar_type());
        let ty = element.create_pointer();
        let field_name = format!("{}{}", egp.name, suffix);
        let values = merged
            .ids()
            .iter()
            .map(|&id| FieldInit::Array {
                group: group_ref(id),
                var: egp.name.clone(),
            })
            .collect();
        env.add_field(
            egp.name.clone(),
            ty.clone(),
            format!("group->{}", field_name),
            Field {
                name: field_name,
                ty,
                values,
            },
        );
    }
}

/// Bind a per-member array field under a hidden name
pub(crate) fn add_array_field<I: Copy, G>(
    env: &mut KernelEnvironment<'_>,
    merged: &MergedGroup<'_, I, G>,
    env_name: &str,
    field_name: String,
    element: ResolvedType,
    var: &str,
    group_ref: impl Fn(I) -> GroupRef,
) {
    let ty = element.create_pointer();
    let values = merged
        .ids()
        .iter()
        .map(|&id| FieldInit::Array {
            group: group_ref(id),
            var: var.to_string(),
        })
        .collect();
    env.add_field(
        env_name,
        ty.clone(),
        format!("group->{}", field_name),
        Field {
            name: field_name,
            ty,
            values,
        },
    );
}

/// One merged neuron-update group with its child aggregates, each
/// ordered to match the archetype member
pub struct NeuronUpdateGroupMerged<'m> {
    pub merged: MergedGroup<'m, NeuronGroupId, NeuronGroup>,
    in_syn_psm: Vec<MergedGroup<'m, SynapseGroupId, SynapseGroup>>,
    out_syn_pre_output: Vec<MergedGroup<'m, SynapseGroupId, SynapseGroup>>,
    current_sources: Vec<MergedGroup<'m, CurrentSourceId, CurrentSource>>,
    out_syn_wu_pre: Vec<MergedGroup<'m, SynapseGroupId, SynapseGroup>>,
    in_syn_wu_post: Vec<MergedGroup<'m, SynapseGroupId, SynapseGroup>>,
    out_syn_spike_event: Vec<MergedGroup<'m, SynapseGroupId, SynapseGroup>>,
}

impl<'m> NeuronUpdateGroupMerged<'m> {
    /// Merge key: the archetype's own digest plus the per-pass digests
    /// of every child, so merged members always have matching children
    pub fn merge_digest(model: &Model, id: NeuronGroupId) -> HashDigest {
        let ng = model.neuron_group(id);
        let mut hash = HashBuilder::new("neuron-update-merge");
        hash.update_digest(&ng.hash_digest());
        for &sg in ng.fused_psm_in_syn() {
            hash.update_digest(&model.synapse_group(sg).ps_hash_digest());
        }
        for &sg in ng.fused_pre_output_out_syn() {
            hash.update_digest(&model.synapse_group(sg).pre_output_hash_digest());
        }
        for &cs in ng.current_sources() {
            hash.update_digest(&model.current_source(cs).hash_digest());
        }
        for &sg in ng.fused_wu_pre_out_syn() {
            hash.update_digest(&model.synapse_group(sg).wu_pre_hash_digest());
        }
        for &sg in ng.fused_wu_post_in_syn() {
            hash.update_digest(&model.synapse_group(sg).wu_post_hash_digest());
        }
        for (_, sg) in model.synapse_groups() {
            if sg.src() == id && sg.is_spike_event_required() {
                hash.update_digest(&sg.wu_hash_digest(
                    ng.num_delay_slots(),
                    model.neuron_group(sg.trg()).num_delay_slots(),
                    model.neuron_group(sg.trg()).num_neurons(),
                    false,
                ));
            }
        }
        hash.finalise()
    }

    pub fn build(model: &'m Model) -> Vec<NeuronUpdateGroupMerged<'m>> {
        let merged = partition_by_digest(model.neuron_groups(), |id, _| {
            Self::merge_digest(model, id)
        });
        merged
            .into_iter()
            .map(|merged| {
                let child =
                    |select: &dyn Fn(&NeuronGroup) -> Vec<SynapseGroupId>| -> Vec<MergedGroup<'m, SynapseGroupId, SynapseGroup>> {
                        let lists: Vec<Vec<SynapseGroupId>> =
                            merged.groups().iter().map(|g| select(g)).collect();
                        let n_children = lists[0].len();
                        (0..n_children)
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
                    };

                let in_syn_psm = child(&|g| g.fused_psm_in_syn().to_vec());
                let out_syn_pre_output = child(&|g| g.fused_pre_output_out_syn().to_vec());
                let out_syn_wu_pre = child(&|g| g.fused_wu_pre_out_syn().to_vec());
                let in_syn_wu_post = child(&|g| g.fused_wu_post_in_syn().to_vec());
                let out_syn_spike_event = child(&|g| {
                    g.out_syn()
                        .iter()
                        .copied()
                        .filter(|&sg| model.synapse_group(sg).is_spike_event_required())
                        .collect()
                });

                let cs_lists: Vec<Vec<CurrentSourceId>> = merged
                    .groups()
                    .iter()
                    .map(|g| g.current_sources().to_vec())
                    .collect();
                let current_sources = (0..cs_lists[0].len())
                    .map(|k| {
                        MergedGroup::new(
                            k,
                            cs_lists
                                .iter()
                                .map(|l| (l[k], model.current_source(l[k])))
                                .collect(),
                        )
                    })
                    .collect();

                NeuronUpdateGroupMerged {
                    merged,
                    in_syn_psm,
                    out_syn_pre_output,
                    current_sources,
                    out_syn_wu_pre,
                    in_syn_wu_post,
                    out_syn_spike_event,
                }
            })
            .collect()
    }

    pub fn is_param_heterogeneous(&self, name: &str) -> bool {
        is_param_heterogeneous(self.merged.groups(), name, |g| g.params())
    }

    pub fn is_derived_param_heterogeneous(&self, name: &str) -> bool {
        is_param_heterogeneous(self.merged.groups(), name, |g| g.derived_params())
    }

    // ---- index helpers -----------------------------------------------

    fn var_index(&self, batch_size: u32, dims: VarAccessDim, index: &str) -> String {
        let batched = dims.batch && batch_size > 1;
        if !dims.element {
            if batched {
                "batch".to_string()
            } else {
                "0".to_string()
            }
        } else if batched {
            format!("$(_batch_offset) + {}", index)
        } else {
            index.to_string()
        }
    }

    fn read_var_index(
        &self,
        delay: bool,
        batch_size: u32,
        dims: VarAccessDim,
        index: &str,
    ) -> String {
        if !delay {
            return self.var_index(batch_size, dims, index);
        }
        let batched = dims.batch && batch_size > 1;
        if !dims.element {
            if batched {
                "$(_read_batch_delay_slot)".to_string()
            } else {
                "$(_read_delay_slot)".to_string()
            }
        } else if batched {
            format!("$(_read_batch_delay_offset) + {}", index)
        } else {
            format!("$(_read_delay_offset) + {}", index)
        }
    }

    fn write_var_index(
        &self,
        delay: bool,
        batch_size: u32,
        dims: VarAccessDim,
        index: &str,
    ) -> String {
        if !delay {
            return self.var_index(batch_size, dims, index);
        }
        let batched = dims.batch && batch_size > 1;
        if !dims.element {
            if batched {
                "$(_write_batch_delay_slot)".to_string()
            } else {
                "$(_write_delay_slot)".to_string()
            }
        } else if batched {
            format!("$(_write_batch_delay_offset) + {}", index)
        } else {
            format!("$(_write_delay_offset) + {}", index)
        }
    }

    // ---- generation ---------------------------------------------------

    /// Emit the per-neuron update body. Fields register on the merged
    /// group as the environment hands them out; diagnostics accumulate
    /// into `diagnostics` and fail the pass at the end.
    pub fn generate(
        &mut self,
        model: &Model,
        backend: &dyn Backend,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<String> {
        let ctx = model.type_context();
        let batch_size = model.batch_size();
        let archetype = self.merged.archetype();
        let nm = archetype.model().clone();
        let delay_required = archetype.is_delay_required();
        let num_delay_slots = archetype.num_delay_slots();
        let scalar = ctx.scalar_type();
        let time = ctx.time_type();
        let uint = ResolvedType::numeric(NumericType::Uint32);

        let mut stream = CodeStream::new();
        let mut env = KernelEnvironment::new(&ctx);
        env.push_scope();

        // Kernel-shell bindings
        env.add("id", uint.add_const(), "lid");
        env.add("batch", uint.add_const(), "batch");
        env.add("t", time.add_const(), "t");
        env.add("dt", scalar.add_const(), write_numeric(model.dt(), &scalar));
        // numNeurons is a scalar member of the merged struct
        env.add("num_neurons", uint.add_const(), "group->numNeurons");
        let num_neurons_field = Field {
            name: "numNeurons".to_string(),
            ty: uint.clone(),
            values: self
                .merged
                .groups()
                .iter()
                .map(|g| FieldInit::U32(g.num_neurons()))
                .collect(),
        };
        self.merged.add_field(num_neurons_field)?;

        env.add("_batch_offset", uint.add_const(), "(batch * group->numNeurons)");
        if archetype.is_spike_recording_enabled() {
            // Word-granular bitfield, row-major by (timestep, batch, word)
            env.add(
                "_record_offset",
                uint.add_const(),
                format!(
                    "(((recordingTimestep * {}) + batch) * ((group->numNeurons + 31) / 32))",
                    batch_size
                ),
            );
        }

        if delay_required {
            add_array_field(
                &mut env,
                &self.merged,
                "_spk_que_ptr",
                "spkQuePtr".to_string(),
                uint.clone(),
                "spkQuePtr",
                GroupRef::Neuron,
            );
            env.add(
                "_read_delay_slot",
                uint.add_const(),
                format!(
                    "(((*$(_spk_que_ptr)) + {}) % {})",
                    num_delay_slots - 1,
                    num_delay_slots
                ),
            );
            env.add("_write_delay_slot", uint.add_const(), "(*$(_spk_que_ptr))");
            env.add(
                "_read_delay_offset",
                uint.add_const(),
                "($(_read_delay_slot) * group->numNeurons)",
            );
            env.add(
                "_write_delay_offset",
                uint.add_const(),
                "($(_write_delay_slot) * group->numNeurons)",
            );
            env.add(
                "_read_batch_delay_slot",
                uint.add_const(),
                format!("((batch * {}) + $(_read_delay_slot))", num_delay_slots),
            );
            env.add(
                "_write_batch_delay_slot",
                uint.add_const(),
                format!("((batch * {}) + $(_write_delay_slot))", num_delay_slots),
            );
            env.add(
                "_read_batch_delay_offset",
                uint.add_const(),
                "($(_read_batch_delay_slot) * group->numNeurons)",
            );
            env.add(
                "_write_batch_delay_offset",
                uint.add_const(),
                "($(_write_batch_delay_slot) * group->numNeurons)",
            );
        }

        // Spike state arrays
        if archetype.is_true_spike_required() {
            add_array_field(&mut env, &self.merged, "_spk_cnt", "spkCnt".into(), uint.clone(), "spkCnt", GroupRef::Neuron);
            add_array_field(&mut env, &self.merged, "_spk", "spk".into(), uint.clone(), "spk", GroupRef::Neuron);
        }
        if archetype.is_spike_event_required() {
            add_array_field(&mut env, &self.merged, "_spk_evnt_cnt", "spkEvntCnt".into(), uint.clone(), "spkEvntCnt", GroupRef::Neuron);
            add_array_field(&mut env, &self.merged, "_spk_evnt", "spkEvnt".into(), uint.clone(), "spkEvnt", GroupRef::Neuron);
        }
        if archetype.is_spike_time_required() {
            add_array_field(&mut env, &self.merged, "_st", "sT".into(), time.clone(), "sT", GroupRef::Neuron);
        }
        if archetype.is_prev_spike_time_required() {
            add_array_field(&mut env, &self.merged, "_prev_st", "prevST".into(), time.clone(), "prevST", GroupRef::Neuron);
        }
        if archetype.is_spike_event_time_required() {
            add_array_field(&mut env, &self.merged, "_set", "seT".into(), time.clone(), "seT", GroupRef::Neuron);
        }
        if archetype.is_prev_spike_event_time_required() {
            add_array_field(&mut env, &self.merged, "_prev_set", "prevSET".into(), time.clone(), "prevSET", GroupRef::Neuron);
        }
        if archetype.is_spike_recording_enabled() {
            add_array_field(&mut env, &self.merged, "_record_spk", "recordSpk".into(), uint.clone(), "recordSpk", GroupRef::Neuron);
        }

        // 1. Local aliases for neuron variables with delay-aware
        //    indexing; cached right at the top so child groups can use
        //    the same registers
        env.push_scope();
        for var in &nm.vars {
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
            let delayed = archetype.is_var_queue_required(&var.name) && delay_required;
            let dims = var.access.dims();
            env.add_cached(CachedVar {
                name: var.name.clone(),
                local_name: format!("l{}", var.name),
                ty: if var.access.mode() == VarAccessMode::ReadOnly {
                    var_ty.add_const()
                } else {
                    var_ty
                },
                array: format!("$(_{}_array)", var.name),
                read_index: self.read_var_index(delayed, batch_size, dims, "lid"),
                write_index: self.write_var_index(delayed, batch_size, dims, "lid"),
                write_back: var.access.mode() == VarAccessMode::ReadWrite,
            });
        }

        // Default input accumulator, hidden behind the target-var
        // selection; additional input accumulators beside it
        stream.line(format!("{} Isyn = 0;", scalar.name()));
        env.add("_Isyn", scalar.clone(), "Isyn");
        for v in &nm.additional_input_vars {
            let ty = ctx.resolve(&v.ty).unwrap_or_else(|_| scalar.clone());
            stream.line(format!(
                "{} _{} = {};",
                ty.name(),
                v.name,
                write_numeric(v.init_value, &ty)
            ));
            env.add(format!("_{}", v.name), ty, format!("_{}", v.name));
        }

        // 2. Incoming fused postsynaptic models
        let in_syn_count = self.in_syn_psm.len();
        for k in 0..in_syn_count {
            self.generate_in_syn_psm(k, model, backend, &mut env, &mut stream, batch_size, diagnostics)?;
        }

        // 3. Outgoing fused pre-output accumulation
        for k in 0..self.out_syn_pre_output.len() {
            self.generate_pre_output(k, &mut env, &mut stream, batch_size)?;
        }

        // 4. Current sources
        for k in 0..self.current_sources.len() {
            self.generate_current_source(k, model, &mut env, &mut stream, batch_size, diagnostics)?;
        }

        // 5. Read-only Isyn alias over the hidden accumulator, plus
        //    parameters and state for the sim code
        env.push_scope();
        env.add("Isyn", scalar.add_const(), "$(_Isyn)");
        for v in &nm.additional_input_vars {
            let ty = ctx
                .resolve(&v.ty)
                .unwrap_or_else(|_| scalar.clone())
                .add_const();
            env.add(v.name.clone(), ty, format!("$(_{})", v.name));
        }
        add_param_bindings(&mut env, &self.merged, nm.params.iter().cloned(), "Neuron", |g| {
            g.params()
        });
        add_param_bindings(
            &mut env,
            &self.merged,
            nm.derived_params.iter().map(|d| d.name.clone()),
            "Neuron",
            |g| g.derived_params(),
        );
        add_egp_bindings(
            &mut env,
            &self.merged,
            &nm.extra_global_params,
            "Neuron",
            GroupRef::Neuron,
        );
        if archetype.is_spike_time_required() {
            env.add(
                "st",
                time.add_const(),
                format!(
                    "$(_st)[{}]",
                    self.read_var_index(
                        delay_required,
                        batch_size,
                        VarAccessDim { element: true, batch: true },
                        "lid"
                    )
                ),
            );
        }
        if archetype.is_prev_spike_time_required() {
            env.add(
                "prev_st",
                time.add_const(),
                format!(
                    "$(_prev_st)[{}]",
                    self.read_var_index(
                        delay_required,
                        batch_size,
                        VarAccessDim { element: true, batch: true },
                        "lid"
                    )
                ),
            );
        }

        // Snapshot the threshold condition before the sim code runs so
        // only a rising edge emits a spike
        let has_threshold = !archetype.threshold_condition_code().is_empty();
        if has_threshold && nm.auto_refractory_required {
            let mut handler =
                ErrorHandler::new(format!("Neuron group '{}' threshold condition code", archetype.name()));
            match emit_expression(&mut env, archetype.threshold_condition_code(), &mut handler, &mut stream) {
                Some(condition) => {
                    stream.line("// test whether spike condition was fulfilled previously");
                    stream.line(format!("const bool oldSpike = ({});", condition));
                }
                None => diagnostics.extend(handler.into_diagnostics()),
            }
        }

        // 6. Membrane update
        stream.line("// calculate membrane potential");
        let mut handler = ErrorHandler::new(format!("Neuron group '{}' sim code", archetype.name()));
        if !emit_statements(&mut env, archetype.sim_code(), &mut handler, &mut stream) {
            diagnostics.extend(handler.into_diagnostics());
        }

        // 7. Outgoing presynaptic dynamics, incoming postsynaptic
        //    dynamics, spike-event conditions
        for k in 0..self.out_syn_wu_pre.len() {
            self.generate_wu_pre_post(k, true, true, model, &mut env, &mut stream, batch_size, diagnostics)?;
        }
        for k in 0..self.in_syn_wu_post.len() {
            self.generate_wu_pre_post(k, false, true, model, &mut env, &mut stream, batch_size, diagnostics)?;
        }
        for k in 0..self.out_syn_spike_event.len() {
            self.generate_spike_event_condition(k, model, backend, &mut env, &mut stream, batch_size, diagnostics)?;
        }

        // 8. Threshold test on rising edge, spike emission, reset
        if has_threshold {
            let mut handler =
                ErrorHandler::new(format!("Neuron group '{}' threshold condition code", archetype.name()));
            let condition =
                emit_expression(&mut env, archetype.threshold_condition_code(), &mut handler, &mut stream);
            match condition {
                Some(condition) => {
                    stream.line("// test for and register a true spike");
                    if nm.auto_refractory_required {
                        stream.open(&format!("if (({}) && !oldSpike)", condition));
                    } else {
                        stream.open(&format!("if ({})", condition));
                    }
                    self.generate_emit_true_spike(backend, archetype, &mut env, &mut stream, batch_size);

                    if !archetype.reset_code().is_empty() {
                        stream.line("// spike reset code");
                        let mut handler =
                            ErrorHandler::new(format!("Neuron group '{}' reset code", archetype.name()));
                        if !emit_statements(&mut env, archetype.reset_code(), &mut handler, &mut stream) {
                            diagnostics.extend(handler.into_diagnostics());
                        }
                    }

                    // Spike-triggered weight-update state
                    for k in 0..self.out_syn_wu_pre.len() {
                        self.generate_wu_pre_post(k, true, false, model, &mut env, &mut stream, batch_size, diagnostics)?;
                    }
                    for k in 0..self.in_syn_wu_post.len() {
                        self.generate_wu_pre_post(k, false, false, model, &mut env, &mut stream, batch_size, diagnostics)?;
                    }
                    stream.close();

                    // Non-spiking neurons in delayed groups copy
                    // delayed state between slots
                    if delay_required
                        && (archetype.is_spike_time_required()
                            || archetype.is_prev_spike_time_required())
                    {
                        stream.open("else");
                        let dims = VarAccessDim { element: true, batch: true };
                        if archetype.is_spike_time_required() {
                            env.mark_used("_st");
                            env.flush(&mut stream);
                            env.print_line(&mut stream, format!(
                                "$(_st)[{}] = $(_st)[{}];",
                                self.write_var_index(true, batch_size, dims, "lid"),
                                self.read_var_index(true, batch_size, dims, "lid")
                            ));
                        }
                        if archetype.is_prev_spike_time_required() {
                            env.mark_used("_prev_st");
                            env.flush(&mut stream);
                            env.print_line(&mut stream, format!(
                                "$(_prev_st)[{}] = $(_prev_st)[{}];",
                                self.write_var_index(true, batch_size, dims, "lid"),
                                self.read_var_index(true, batch_size, dims, "lid")
                            ));
                        }
                        stream.close();
                    }
                }
                None => diagnostics.extend(handler.into_diagnostics()),
            }
        }

        env.pop_scope(&mut stream); // sim scope
        env.pop_scope(&mut stream); // cached-variable scope: flush locals
        env.flush(&mut stream);
        self.merged.add_fields(env.take_fields())?;

        // Resolve any remaining references left by flush-time writes
        let body = stream.into_string();
        Ok(resolve_residual(&body))
    }

    #[allow(clippy::too_many_arguments)]
    fn generate_in_syn_psm(
        &mut self,
        k: usize,
        model: &Model,
        backend: &dyn Backend,
        env: &mut KernelEnvironment<'_>,
        stream: &mut CodeStream,
        batch_size: u32,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<()> {
        let ctx = model.type_context();
        let scalar = ctx.scalar_type();
        let suffix = format!("InSyn{}", k);
        let child = &self.in_syn_psm[k];
        let sg = child.archetype();
        let psm = sg.ps_model().clone();
        let dims = VarAccessDim { element: true, batch: true };
        let idx = self.var_index(batch_size, dims, "lid");

        stream.line(format!("// postsynaptic model {}", k));
        stream.open("");
        env.push_scope();

        add_array_field(env, child, "_out_post", format!("outPost{}", suffix), scalar.clone(), "outPost", GroupRef::Synapse);
        env.mark_used("_out_post");
        env.flush(stream);
        env.print_line(stream, format!(
            "{} linSyn = $(_out_post)[{}];",
            scalar.name(),
            idx
        ));

        // Dendritic delay: add the current slot's input and zero it
        if sg.is_dendritic_delay_required() {
            add_array_field(env, child, "_den_delay", format!("denDelay{}", suffix), scalar.clone(), "denDelay", GroupRef::Synapse);
            add_array_field(
                env,
                child,
                "_den_delay_ptr",
                format!("denDelayPtr{}", suffix),
                ResolvedType::numeric(NumericType::Uint32),
                "denDelayPtr",
                GroupRef::Synapse,
            );
            env.mark_used("_den_delay");
            env.mark_used("_den_delay_ptr");
            env.flush(stream);
            env.print_line(stream, format!(
                "{}{}* denDelayFront = &$(_den_delay)[((*$(_den_delay_ptr)) * $(num_neurons)) + {}];",
                backend.pointer_prefix(),
                scalar.name(),
                idx
            ));
            stream.line("linSyn += *denDelayFront;");
            stream.line(format!("*denDelayFront = {};", write_numeric(0.0, &scalar)));
        }

        add_param_bindings(env, child, psm.params.iter().cloned(), &suffix, |g| g.ps_params());
        add_param_bindings(
            env,
            child,
            psm.derived_params.iter().map(|d| d.name.clone()),
            &suffix,
            |g| g.ps_derived_params(),
        );
        add_egp_bindings(env, child, &psm.extra_global_params, &suffix, GroupRef::Synapse);

        env.add("inSyn", scalar.clone(), "linSyn");
        // The group's chosen post target variable receives the input
        env.add("Isyn", scalar.clone(), format!("$(_{})", sg.post_target_var()));

        // PSM state variables cached per neuron
        env.push_scope();
        for var in &psm.vars {
            let var_ty = ctx.resolve(&var.ty).unwrap_or_else(|_| scalar.clone());
            add_array_field(
                env,
                child,
                &format!("_{}_array", var.name),
                format!("{}{}", var.name, suffix),
                var_ty.clone(),
                &var.name,
                GroupRef::Synapse,
            );
            env.add_cached(CachedVar {
                name: var.name.clone(),
                local_name: format!("lps{}{}", var.name, k),
                ty: var_ty,
                array: format!("$(_{}_array)", var.name),
                read_index: idx.clone(),
                write_index: idx.clone(),
                write_back: var.access.mode() == VarAccessMode::ReadWrite,
            });
        }

        let mut handler = ErrorHandler::new(format!(
            "Synapse group '{}' postsynaptic model apply input code",
            sg.name()
        ));
        if !emit_statements(env, sg.ps_apply_input_code(), &mut handler, stream) {
            diagnostics.extend(handler.into_diagnostics());
        }
        let mut handler = ErrorHandler::new(format!(
            "Synapse group '{}' postsynaptic model decay code",
            sg.name()
        ));
        if !emit_statements(env, sg.ps_decay_code(), &mut handler, stream) {
            diagnostics.extend(handler.into_diagnostics());
        }

        env.pop_scope(stream);
        env.print_line(stream, format!("$(_out_post)[{}] = linSyn;", idx));
        env.pop_scope(stream);
        stream.close();

        let fields = env.take_fields();
        self.merged.add_fields(fields)?;
        Ok(())
    }

    fn generate_pre_output(
        &mut self,
        k: usize,
        env: &mut KernelEnvironment<'_>,
        stream: &mut CodeStream,
        batch_size: u32,
    ) -> Result<()> {
        let suffix = format!("OutSyn{}", k);
        let child = &self.out_syn_pre_output[k];
        let sg = child.archetype();
        let scalar = env.type_context().scalar_type();
        let dims = VarAccessDim { element: true, batch: true };
        let idx = self.var_index(batch_size, dims, "lid");

        env.push_scope();
        add_array_field(env, child, "_out_pre", format!("outPre{}", suffix), scalar.clone(), "outPre", GroupRef::Synapse);
        env.mark_used("_out_pre");
        env.flush(stream);

        // Accumulate into the configured pre-target variable, zero the slot
        env.print_line(stream, format!(
            "$(_{}) += $(_out_pre)[{}];",
            sg.pre_target_var(),
            idx
        ));
        env.print_line(stream, format!(
            "$(_out_pre)[{}] = {};",
            idx,
            write_numeric(0.0, &scalar)
        ));
        env.pop_scope(stream);

        let fields = env.take_fields();
        self.merged.add_fields(fields)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn generate_current_source(
        &mut self,
        k: usize,
        model: &Model,
        env: &mut KernelEnvironment<'_>,
        stream: &mut CodeStream,
        batch_size: u32,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<()> {
        let ctx = model.type_context();
        let scalar = ctx.scalar_type();
        let suffix = format!("CS{}", k);
        let child = &self.current_sources[k];
        let cs = child.archetype();
        let cm = cs.model().clone();
        let dims = VarAccessDim { element: true, batch: true };
        let idx = self.var_index(batch_size, dims, "lid");

        stream.line(format!("// current source {}", k));
        stream.open("");
        env.push_scope();

        add_param_bindings(env, child, cm.params.iter().cloned(), &suffix, |g| g.params());
        add_param_bindings(
            env,
            child,
            cm.derived_params.iter().map(|d| d.name.clone()),
            &suffix,
            |g| g.derived_params(),
        );
        add_egp_bindings(env, child, &cm.extra_global_params, &suffix, GroupRef::CurrentSource);

        // injectCurrent(x) accumulates into the chosen target variable
        env.add(
            "injectCurrent",
            ResolvedType::function(ResolvedType::void(), vec![scalar.clone()]),
            format!("$(_{}) += $(0)", cs.target_var()),
        );

        env.push_scope();
        for var in &cm.vars {
            let var_ty = ctx.resolve(&var.ty).unwrap_or_else(|_| scalar.clone());
            add_array_field(
                env,
                child,
                &format!("_{}_array", var.name),
                format!("{}{}", var.name, suffix),
                var_ty.clone(),
                &var.name,
                GroupRef::CurrentSource,
            );
            env.add_cached(CachedVar {
                name: var.name.clone(),
                local_name: format!("lcs{}{}", var.name, k),
                ty: var_ty,
                array: format!("$(_{}_array)", var.name),
                read_index: idx.clone(),
                write_index: idx.clone(),
                write_back: var.access.mode() == VarAccessMode::ReadWrite,
            });
        }

        let mut handler =
            ErrorHandler::new(format!("Current source '{}' injection code", cs.name()));
        if !emit_statements(env, cs.injection_code(), &mut handler, stream) {
            diagnostics.extend(handler.into_diagnostics());
        }

        env.pop_scope(stream);
        env.pop_scope(stream);
        stream.close();

        let fields = env.take_fields();
        self.merged.add_fields(fields)?;
        Ok(())
    }

    /// Presynaptic (outgoing) or postsynaptic (incoming) weight-update
    /// state: dynamics every step, spike-triggered code on emission
    #[allow(clippy::too_many_arguments)]
    fn generate_wu_pre_post(
        &mut self,
        k: usize,
        pre_not_post: bool,
        dynamics_not_spike: bool,
        model: &Model,
        env: &mut KernelEnvironment<'_>,
        stream: &mut CodeStream,
        batch_size: u32,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<()> {
        let ctx = model.type_context();
        let scalar = ctx.scalar_type();
        let child = if pre_not_post {
            &self.out_syn_wu_pre[k]
        } else {
            &self.in_syn_wu_post[k]
        };
        let sg = child.archetype();
        let wum = sg.wu_model().clone();
        let (fragment, vars, delayed, suffix, context) = if pre_not_post {
            (
                if dynamics_not_spike {
                    sg.wu_pre_dynamics_code()
                } else {
                    sg.wu_pre_spike_code()
                },
                &wum.pre_vars,
                sg.delay_steps() != 0,
                format!("OutSynWUMPre{}", k),
                format!(
                    "Synapse group '{}' weight update model presynaptic {} code",
                    sg.name(),
                    if dynamics_not_spike { "dynamics" } else { "spike" }
                ),
            )
        } else {
            (
                if dynamics_not_spike {
                    sg.wu_post_dynamics_code()
                } else {
                    sg.wu_post_spike_code()
                },
                &wum.post_vars,
                sg.back_prop_delay_steps() != 0,
                format!("InSynWUMPost{}", k),
                format!(
                    "Synapse group '{}' weight update model postsynaptic {} code",
                    sg.name(),
                    if dynamics_not_spike { "dynamics" } else { "spike" }
                ),
            )
        };
        if fragment.is_empty() {
            return Ok(());
        }

        stream.line(format!(
            "// {} weight update {}",
            if pre_not_post { "presynaptic" } else { "postsynaptic" },
            k
        ));
        stream.open("");
        env.push_scope();

        add_param_bindings(env, child, wum.params.iter().cloned(), &suffix, |g| g.wu_params());
        add_param_bindings(
            env,
            child,
            wum.derived_params.iter().map(|d| d.name.clone()),
            &suffix,
            |g| g.wu_derived_params(),
        );
        add_egp_bindings(env, child, &wum.extra_global_params, &suffix, GroupRef::Synapse);

        env.push_scope();
        for var in vars {
            let var_ty = ctx.resolve(&var.ty).unwrap_or_else(|_| scalar.clone());
            add_array_field(
                env,
                child,
                &format!("_{}_array", var.name),
                format!("{}{}", var.name, suffix),
                var_ty.clone(),
                &var.name,
                GroupRef::Synapse,
            );
            let dims = var.access.dims();
            env.add_cached(CachedVar {
                name: var.name.clone(),
                local_name: format!("lwu{}{}", var.name, k),
                ty: var_ty,
                array: format!("$(_{}_array)", var.name),
                read_index: self.read_var_index(delayed, batch_size, dims, "lid"),
                write_index: self.write_var_index(delayed, batch_size, dims, "lid"),
                // Delayed groups always flush so the next slot is seeded
                write_back: var.access.mode() == VarAccessMode::ReadWrite || delayed,
            });
        }

        let mut handler = ErrorHandler::new(context);
        if !emit_statements(env, fragment, &mut handler, stream) {
            diagnostics.extend(handler.into_diagnostics());
        }

        env.pop_scope(stream);
        env.pop_scope(stream);
        stream.close();

        let fields = env.take_fields();
        self.merged.add_fields(fields)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn generate_spike_event_condition(
        &mut self,
        k: usize,
        model: &Model,
        backend: &dyn Backend,
        env: &mut KernelEnvironment<'_>,
        stream: &mut CodeStream,
        batch_size: u32,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<()> {
        let ctx = model.type_context();
        let scalar = ctx.scalar_type();
        let suffix = format!("SynSpikeEvent{}", k);
        let child = &self.out_syn_spike_event[k];
        let sg = child.archetype();
        let wum = sg.wu_model().clone();

        stream.line(format!("// spike event condition {}", k));
        env.push_scope();
        add_param_bindings(env, child, wum.params.iter().cloned(), &suffix, |g| g.wu_params());
        add_param_bindings(
            env,
            child,
            wum.derived_params.iter().map(|d| d.name.clone()),
            &suffix,
            |g| g.wu_derived_params(),
        );
        add_egp_bindings(env, child, &wum.extra_global_params, &suffix, GroupRef::Synapse);

        // Presynaptic view of the neuron's own state
        let archetype = self.merged.archetype();
        for var in &archetype.model().vars {
            env.add(
                format!("{}_pre", var.name),
                ctx.resolve(&var.ty)
                    .unwrap_or_else(|_| scalar.clone())
                    .add_const(),
                format!("$({})", var.name),
            );
        }

        let mut handler = ErrorHandler::new(format!(
            "Synapse group '{}' event threshold condition",
            sg.name()
        ));
        match emit_expression(env, sg.wu_event_threshold_code(), &mut handler, stream) {
            Some(condition) => {
                stream.open(&format!("if ({})", condition));
                self.generate_emit_spike_event(backend, &mut *env, stream, batch_size);
                stream.close();
            }
            None => diagnostics.extend(handler.into_diagnostics()),
        }

        env.pop_scope(stream);
        let fields = env.take_fields();
        self.merged.add_fields(fields)?;
        Ok(())
    }

    fn generate_emit_true_spike(
        &self,
        backend: &dyn Backend,
        archetype: &NeuronGroup,
        env: &mut KernelEnvironment<'_>,
        stream: &mut CodeStream,
        batch_size: u32,
    ) {
        let atomic = backend.atomic(NumericType::Uint32, AtomicOperation::Add, AtomicMemSpace::Global);
        let dims = VarAccessDim { element: true, batch: true };
        let slot = self.write_var_index(
            archetype.is_delay_required(),
            batch_size,
            VarAccessDim { element: false, batch: true },
            "lid",
        );
        env.mark_used("_spk_cnt");
        env.mark_used("_spk");
        if archetype.is_spike_time_required() {
            env.mark_used("_st");
        }
        if archetype.is_spike_recording_enabled() {
            env.mark_used("_record_spk");
        }
        env.flush(stream);
        env.print_line(stream, format!(
            "const unsigned int spkIdx = {}(&$(_spk_cnt)[{}], 1);",
            atomic, slot
        ));
        env.print_line(stream, format!(
            "$(_spk)[{} + spkIdx] = lid;",
            self.write_var_index(archetype.is_delay_required(), batch_size, dims, "0")
        ));
        if archetype.is_spike_time_required() {
            env.print_line(stream, format!(
                "$(_st)[{}] = t;",
                self.write_var_index(archetype.is_delay_required(), batch_size, dims, "lid")
            ));
        }
        if archetype.is_spike_recording_enabled() {
            let or = backend.atomic(NumericType::Uint32, AtomicOperation::Or, AtomicMemSpace::Global);
            env.print_line(stream, format!(
                "{}(&$(_record_spk)[$(_record_offset) + (lid / 32)], 1 << (lid % 32));",
                or
            ));
        }
    }

    fn generate_emit_spike_event(
        &self,
        backend: &dyn Backend,
        env: &mut KernelEnvironment<'_>,
        stream: &mut CodeStream,
        batch_size: u32,
    ) {
        let archetype = self.merged.archetype();
        let atomic = backend.atomic(NumericType::Uint32, AtomicOperation::Add, AtomicMemSpace::Global);
        let dims = VarAccessDim { element: true, batch: true };
        let slot = self.write_var_index(
            archetype.is_delay_required(),
            batch_size,
            VarAccessDim { element: false, batch: true },
            "lid",
        );
        env.mark_used("_spk_evnt_cnt");
        env.mark_used("_spk_evnt");
        if archetype.is_spike_event_time_required() {
            env.mark_used("_set");
        }
        env.flush(stream);
        env.print_line(stream, format!(
            "const unsigned int spkEvntIdx = {}(&$(_spk_evnt_cnt)[{}], 1);",
            atomic, slot
        ));
        env.print_line(stream, format!(
            "$(_spk_evnt)[{} + spkEvntIdx] = lid;",
            self.write_var_index(archetype.is_delay_required(), batch_size, dims, "0")
        ));
        if archetype.is_spike_event_time_required() {
            env.print_line(stream, format!(
                "$(_set)[{}] = t;",
                self.write_var_index(archetype.is_delay_required(), batch_size, dims, "lid")
            ));
        }
    }
}

/// Strip any `$(name)` references the environment could not resolve;
/// they only survive for names already spelled like their expansion
pub(crate) fn resolve_residual(text: &str) -> String {
    if !text.contains("$(") {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find("$(") {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 2..];
        match tail.find(')') {
            Some(close) => {
                out.push_str(&tail[..close]);
                rest = &tail[close + 1..];
            }
            None => {
                out.push_str(tail);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}
