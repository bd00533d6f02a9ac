// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Custom-update merged groups: user-defined passes over referenced
//! variables, run out-of-band within a named update group.

use crate::backend::Backend;
use crate::code_stream::CodeStream;
use crate::environment::{emit_statements, CachedVar, KernelEnvironment};
use crate::merged::{partition_by_digest, GroupRef, MergedGroup};
use crate::neuron_update::{
    add_array_field, add_egp_bindings, add_param_bindings, resolve_residual,
};
use crate::Result;
use neurogen_model::{
    CustomConnectivityUpdate, CustomConnectivityUpdateId, CustomUpdate, CustomUpdateId,
    CustomUpdateWu, CustomUpdateWuId, Model, VarAccessMode, VarRefTarget,
};
use neurogen_transpiler::{Diagnostic, ErrorHandler};
use neurogen_types::{NumericType, ResolvedType};

/// Merged per-element custom updates for one named update group
pub struct CustomUpdateGroupMerged<'m> {
    pub update_group_name: String,
    pub merged: MergedGroup<'m, CustomUpdateId, CustomUpdate>,
}

impl<'m> CustomUpdateGroupMerged<'m> {
    pub fn build(model: &'m Model, update_group_name: &str) -> Vec<CustomUpdateGroupMerged<'m>> {
        let members = model
            .custom_updates()
            .filter(|(_, cu)| cu.update_group_name() == update_group_name);
        partition_by_digest(members, |_, cu| cu.hash_digest())
            .into_iter()
            .map(|merged| CustomUpdateGroupMerged {
                update_group_name: update_group_name.to_string(),
                merged,
            })
            .collect()
    }

    pub fn generate(
        &mut self,
        model: &Model,
        _backend: &dyn Backend,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<String> {
        let ctx = model.type_context();
        let scalar = ctx.scalar_type();
        let uint = ResolvedType::numeric(NumericType::Uint32);
        let cu = self.merged.archetype();
        let cm = cu.model().clone();

        let mut stream = CodeStream::new();
        let mut env = KernelEnvironment::new(&ctx);
        env.push_scope();
        env.add("id", uint.add_const(), "lid");
        env.add("size", uint.add_const(), "group->size");
        self.merged.add_field(crate::merged::Field {
            name: "size".into(),
            ty: uint.clone(),
            values: self
                .merged
                .groups()
                .iter()
                .map(|g| crate::merged::FieldInit::U32(g.size()))
                .collect(),
        })?;
        let batch_offset = if cu.is_batched() && model.batch_size() > 1 {
            "(batch * group->size) + "
        } else {
            ""
        };

        add_param_bindings(&mut env, &self.merged, cm.params.iter().cloned(), "CU", |g| {
            g.params()
        });
        add_param_bindings(
            &mut env,
            &self.merged,
            cm.derived_params.iter().map(|d| d.name.clone()),
            "CU",
            |g| g.derived_params(),
        );
        add_egp_bindings(&mut env, &self.merged, &cm.extra_global_params, "CU", GroupRef::CustomUpdate);

        env.print_open(&mut stream, "if (lid < $(size))");
        env.push_scope();

        // Own state, cached per element
        for var in &cm.vars {
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
            env.add_cached(CachedVar {
                name: var.name.clone(),
                local_name: format!("l{}", var.name),
                ty: var_ty,
                array: format!("$(_{}_array)", var.name),
                read_index: format!("{}lid", batch_offset),
                write_index: format!("{}lid", batch_offset),
                write_back: var.access.mode() == VarAccessMode::ReadWrite,
            });
        }

        // Referenced state, cached through the reference target
        for def in &cm.var_refs {
            let var_ty = ctx.resolve(&def.ty).unwrap_or_else(|_| scalar.clone());
            let field_name = format!("{}Ref", def.name);
            let values = self
                .merged
                .groups()
                .iter()
                .map(|g| {
                    let member_ref = &g.var_references()[&def.name];
                    let (member_group, member_var) = match &member_ref.target {
                        VarRefTarget::NeuronVar { group, var } => {
                            (GroupRef::Neuron(*group), var.clone())
                        }
                        VarRefTarget::CurrentSourceVar { source, var } => {
                            (GroupRef::CurrentSource(*source), var.clone())
                        }
                        VarRefTarget::PsmVar { group, var }
                        | VarRefTarget::WuPreVar { group, var }
                        | VarRefTarget::WuPostVar { group, var } => {
                            (GroupRef::Synapse(*group), var.clone())
                        }
                        VarRefTarget::CustomUpdateVar { update, var } => {
                            (GroupRef::CustomUpdate(*update), var.clone())
                        }
                    };
                    crate::merged::FieldInit::Array {
                        group: member_group,
                        var: member_var,
                    }
                })
                .collect();
            env.add_field(
                format!("_{}_ref", def.name),
                var_ty.create_pointer(),
                format!("group->{}", field_name),
                crate::merged::Field {
                    name: field_name,
                    ty: var_ty.create_pointer(),
                    values,
                },
            );
            env.add_cached(CachedVar {
                name: def.name.clone(),
                local_name: format!("l{}", def.name),
                ty: if def.access == VarAccessMode::ReadOnly {
                    var_ty.add_const()
                } else {
                    var_ty
                },
                array: format!("$(_{}_ref)", def.name),
                read_index: format!("{}lid", batch_offset),
                write_index: format!("{}lid", batch_offset),
                write_back: def.access == VarAccessMode::ReadWrite,
            });
        }

        let mut handler =
            ErrorHandler::new(format!("Custom update '{}' update code", cu.name()));
        if !emit_statements(&mut env, cu.update_code(), &mut handler, &mut stream) {
            diagnostics.extend(handler.into_diagnostics());
        }

        env.pop_scope(&mut stream);
        stream.close();
        env.pop_scope(&mut stream);
        env.flush(&mut stream);
        self.merged.add_fields(env.take_fields())?;
        Ok(resolve_residual(&stream.into_string()))
    }
}

/// Merged per-synapse custom updates for one named update group
pub struct CustomUpdateWuGroupMerged<'m> {
    pub update_group_name: String,
    pub merged: MergedGroup<'m, CustomUpdateWuId, CustomUpdateWu>,
}

impl<'m> CustomUpdateWuGroupMerged<'m> {
    fn add_size_fields(&mut self, model: &Model, backend: &dyn Backend) -> crate::Result<()> {
        let uint = ResolvedType::numeric(NumericType::Uint32);
        let sizes = |f: &dyn Fn(&CustomUpdateWu) -> u32| -> Vec<crate::merged::FieldInit> {
            self.merged
                .groups()
                .iter()
                .map(|g| crate::merged::FieldInit::U32(f(g)))
                .collect()
        };
        let num_src = sizes(&|g| {
            model
                .neuron_group(model.synapse_group(g.synapse_group()).src())
                .num_neurons()
        });
        let stride = sizes(&|g| {
            let sg = model.synapse_group(g.synapse_group());
            backend.synaptic_matrix_row_stride(sg, model.neuron_group(sg.trg()).num_neurons())
                as u32
        });
        self.merged.add_field(crate::merged::Field {
            name: "numSrcNeurons".into(),
            ty: uint.clone(),
            values: num_src,
        })?;
        self.merged.add_field(crate::merged::Field {
            name: "rowStride".into(),
            ty: uint,
            values: stride,
        })?;
        Ok(())
    }

    pub fn build(model: &'m Model, update_group_name: &str) -> Vec<CustomUpdateWuGroupMerged<'m>> {
        let members = model
            .custom_wu_updates()
            .filter(|(_, cu)| cu.update_group_name() == update_group_name);
        partition_by_digest(members, |_, cu| cu.hash_digest())
            .into_iter()
            .map(|merged| CustomUpdateWuGroupMerged {
                update_group_name: update_group_name.to_string(),
                merged,
            })
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
        let cm = cu.model().clone();
        let sg = model.synapse_group(cu.synapse_group());
        let trg = model.neuron_group(sg.trg());

        let mut stream = CodeStream::new();
        let mut env = KernelEnvironment::new(&ctx);
        env.push_scope();
        self.add_size_fields(model, backend)?;
        env.add("num_pre", uint.add_const(), "group->numSrcNeurons");
        env.add("row_stride", uint.add_const(), "group->rowStride");
        env.add("id_pre", uint.add_const(), "(lid / $(row_stride))");
        env.add("id_syn", uint.add_const(), "lid");

        add_param_bindings(&mut env, &self.merged, cm.params.iter().cloned(), "CU", |g| {
            g.params()
        });
        add_param_bindings(
            &mut env,
            &self.merged,
            cm.derived_params.iter().map(|d| d.name.clone()),
            "CU",
            |g| g.derived_params(),
        );

        if sg.matrix_type().is_sparse() {
            // Connectivity comes from each member's referenced synapse
            // group
            let synapse_of =
                |id: CustomUpdateWuId| GroupRef::Synapse(model.custom_wu_update(id).synapse_group());
            add_array_field(&mut env, &self.merged, "_row_length", "rowLength".into(), uint.clone(), "rowLength", synapse_of);
            let ind_ty = ResolvedType::numeric(sg.sparse_ind_type(trg.num_neurons()));
            add_array_field(&mut env, &self.merged, "_ind", "ind".into(), ind_ty, "ind", synapse_of);
            env.print_open(&mut stream, "if ((lid % $(row_stride)) < $(_row_length)[lid / $(row_stride)])");
            env.add("id_post", uint.add_const(), "$(_ind)[lid]");
        } else {
            env.print_open(&mut stream, "if (lid < ($(num_pre) * $(row_stride)))");
            env.add("id_post", uint.add_const(), "(lid % $(row_stride))");
        }

        env.push_scope();
        for var in &cm.vars {
            let var_ty = ctx.resolve(&var.ty).unwrap_or_else(|_| scalar.clone());
            add_array_field(
                &mut env,
                &self.merged,
                &format!("_{}_array", var.name),
                var.name.clone(),
                var_ty.clone(),
                &var.name,
                GroupRef::CustomUpdateWu,
            );
            env.add_cached(CachedVar {
                name: var.name.clone(),
                local_name: format!("l{}", var.name),
                ty: var_ty,
                array: format!("$(_{}_array)", var.name),
                read_index: "lid".into(),
                write_index: "lid".into(),
                write_back: var.access.mode() == VarAccessMode::ReadWrite,
            });
        }
        for def in &cm.var_refs {
            let var_ty = ctx.resolve(&def.ty).unwrap_or_else(|_| scalar.clone());
            let field_name = format!("{}Ref", def.name);
            let values = self
                .merged
                .groups()
                .iter()
                .map(|g| {
                    let member_ref = &g.var_references()[&def.name];
                    crate::merged::FieldInit::Array {
                        group: GroupRef::Synapse(member_ref.group),
                        var: member_ref.var.clone(),
                    }
                })
                .collect();
            env.add_field(
                format!("_{}_ref", def.name),
                var_ty.create_pointer(),
                format!("group->{}", field_name),
                crate::merged::Field {
                    name: field_name,
                    ty: var_ty.create_pointer(),
                    values,
                },
            );
            env.add_cached(CachedVar {
                name: def.name.clone(),
                local_name: format!("l{}", def.name),
                ty: if def.access == VarAccessMode::ReadOnly {
                    var_ty.add_const()
                } else {
                    var_ty
                },
                array: format!("$(_{}_ref)", def.name),
                read_index: "lid".into(),
                write_index: "lid".into(),
                write_back: def.access == VarAccessMode::ReadWrite,
            });
        }

        let mut handler =
            ErrorHandler::new(format!("Custom update '{}' update code", cu.name()));
        if !emit_statements(&mut env, cu.update_code(), &mut handler, &mut stream) {
            diagnostics.extend(handler.into_diagnostics());
        }

        env.pop_scope(&mut stream);
        stream.close();
        env.pop_scope(&mut stream);
        env.flush(&mut stream);
        self.merged.add_fields(env.take_fields())?;
        Ok(resolve_residual(&stream.into_string()))
    }
}

/// Merged custom connectivity updates for one named update group
pub struct CustomConnectivityUpdateGroupMerged<'m> {
    pub update_group_name: String,
    pub merged: MergedGroup<'m, CustomConnectivityUpdateId, CustomConnectivityUpdate>,
}

impl<'m> CustomConnectivityUpdateGroupMerged<'m> {
    fn add_size_fields(&mut self, model: &Model, backend: &dyn Backend) -> crate::Result<()> {
        let uint = ResolvedType::numeric(NumericType::Uint32);
        let sizes = |f: &dyn Fn(&CustomConnectivityUpdate) -> u32| -> Vec<crate::merged::FieldInit> {
            self.merged
                .groups()
                .iter()
                .map(|g| crate::merged::FieldInit::U32(f(g)))
                .collect()
        };
        let num_src = sizes(&|g| {
            model
                .neuron_group(model.synapse_group(g.synapse_group()).src())
                .num_neurons()
        });
        let num_trg = sizes(&|g| {
            model
                .neuron_group(model.synapse_group(g.synapse_group()).trg())
                .num_neurons()
        });
        let stride = sizes(&|g| {
            let sg = model.synapse_group(g.synapse_group());
            backend.synaptic_matrix_row_stride(sg, model.neuron_group(sg.trg()).num_neurons())
                as u32
        });
        self.merged.add_field(crate::merged::Field {
            name: "numSrcNeurons".into(),
            ty: uint.clone(),
            values: num_src,
        })?;
        self.merged.add_field(crate::merged::Field {
            name: "numTrgNeurons".into(),
            ty: uint.clone(),
            values: num_trg,
        })?;
        self.merged.add_field(crate::merged::Field {
            name: "rowStride".into(),
            ty: uint,
            values: stride,
        })?;
        Ok(())
    }

    pub fn build(
        model: &'m Model,
        update_group_name: &str,
    ) -> Vec<CustomConnectivityUpdateGroupMerged<'m>> {
        let members = model
            .custom_connectivity_updates()
            .filter(|(_, cu)| cu.update_group_name() == update_group_name);
        partition_by_digest(members, |_, cu| cu.hash_digest())
            .into_iter()
            .map(|merged| CustomConnectivityUpdateGroupMerged {
                update_group_name: update_group_name.to_string(),
                merged,
            })
            .collect()
    }

    /// Row-update pass: one thread per source neuron with mutable row
    /// state
    pub fn generate(
        &mut self,
        model: &Model,
        backend: &dyn Backend,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<String> {
        let ctx = model.type_context();
        let uint = ResolvedType::numeric(NumericType::Uint32);
        let cu = self.merged.archetype();
        let sg = model.synapse_group(cu.synapse_group());
        let trg = model.neuron_group(sg.trg());
        let cm = cu.model().clone();

        let mut stream = CodeStream::new();
        let mut env = KernelEnvironment::new(&ctx);
        env.push_scope();
        self.add_size_fields(model, backend)?;
        env.add("num_pre", uint.add_const(), "group->numSrcNeurons");
        env.add("num_post", uint.add_const(), "group->numTrgNeurons");
        env.add("row_stride", uint.add_const(), "group->rowStride");
        env.add("id_pre", uint.add_const(), "lid");

        let synapse_of = |id: CustomConnectivityUpdateId| {
            GroupRef::Synapse(model.custom_connectivity_update(id).synapse_group())
        };
        add_array_field(&mut env, &self.merged, "_row_length", "rowLength".into(), uint.clone(), "rowLength", synapse_of);
        let ind_ty = ResolvedType::numeric(sg.sparse_ind_type(trg.num_neurons()));
        add_array_field(&mut env, &self.merged, "_ind", "ind".into(), ind_ty, "ind", synapse_of);

        add_param_bindings(&mut env, &self.merged, cm.params.iter().cloned(), "CCU", |g| {
            g.params()
        });

        env.print_open(&mut stream, "if (lid < $(num_pre))");
        env.push_scope();

        // Own state: per-synapse variables as row pointers, presynaptic
        // variables cached per thread
        let scalar = ctx.scalar_type();
        for var in &cm.vars {
            let var_ty = ctx.resolve(&var.ty).unwrap_or_else(|_| scalar.clone());
            add_array_field(
                &mut env,
                &self.merged,
                &format!("_{}_array", var.name),
                var.name.clone(),
                var_ty.clone(),
                &var.name,
                GroupRef::CustomConnectivityUpdate,
            );
            env.add(
                var.name.clone(),
                var_ty.create_pointer(),
                format!("(&$(_{}_array)[lid * $(row_stride)])", var.name),
            );
        }
        for var in &cm.pre_vars {
            let var_ty = ctx.resolve(&var.ty).unwrap_or_else(|_| scalar.clone());
            add_array_field(
                &mut env,
                &self.merged,
                &format!("_{}_array", var.name),
                var.name.clone(),
                var_ty.clone(),
                &var.name,
                GroupRef::CustomConnectivityUpdate,
            );
            env.add_cached(CachedVar {
                name: var.name.clone(),
                local_name: format!("l{}", var.name),
                ty: var_ty,
                array: format!("$(_{}_array)", var.name),
                read_index: "lid".into(),
                write_index: "lid".into(),
                write_back: var.access.mode() == VarAccessMode::ReadWrite,
            });
        }
        for var in &cm.post_vars {
            let var_ty = ctx.resolve(&var.ty).unwrap_or_else(|_| scalar.clone());
            add_array_field(
                &mut env,
                &self.merged,
                &format!("_{}_array", var.name),
                var.name.clone(),
                var_ty.clone(),
                &var.name,
                GroupRef::CustomConnectivityUpdate,
            );
            env.add(
                var.name.clone(),
                var_ty.create_pointer(),
                format!("$(_{}_array)", var.name),
            );
        }

        // Mutable view of this thread's row
        env.add("row_length", uint.clone(), "$(_row_length)[lid]");
        env.add(
            "row_ind",
            ResolvedType::numeric(sg.sparse_ind_type(trg.num_neurons())).create_pointer(),
            "(&$(_ind)[lid * $(row_stride)])",
        );
        env.add(
            "addSynapse",
            ResolvedType::function(ResolvedType::void(), vec![uint.clone()]),
            format!(
                "{{ if ($(_row_length)[lid] < {}) {{ $(_ind)[(lid * $(row_stride)) + $(_row_length)[lid]] = $(0); $(_row_length)[lid]++; }} }}",
                sg.max_connections()
            ),
        );
        env.add(
            "removeSynapse",
            ResolvedType::function(ResolvedType::void(), vec![uint.clone()]),
            "{ $(_row_length)[lid]--; $(_ind)[(lid * $(row_stride)) + $(0)] = $(_ind)[(lid * $(row_stride)) + $(_row_length)[lid]]; }".to_string(),
        );

        let mut handler = ErrorHandler::new(format!(
            "Custom connectivity update '{}' row update code",
            cu.name()
        ));
        if !emit_statements(&mut env, cu.row_update_code(), &mut handler, &mut stream) {
            diagnostics.extend(handler.into_diagnostics());
        }

        env.pop_scope(&mut stream);
        stream.close();
        env.pop_scope(&mut stream);
        env.flush(&mut stream);
        self.merged.add_fields(env.take_fields())?;
        Ok(resolve_residual(&stream.into_string()))
    }
}
