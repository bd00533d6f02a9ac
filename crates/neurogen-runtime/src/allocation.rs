// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Array allocation walk.
//!
//! After code generation the runtime walks the model and creates,
//! through the backend, every array the generated code expects: spike
//! state, recording bitfields, neuron / synapse / custom-update
//! variables, connectivity, and the fused accumulators owned by each
//! fused archetype.

use crate::{Result, RuntimeError};
use ahash::AHashMap;
use neurogen_codegen::{Array, Backend, Field, FieldInit, GroupRef, MergedModel};
use neurogen_model::{Model, VarAccessDim, VarLocation};
use neurogen_types::NumericType;

/// Owns every backing array, keyed by (group, variable name); frees in
/// reverse allocation order
pub struct ArrayMap {
    arrays: AHashMap<(GroupRef, String), Box<dyn Array>>,
    order: Vec<(GroupRef, String)>,
}

impl ArrayMap {
    fn new() -> Self {
        Self {
            arrays: AHashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn insert(
        &mut self,
        group: GroupRef,
        name: impl Into<String>,
        array: Box<dyn Array>,
    ) -> Result<()> {
        let key = (group, name.into());
        if self.arrays.contains_key(&key) {
            return Err(RuntimeError::DuplicateArray { name: key.1 });
        }
        self.order.push(key.clone());
        self.arrays.insert(key, array);
        Ok(())
    }

    pub fn get(&self, group: GroupRef, name: &str) -> Result<&dyn Array> {
        self.arrays
            .get(&(group, name.to_string()))
            .map(|a| a.as_ref())
            .ok_or_else(|| RuntimeError::UnknownArray {
                name: name.to_string(),
            })
    }

    pub fn get_mut(&mut self, group: GroupRef, name: &str) -> Result<&mut (dyn Array + '_)> {
        match self.arrays.get_mut(&(group, name.to_string())) {
            Some(array) => Ok(array.as_mut()),
            None => Err(RuntimeError::UnknownArray {
                name: name.to_string(),
            }),
        }
    }

    /// Free in reverse allocation order
    pub fn free_all(mut self) {
        for key in self.order.iter().rev() {
            if let Some(array) = self.arrays.get_mut(key) {
                array.free();
            }
        }
    }
}

fn ceil_divide(numerator: u64, denominator: u64) -> u64 {
    (numerator + denominator - 1) / denominator
}

/// Create every array the generated code expects. The merged model is
/// part of the contract so callers allocate for the same generation
/// pass whose field data they later push.
pub fn allocate_arrays(
    model: &Model,
    _merged: &MergedModel<'_>,
    backend: &dyn Backend,
    num_recording_timesteps: Option<u64>,
) -> Result<ArrayMap> {
    let mut arrays = ArrayMap::new();
    let batch = model.batch_size() as u64;
    let ctx = model.type_context();
    let scalar = ctx
        .scalar_type()
        .numeric_value()
        .expect("scalar precision is always numeric");
    let time = ctx
        .time_type()
        .numeric_value()
        .expect("time precision is always numeric");

    let mut create = |arrays: &mut ArrayMap,
                      group: GroupRef,
                      name: &str,
                      ty: NumericType,
                      count: u64,
                      location: VarLocation|
     -> Result<()> {
        let array = backend.create_array(ty, count as usize, location)?;
        arrays.insert(group, name, array)
    };

    // ---- neuron groups -----------------------------------------------
    for (ng_id, ng) in model.neuron_groups() {
        let group = GroupRef::Neuron(ng_id);
        let n = ng.num_neurons() as u64;
        let slots = ng.num_delay_slots() as u64;
        let neuron_delay_elements = batch * n * slots;

        if ng.is_true_spike_required() {
            create(&mut arrays, group, "spkCnt", NumericType::Uint32, batch * slots, ng.spike_location())?;
            create(&mut arrays, group, "spk", NumericType::Uint32, neuron_delay_elements, ng.spike_location())?;
        }
        if ng.is_spike_event_required() {
            create(&mut arrays, group, "spkEvntCnt", NumericType::Uint32, batch * slots, ng.spike_event_location())?;
            create(&mut arrays, group, "spkEvnt", NumericType::Uint32, neuron_delay_elements, ng.spike_event_location())?;
        }
        if ng.is_spike_recording_enabled() || ng.is_spike_event_recording_enabled() {
            let Some(timesteps) = num_recording_timesteps else {
                return Err(RuntimeError::RecordingUnset);
            };
            let words = ceil_divide(n, 32) * batch * timesteps;
            if ng.is_spike_recording_enabled() {
                create(&mut arrays, group, "recordSpk", NumericType::Uint32, words, VarLocation::HostDevice)?;
            }
            if ng.is_spike_event_recording_enabled() {
                create(&mut arrays, group, "recordSpkEvent", NumericType::Uint32, words, VarLocation::HostDevice)?;
            }
        }
        if ng.is_delay_required() {
            create(&mut arrays, group, "spkQuePtr", NumericType::Uint32, 1, VarLocation::HostDevice)?;
        }
        if ng.is_spike_time_required() {
            create(&mut arrays, group, "sT", time, neuron_delay_elements, ng.spike_time_location())?;
        }
        if ng.is_prev_spike_time_required() {
            create(&mut arrays, group, "prevST", time, neuron_delay_elements, ng.spike_time_location())?;
        }
        if ng.is_spike_event_time_required() {
            create(&mut arrays, group, "seT", time, neuron_delay_elements, ng.spike_time_location())?;
        }
        if ng.is_prev_spike_event_time_required() {
            create(&mut arrays, group, "prevSET", time, neuron_delay_elements, ng.spike_time_location())?;
        }

        // Neuron state, accounting for queueing and batch duplication
        for var in &ng.model().vars {
            let ty = ctx
                .resolve(&var.ty)
                .ok()
                .and_then(|t| t.numeric_value())
                .unwrap_or(scalar);
            let dims = var.access.dims();
            let queued = ng.is_var_queue_required(&var.name) && slots > 1;
            let count = element_count(dims, n, batch, if queued { slots } else { 1 });
            create(&mut arrays, group, &var.name, ty, count, ng.var_location(&var.name)?)?;
        }
        for egp in &ng.model().extra_global_params {
            let ty = ctx
                .resolve(&egp.ty)
                .ok()
                .and_then(|t| t.numeric_value())
                .unwrap_or(scalar);
            create(&mut arrays, group, &egp.name, ty, 0, VarLocation::HostDevice)?;
        }

        // Fused postsynaptic state owned by each archetype
        for &sg_id in ng.fused_psm_in_syn() {
            let sg = model.synapse_group(sg_id);
            let sg_ref = GroupRef::Synapse(sg_id);
            create(&mut arrays, sg_ref, "outPost", scalar, n * batch, sg.in_syn_location())?;
            if sg.is_dendritic_delay_required() {
                create(
                    &mut arrays,
                    sg_ref,
                    "denDelay",
                    scalar,
                    sg.max_dendritic_delay_timesteps() as u64 * n * batch,
                    sg.dendritic_delay_location(),
                )?;
                create(&mut arrays, sg_ref, "denDelayPtr", NumericType::Uint32, 1, VarLocation::HostDevice)?;
            }
            for var in &sg.ps_model().vars {
                let ty = ctx
                    .resolve(&var.ty)
                    .ok()
                    .and_then(|t| t.numeric_value())
                    .unwrap_or(scalar);
                create(&mut arrays, sg_ref, &var.name, ty, n * batch, sg.ps_var_location(&var.name)?)?;
            }
        }

        // Fused presynaptic output owned by each archetype
        for &sg_id in ng.fused_pre_output_out_syn() {
            let sg = model.synapse_group(sg_id);
            create(
                &mut arrays,
                GroupRef::Synapse(sg_id),
                "outPre",
                scalar,
                model.neuron_group(sg.src()).num_neurons() as u64 * batch,
                sg.in_syn_location(),
            )?;
        }

        // Fused pre / postsynaptic weight-update state
        for &sg_id in ng.fused_wu_pre_out_syn() {
            let sg = model.synapse_group(sg_id);
            let pre_slots = if sg.delay_steps() != 0 { slots } else { 1 };
            for var in &sg.wu_model().pre_vars {
                let ty = ctx
                    .resolve(&var.ty)
                    .ok()
                    .and_then(|t| t.numeric_value())
                    .unwrap_or(scalar);
                create(
                    &mut arrays,
                    GroupRef::Synapse(sg_id),
                    &var.name,
                    ty,
                    n * batch * pre_slots,
                    sg.wu_pre_var_location(&var.name)?,
                )?;
            }
        }
        for &sg_id in ng.fused_wu_post_in_syn() {
            let sg = model.synapse_group(sg_id);
            let post_slots = if sg.back_prop_delay_steps() != 0 { slots } else { 1 };
            for var in &sg.wu_model().post_vars {
                let ty = ctx
                    .resolve(&var.ty)
                    .ok()
                    .and_then(|t| t.numeric_value())
                    .unwrap_or(scalar);
                create(
                    &mut arrays,
                    GroupRef::Synapse(sg_id),
                    &var.name,
                    ty,
                    n * batch * post_slots,
                    sg.wu_post_var_location(&var.name)?,
                )?;
            }
        }

        // Current source state
        for &cs_id in ng.current_sources() {
            let cs = model.current_source(cs_id);
            let cs_ref = GroupRef::CurrentSource(cs_id);
            for var in &cs.model().vars {
                let ty = ctx
                    .resolve(&var.ty)
                    .ok()
                    .and_then(|t| t.numeric_value())
                    .unwrap_or(scalar);
                create(&mut arrays, cs_ref, &var.name, ty, n * batch, cs.var_location(&var.name)?)?;
            }
        }
    }

    // ---- synapse groups ----------------------------------------------
    for (sg_id, sg) in model.synapse_groups() {
        let group = GroupRef::Synapse(sg_id);
        let num_pre = model.neuron_group(sg.src()).num_neurons() as u64;
        let num_post = model.neuron_group(sg.trg()).num_neurons() as u64;
        let row_stride =
            backend.synaptic_matrix_row_stride(sg, model.neuron_group(sg.trg()).num_neurons())
                as u64;
        let matrix = sg.matrix_type();

        // Per-synapse weights sized by matrix type
        if matrix.has_individual_weights() || matrix.has_kernel_weights() {
            for var in &sg.wu_model().vars {
                let ty = ctx
                    .resolve(&var.ty)
                    .ok()
                    .and_then(|t| t.numeric_value())
                    .unwrap_or(scalar);
                let dims = var.access.dims();
                let copies = if dims.batch { batch } else { 1 };
                let elements = if dims.element {
                    if matrix.has_kernel_weights() {
                        sg.kernel_size_flattened().max(1)
                    } else {
                        num_pre * row_stride
                    }
                } else {
                    1
                };
                create(&mut arrays, group, &var.name, ty, copies * elements, sg.wu_var_location(&var.name)?)?;
            }
        }
        for egp in &sg.wu_model().extra_global_params {
            let ty = ctx
                .resolve(&egp.ty)
                .ok()
                .and_then(|t| t.numeric_value())
                .unwrap_or(scalar);
            create(&mut arrays, group, &egp.name, ty, 0, VarLocation::HostDevice)?;
        }

        // Connectivity
        if matrix.is_bitmask() {
            let words = ceil_divide(num_pre * row_stride, 32);
            create(&mut arrays, group, "gp", NumericType::Uint32, words, sg.sparse_connectivity_location())?;
        } else if matrix.is_sparse() {
            create(&mut arrays, group, "rowLength", NumericType::Uint32, num_pre, sg.sparse_connectivity_location())?;
            let ind_ty = sg.sparse_ind_type(model.neuron_group(sg.trg()).num_neurons());
            create(&mut arrays, group, "ind", ind_ty, num_pre * row_stride, sg.sparse_connectivity_location())?;

            // Remap only exists when learn-post code exists and the
            // backend reports it is required
            if backend.is_postsynaptic_remap_required() && !sg.wu_learn_post_code().is_empty() {
                let col_stride = sg.max_source_connections() as u64;
                create(&mut arrays, group, "colLength", NumericType::Uint32, num_post, VarLocation::DeviceOnly)?;
                create(&mut arrays, group, "remap", NumericType::Uint32, num_post * col_stride, VarLocation::DeviceOnly)?;
            }
        }
    }

    // ---- custom updates -----------------------------------------------
    for (cu_id, cu) in model.custom_updates() {
        let group = GroupRef::CustomUpdate(cu_id);
        let copies = if cu.is_batched() { batch } else { 1 };
        for var in &cu.model().vars {
            let ty = ctx
                .resolve(&var.ty)
                .ok()
                .and_then(|t| t.numeric_value())
                .unwrap_or(scalar);
            create(&mut arrays, group, &var.name, ty, cu.size() as u64 * copies, cu.var_location(&var.name)?)?;
        }
    }
    for (cu_id, cu) in model.custom_wu_updates() {
        let group = GroupRef::CustomUpdateWu(cu_id);
        let sg = model.synapse_group(cu.synapse_group());
        let num_pre = model.neuron_group(sg.src()).num_neurons() as u64;
        let row_stride =
            backend.synaptic_matrix_row_stride(sg, model.neuron_group(sg.trg()).num_neurons())
                as u64;
        for var in &cu.model().vars {
            let ty = ctx
                .resolve(&var.ty)
                .ok()
                .and_then(|t| t.numeric_value())
                .unwrap_or(scalar);
            create(&mut arrays, group, &var.name, ty, num_pre * row_stride, cu.var_location(&var.name)?)?;
        }
    }
    for (cu_id, cu) in model.custom_connectivity_updates() {
        let group = GroupRef::CustomConnectivityUpdate(cu_id);
        let sg = model.synapse_group(cu.synapse_group());
        let num_pre = model.neuron_group(sg.src()).num_neurons() as u64;
        let num_post = model.neuron_group(sg.trg()).num_neurons() as u64;
        let row_stride =
            backend.synaptic_matrix_row_stride(sg, model.neuron_group(sg.trg()).num_neurons())
                as u64;
        let kinds = [
            (&cu.model().vars, num_pre * row_stride),
            (&cu.model().pre_vars, num_pre),
            (&cu.model().post_vars, num_post),
        ];
        for (vars, count) in kinds {
            for var in vars {
                let ty = ctx
                    .resolve(&var.ty)
                    .ok()
                    .and_then(|t| t.numeric_value())
                    .unwrap_or(scalar);
                create(&mut arrays, group, &var.name, ty, count, VarLocation::HostDevice)?;
            }
        }
    }

    Ok(arrays)
}

fn element_count(dims: VarAccessDim, n: u64, batch: u64, slots: u64) -> u64 {
    let element = if dims.element { n * slots } else { 1 };
    let copies = if dims.batch { batch } else { 1 };
    element * copies
}

/// Pack one member's field values into the layout of the generated
/// merged-group struct (natural alignment, declaration order)
pub fn marshal_fields(fields: &[Field], member: usize, arrays: &ArrayMap) -> Result<Vec<u8>> {
    let mut out: Vec<u8> = Vec::new();
    let mut max_align = 1usize;

    for field in fields {
        let value = &field.values[member];
        let (size, align) = field_layout(field);
        max_align = max_align.max(align);
        while out.len() % align != 0 {
            out.push(0);
        }
        match value {
            FieldInit::Array { group, var } => {
                let array = arrays.get(*group, var)?;
                let ptr = array.host_bytes().as_ptr() as usize as u64;
                out.extend_from_slice(&ptr.to_le_bytes());
            }
            FieldInit::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            FieldInit::F64(v) => {
                if size == 4 {
                    out.extend_from_slice(&(*v as f32).to_le_bytes());
                } else {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
    }
    while out.len() % max_align != 0 {
        out.push(0);
    }
    Ok(out)
}

fn field_layout(field: &Field) -> (usize, usize) {
    if field.ty.is_pointer() {
        (8, 8)
    } else {
        let size = field.ty.numeric_value().map(|n| n.size()).unwrap_or(8);
        (size, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neurogen_codegen::{MergedModel, ReferenceBackend};
    use neurogen_model::NeuronGroupId;
    use neurogen_model::models;
    use neurogen_model::{ParamValues, SynapseMatrixType, SynapsePopulation, VarInit};
    use std::collections::BTreeMap;

    fn izhikevich_model(names: &[(&str, u32)]) -> Model {
        let mut model = Model::new("test");
        for (name, size) in names {
            let mut params = ParamValues::new();
            params.insert("a".into(), 0.02);
            params.insert("b".into(), 0.2);
            params.insert("c".into(), -65.0);
            params.insert("d".into(), 8.0);
            let mut vars = BTreeMap::new();
            vars.insert("V".to_string(), VarInit::constant(-65.0));
            vars.insert("U".to_string(), VarInit::constant(-20.0));
            model
                .add_neuron_population(*name, *size, models::izhikevich(), params, vars)
                .unwrap();
        }
        model
    }

    fn add_pulse(model: &mut Model, name: &str, src: &str, trg: &str, matrix: SynapseMatrixType) {
        let mut wu_vars = BTreeMap::new();
        wu_vars.insert("g".to_string(), VarInit::constant(1.0));
        model
            .add_synapse_population(SynapsePopulation {
                name: name.into(),
                matrix_type: matrix,
                delay_steps: 0,
                source: src.into(),
                target: trg.into(),
                wu_model: models::static_pulse(),
                wu_params: ParamValues::new(),
                wu_var_initialisers: wu_vars,
                wu_pre_var_initialisers: BTreeMap::new(),
                wu_post_var_initialisers: BTreeMap::new(),
                ps_model: models::delta_curr(),
                ps_params: ParamValues::new(),
                ps_var_initialisers: BTreeMap::new(),
                connectivity_initialiser: None,
                toeplitz_initialiser: None,
            })
            .unwrap();
    }

    #[test]
    fn test_recording_buffer_size() {
        // N = 70, batch = 4, 1000 recording timesteps:
        // ceil(70/32) * 4 * 1000 = 12000 words
        let mut model = izhikevich_model(&[("N", 70), ("Sink", 10)]);
        add_pulse(&mut model, "S", "N", "Sink", SynapseMatrixType::DENSE_INDIVIDUALG);
        model.set_batch_size(4).unwrap();
        let n = model.find_neuron_group("N").unwrap();
        model
            .neuron_group_mut(n)
            .unwrap()
            .set_spike_recording_enabled(true);
        model.finalise(1.0).unwrap();

        let backend = ReferenceBackend::default();
        let merged = MergedModel::new(&model, &backend).unwrap();
        let arrays = allocate_arrays(&model, &merged, &backend, Some(1000)).unwrap();
        let record = arrays.get(GroupRef::Neuron(n), "recordSpk").unwrap();
        assert_eq!(record.count(), 12_000);
    }

    #[test]
    fn test_recording_unset_fails() {
        let mut model = izhikevich_model(&[("N", 70), ("Sink", 10)]);
        add_pulse(&mut model, "S", "N", "Sink", SynapseMatrixType::DENSE_INDIVIDUALG);
        let n = model.find_neuron_group("N").unwrap();
        model
            .neuron_group_mut(n)
            .unwrap()
            .set_spike_recording_enabled(true);
        model.finalise(1.0).unwrap();

        let backend = ReferenceBackend::default();
        let merged = MergedModel::new(&model, &backend).unwrap();
        assert!(matches!(
            allocate_arrays(&model, &merged, &backend, None),
            Err(RuntimeError::RecordingUnset)
        ));
    }

    #[test]
    fn test_spike_buffers_sized_by_delay_slots() {
        let mut model = izhikevich_model(&[("Pre", 10), ("Post", 10)]);
        let mut wu_vars = BTreeMap::new();
        wu_vars.insert("g".to_string(), VarInit::constant(1.0));
        model
            .add_synapse_population(SynapsePopulation {
                name: "S".into(),
                matrix_type: SynapseMatrixType::DENSE_INDIVIDUALG,
                delay_steps: 3,
                source: "Pre".into(),
                target: "Post".into(),
                wu_model: models::static_pulse(),
                wu_params: ParamValues::new(),
                wu_var_initialisers: wu_vars,
                wu_pre_var_initialisers: BTreeMap::new(),
                wu_post_var_initialisers: BTreeMap::new(),
                ps_model: models::delta_curr(),
                ps_params: ParamValues::new(),
                ps_var_initialisers: BTreeMap::new(),
                connectivity_initialiser: None,
                toeplitz_initialiser: None,
            })
            .unwrap();
        model.finalise(1.0).unwrap();

        let backend = ReferenceBackend::default();
        let merged = MergedModel::new(&model, &backend).unwrap();
        let arrays = allocate_arrays(&model, &merged, &backend, None).unwrap();
        let pre = model.find_neuron_group("Pre").unwrap();
        // 4 delay slots: counters are per slot, buffers per slot per neuron
        assert_eq!(arrays.get(GroupRef::Neuron(pre), "spkCnt").unwrap().count(), 4);
        assert_eq!(arrays.get(GroupRef::Neuron(pre), "spk").unwrap().count(), 40);
        assert_eq!(
            arrays.get(GroupRef::Neuron(pre), "spkQuePtr").unwrap().count(),
            1
        );
    }

    #[test]
    fn test_sparse_ind_narrowing() {
        let mut model = izhikevich_model(&[("Pre", 10), ("Small", 200), ("Large", 300)]);
        model.set_default_narrow_sparse_ind_enabled(true).unwrap();
        add_pulse(&mut model, "SSmall", "Pre", "Small", SynapseMatrixType::SPARSE_INDIVIDUALG);
        add_pulse(&mut model, "SLarge", "Pre", "Large", SynapseMatrixType::SPARSE_INDIVIDUALG);
        model.finalise(1.0).unwrap();

        let backend = ReferenceBackend::default();
        let merged = MergedModel::new(&model, &backend).unwrap();
        let arrays = allocate_arrays(&model, &merged, &backend, None).unwrap();
        let small = model.find_synapse_group("SSmall").unwrap();
        let large = model.find_synapse_group("SLarge").unwrap();
        assert_eq!(
            arrays.get(GroupRef::Synapse(small), "ind").unwrap().element_type(),
            NumericType::Uint8
        );
        assert_eq!(
            arrays.get(GroupRef::Synapse(large), "ind").unwrap().element_type(),
            NumericType::Uint16
        );
    }

    #[test]
    fn test_fused_groups_allocate_one_accumulator() {
        let mut model = izhikevich_model(&[("PreA", 10), ("PreB", 10), ("Post", 10)]);
        model.set_fuse_postsynaptic_models(true).unwrap();
        add_pulse(&mut model, "SA", "PreA", "Post", SynapseMatrixType::DENSE_INDIVIDUALG);
        add_pulse(&mut model, "SB", "PreB", "Post", SynapseMatrixType::DENSE_INDIVIDUALG);
        model.finalise(1.0).unwrap();

        let backend = ReferenceBackend::default();
        let merged = MergedModel::new(&model, &backend).unwrap();
        let arrays = allocate_arrays(&model, &merged, &backend, None).unwrap();
        let sa = model.find_synapse_group("SA").unwrap();
        let sb = model.find_synapse_group("SB").unwrap();
        // The archetype owns the accumulator; the fused member has none
        assert!(arrays.get(GroupRef::Synapse(sa), "outPost").is_ok());
        assert!(arrays.get(GroupRef::Synapse(sb), "outPost").is_err());
    }

    #[test]
    fn test_duplicate_array_rejected() {
        let backend = ReferenceBackend::default();
        let mut map = ArrayMap::new();
        let make = || {
            backend
                .create_array(NumericType::Float, 4, VarLocation::HostDevice)
                .unwrap()
        };
        let group = GroupRef::Neuron(NeuronGroupId(0));
        map.insert(group, "V", make()).unwrap();
        assert!(matches!(
            map.insert(group, "V", make()),
            Err(RuntimeError::DuplicateArray { .. })
        ));
    }

    #[test]
    fn test_marshal_fields_layout() {
        use neurogen_types::ResolvedType;

        let backend = ReferenceBackend::default();
        let mut map = ArrayMap::new();
        let group = GroupRef::Neuron(NeuronGroupId(0));
        map.insert(
            group,
            "V",
            backend
                .create_array(NumericType::Float, 4, VarLocation::HostDevice)
                .unwrap(),
        )
        .unwrap();

        let fields = vec![
            Field {
                name: "numNeurons".into(),
                ty: ResolvedType::numeric(NumericType::Uint32),
                values: vec![FieldInit::U32(10)],
            },
            Field {
                name: "V".into(),
                ty: ResolvedType::numeric(NumericType::Float).create_pointer(),
                values: vec![FieldInit::Array { group, var: "V".into() }],
            },
        ];
        let data = marshal_fields(&fields, 0, &map).unwrap();
        // u32 at offset 0, pointer aligned up to offset 8, total 16
        assert_eq!(data.len(), 16);
        assert_eq!(&data[0..4], &10u32.to_le_bytes());
        let ptr = u64::from_le_bytes(data[8..16].try_into().unwrap());
        assert_eq!(
            ptr,
            map.get(group, "V").unwrap().host_bytes().as_ptr() as usize as u64
        );
    }
}
