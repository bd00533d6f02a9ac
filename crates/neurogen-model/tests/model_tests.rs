// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Model IR integration tests: construction, validation, finalise,
//! delay inference, hashing and fusion.

use neurogen_model::models;
use neurogen_model::{
    Model, ModelError, ParamValues, SynapseMatrixType, SynapsePopulation, VarInit,
};
use std::collections::BTreeMap;

fn izhikevich_params(a: f64) -> ParamValues {
    let mut params = ParamValues::new();
    params.insert("a".into(), a);
    params.insert("b".into(), 0.2);
    params.insert("c".into(), -65.0);
    params.insert("d".into(), 8.0);
    params
}

fn izhikevich_vars() -> BTreeMap<String, VarInit> {
    let mut vars = BTreeMap::new();
    vars.insert("V".to_string(), VarInit::constant(-65.0));
    vars.insert("U".to_string(), VarInit::constant(-20.0));
    vars
}

fn add_izhikevich(model: &mut Model, name: &str, size: u32, a: f64) {
    model
        .add_neuron_population(
            name,
            size,
            models::izhikevich(),
            izhikevich_params(a),
            izhikevich_vars(),
        )
        .unwrap();
}

fn static_pulse_synapse(name: &str, source: &str, target: &str) -> SynapsePopulation {
    let mut wu_vars = BTreeMap::new();
    wu_vars.insert("g".to_string(), VarInit::constant(1.0));
    SynapsePopulation {
        name: name.to_string(),
        matrix_type: SynapseMatrixType::DENSE_INDIVIDUALG,
        delay_steps: 0,
        source: source.to_string(),
        target: target.to_string(),
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
    }
}

#[test]
fn test_duplicate_neuron_group_name_rejected() {
    let mut model = Model::new("test");
    add_izhikevich(&mut model, "Neurons", 10, 0.02);
    let err = model
        .add_neuron_population(
            "Neurons",
            10,
            models::izhikevich(),
            izhikevich_params(0.02),
            izhikevich_vars(),
        )
        .unwrap_err();
    assert!(matches!(err, ModelError::DuplicateName { .. }));
}

#[test]
fn test_unknown_source_population_rejected() {
    let mut model = Model::new("test");
    add_izhikevich(&mut model, "N1", 10, 0.02);
    let err = model
        .add_synapse_population(static_pulse_synapse("S", "Missing", "N1"))
        .unwrap_err();
    assert!(matches!(err, ModelError::UnknownGroup { .. }));
}

#[test]
fn test_missing_var_initialiser_rejected() {
    let mut model = Model::new("test");
    let mut vars = BTreeMap::new();
    vars.insert("V".to_string(), VarInit::constant(-65.0));
    let err = model
        .add_neuron_population("N", 10, models::izhikevich(), izhikevich_params(0.02), vars)
        .unwrap_err();
    assert!(matches!(err, ModelError::IncompatibleInitialiser(_)));
}

#[test]
fn test_frozen_after_finalise() {
    let mut model = Model::new("test");
    add_izhikevich(&mut model, "N0", 10, 0.02);
    model.finalise(1.0).unwrap();

    assert!(matches!(model.set_dt(0.5), Err(ModelError::Frozen)));
    assert!(matches!(
        model
            .add_neuron_population(
                "N1",
                10,
                models::izhikevich(),
                izhikevich_params(0.02),
                izhikevich_vars()
            )
            .unwrap_err(),
        ModelError::Frozen
    ));
}

#[test]
fn test_finalise_idempotent() {
    let mut model = Model::new("test");
    add_izhikevich(&mut model, "N0", 10, 0.02);
    model.finalise(1.0).unwrap();
    let digest = model.hash_digest();
    // Second finalise is a no-op, even with a different dt
    model.finalise(0.5).unwrap();
    assert_eq!(model.hash_digest(), digest);
    assert!((model.dt() - 1.0).abs() < f64::EPSILON);
}

#[test]
fn test_axonal_delay_grows_source_delay_slots() {
    let mut model = Model::new("test");
    add_izhikevich(&mut model, "Pre", 10, 0.02);
    add_izhikevich(&mut model, "Post", 10, 0.02);
    let mut synapse = static_pulse_synapse("S", "Pre", "Post");
    synapse.delay_steps = 3;
    model.add_synapse_population(synapse).unwrap();

    let pre = model.find_neuron_group("Pre").unwrap();
    assert_eq!(model.neuron_group(pre).num_delay_slots(), 4);
    assert!(model.neuron_group(pre).is_delay_required());

    let post = model.find_neuron_group("Post").unwrap();
    assert_eq!(model.neuron_group(post).num_delay_slots(), 1);
}

#[test]
fn test_back_prop_delay_grows_target_delay_slots() {
    let mut model = Model::new("test");
    add_izhikevich(&mut model, "Pre", 10, 0.02);
    add_izhikevich(&mut model, "Post", 10, 0.02);
    let sg = model
        .add_synapse_population(static_pulse_synapse("S", "Pre", "Post"))
        .unwrap();
    model.set_back_prop_delay_steps(sg, 5).unwrap();

    let post = model.find_neuron_group("Post").unwrap();
    assert_eq!(model.neuron_group(post).num_delay_slots(), 6);
}

#[test]
fn test_delay_slots_cover_all_connections() {
    // numDelaySlots >= 1 + max delay over every connected group
    let mut model = Model::new("test");
    add_izhikevich(&mut model, "Pre", 10, 0.02);
    add_izhikevich(&mut model, "PostA", 10, 0.02);
    add_izhikevich(&mut model, "PostB", 10, 0.02);
    let mut a = static_pulse_synapse("SA", "Pre", "PostA");
    a.delay_steps = 2;
    let mut b = static_pulse_synapse("SB", "Pre", "PostB");
    b.delay_steps = 7;
    model.add_synapse_population(a).unwrap();
    model.add_synapse_population(b).unwrap();

    let pre = model.find_neuron_group("Pre").unwrap();
    assert_eq!(model.neuron_group(pre).num_delay_slots(), 8);
}

#[test]
fn test_dense_with_connectivity_snippet_rejected() {
    let mut model = Model::new("test");
    add_izhikevich(&mut model, "Pre", 10, 0.02);
    add_izhikevich(&mut model, "Post", 10, 0.02);
    let mut synapse = static_pulse_synapse("S", "Pre", "Post");
    synapse.connectivity_initialiser = Some(neurogen_model::ConnectivityInit::new(
        models::one_to_one_connectivity(),
        ParamValues::new(),
    )
    .unwrap());
    let err = model.add_synapse_population(synapse).unwrap_err();
    assert!(matches!(err, ModelError::InvalidMatrixType(_)));
}

#[test]
fn test_procedural_forbids_learn_post() {
    use neurogen_model::WeightUpdateModel;
    use std::sync::Arc;

    let mut model = Model::new("test");
    add_izhikevich(&mut model, "Pre", 10, 0.02);
    add_izhikevich(&mut model, "Post", 10, 0.02);

    let wu = Arc::new(WeightUpdateModel {
        name: "LearnPost".into(),
        vars: vec![neurogen_model::Var::new("g", "scalar")],
        sim_code: "addToPost(g);\n".into(),
        learn_post_code: "g = 0.0;\n".into(),
        ..Default::default()
    });
    let mut params = ParamValues::new();
    params.insert("prob".into(), 0.1);
    let mut wu_vars = BTreeMap::new();
    wu_vars.insert("g".to_string(), VarInit::constant(1.0));
    let synapse = SynapsePopulation {
        name: "S".into(),
        matrix_type: SynapseMatrixType::PROCEDURAL_GLOBALG,
        delay_steps: 0,
        source: "Pre".into(),
        target: "Post".into(),
        wu_model: wu,
        wu_params: ParamValues::new(),
        wu_var_initialisers: wu_vars,
        wu_pre_var_initialisers: BTreeMap::new(),
        wu_post_var_initialisers: BTreeMap::new(),
        ps_model: models::delta_curr(),
        ps_params: ParamValues::new(),
        ps_var_initialisers: BTreeMap::new(),
        connectivity_initialiser: Some(
            neurogen_model::ConnectivityInit::new(
                models::fixed_probability_connectivity(),
                params,
            )
            .unwrap(),
        ),
        toeplitz_initialiser: None,
    };
    let err = model.add_synapse_population(synapse).unwrap_err();
    assert!(matches!(err, ModelError::InvalidMatrixType(_)));
}

#[test]
fn test_narrow_sparse_ind_type() {
    let mut model = Model::new("test");
    add_izhikevich(&mut model, "Pre", 10, 0.02);
    add_izhikevich(&mut model, "Small", 200, 0.02);
    add_izhikevich(&mut model, "Large", 300, 0.02);
    model.set_default_narrow_sparse_ind_enabled(true).unwrap();

    let mut small = static_pulse_synapse("SSmall", "Pre", "Small");
    small.matrix_type = SynapseMatrixType::SPARSE_INDIVIDUALG;
    let mut large = static_pulse_synapse("SLarge", "Pre", "Large");
    large.matrix_type = SynapseMatrixType::SPARSE_INDIVIDUALG;
    let small = model.add_synapse_population(small).unwrap();
    let large = model.add_synapse_population(large).unwrap();

    use neurogen_types::NumericType;
    assert_eq!(
        model.synapse_group(small).sparse_ind_type(200),
        NumericType::Uint8
    );
    assert_eq!(
        model.synapse_group(large).sparse_ind_type(300),
        NumericType::Uint16
    );
}

#[test]
fn test_identical_populations_share_hash_digest() {
    let mut model = Model::new("test");
    add_izhikevich(&mut model, "N0", 10, 0.02);
    add_izhikevich(&mut model, "N1", 10, 0.02);
    model.finalise(1.0).unwrap();

    let n0 = model.find_neuron_group("N0").unwrap();
    let n1 = model.find_neuron_group("N1").unwrap();
    assert_eq!(
        model.neuron_group(n0).hash_digest(),
        model.neuron_group(n1).hash_digest()
    );
}

#[test]
fn test_heterogeneous_parameter_keeps_hash_equal() {
    // Parameter values never enter the merge digest; heterogeneous
    // values become runtime fields instead
    let mut model = Model::new("test");
    add_izhikevich(&mut model, "N0", 10, 0.02);
    add_izhikevich(&mut model, "N1", 10, 0.03);
    model.finalise(1.0).unwrap();

    let n0 = model.find_neuron_group("N0").unwrap();
    let n1 = model.find_neuron_group("N1").unwrap();
    assert_eq!(
        model.neuron_group(n0).hash_digest(),
        model.neuron_group(n1).hash_digest()
    );
}

#[test]
fn test_ps_fusion_shares_archetype() {
    let mut model = Model::new("test");
    add_izhikevich(&mut model, "PreA", 10, 0.02);
    add_izhikevich(&mut model, "PreB", 10, 0.02);
    add_izhikevich(&mut model, "Post", 10, 0.02);
    model.set_fuse_postsynaptic_models(true).unwrap();

    let sa = model
        .add_synapse_population(static_pulse_synapse("SA", "PreA", "Post"))
        .unwrap();
    let sb = model
        .add_synapse_population(static_pulse_synapse("SB", "PreB", "Post"))
        .unwrap();
    model.finalise(1.0).unwrap();

    // Equal fuse digests mean both groups share SA's outPost state
    assert_eq!(
        model.synapse_group(sa).ps_fuse_hash_digest(),
        model.synapse_group(sb).ps_fuse_hash_digest()
    );
    assert_eq!(model.synapse_group(sb).fused_ps_target(sb), sa);

    let post = model.find_neuron_group("Post").unwrap();
    assert_eq!(model.neuron_group(post).fused_psm_in_syn(), &[sa]);
}

#[test]
fn test_ps_fusion_disabled_keeps_groups_apart() {
    let mut model = Model::new("test");
    add_izhikevich(&mut model, "PreA", 10, 0.02);
    add_izhikevich(&mut model, "PreB", 10, 0.02);
    add_izhikevich(&mut model, "Post", 10, 0.02);

    let sa = model
        .add_synapse_population(static_pulse_synapse("SA", "PreA", "Post"))
        .unwrap();
    let sb = model
        .add_synapse_population(static_pulse_synapse("SB", "PreB", "Post"))
        .unwrap();
    model.finalise(1.0).unwrap();

    assert_eq!(model.synapse_group(sa).fused_ps_target(sa), sa);
    assert_eq!(model.synapse_group(sb).fused_ps_target(sb), sb);

    let post = model.find_neuron_group("Post").unwrap();
    assert_eq!(model.neuron_group(post).fused_psm_in_syn(), &[sa, sb]);
}

#[test]
fn test_ps_fuse_digest_tracks_referenced_params_only() {
    // ExpCurr's code references its derived parameters, so different
    // tau values must split the fuse digest
    let mut model = Model::new("test");
    add_izhikevich(&mut model, "PreA", 10, 0.02);
    add_izhikevich(&mut model, "PreB", 10, 0.02);
    add_izhikevich(&mut model, "Post", 10, 0.02);

    let mut make = |name: &str, source: &str, tau: f64| {
        let mut synapse = static_pulse_synapse(name, source, "Post");
        synapse.ps_model = models::exp_curr();
        let mut ps_params = ParamValues::new();
        ps_params.insert("tau".into(), tau);
        synapse.ps_params = ps_params;
        model.add_synapse_population(synapse).unwrap()
    };
    let sa = make("SA", "PreA", 5.0);
    let sb = make("SB", "PreB", 10.0);
    model.finalise(1.0).unwrap();

    assert_ne!(
        model.synapse_group(sa).ps_fuse_hash_digest(),
        model.synapse_group(sb).ps_fuse_hash_digest()
    );
}

#[test]
fn test_wu_param_not_referenced_does_not_split_fuse_digest() {
    use neurogen_model::WeightUpdateModel;
    use std::sync::Arc;

    // A weight-update parameter referenced only in per-synapse sim code
    // must not split the *pre* fuse digest
    let wu = Arc::new(WeightUpdateModel {
        name: "PulseWithPre".into(),
        params: vec!["scale".into()],
        pre_vars: vec![neurogen_model::Var::new("preTrace", "scalar")],
        sim_code: "addToPost(scale);\n".into(),
        pre_spike_code: "preTrace += 1.0;\n".into(),
        ..Default::default()
    });

    let mut model = Model::new("test");
    add_izhikevich(&mut model, "Pre", 10, 0.02);
    add_izhikevich(&mut model, "PostA", 10, 0.02);
    add_izhikevich(&mut model, "PostB", 10, 0.02);

    let mut make = |name: &str, target: &str, scale: f64| {
        let mut pre_vars = BTreeMap::new();
        pre_vars.insert("preTrace".to_string(), VarInit::constant(0.0));
        let mut params = ParamValues::new();
        params.insert("scale".into(), scale);
        let synapse = SynapsePopulation {
            name: name.to_string(),
            matrix_type: SynapseMatrixType::DENSE_GLOBALG,
            delay_steps: 0,
            source: "Pre".to_string(),
            target: target.to_string(),
            wu_model: wu.clone(),
            wu_params: params,
            wu_var_initialisers: BTreeMap::new(),
            wu_pre_var_initialisers: pre_vars,
            wu_post_var_initialisers: BTreeMap::new(),
            ps_model: models::delta_curr(),
            ps_params: ParamValues::new(),
            ps_var_initialisers: BTreeMap::new(),
            connectivity_initialiser: None,
            toeplitz_initialiser: None,
        };
        model.add_synapse_population(synapse).unwrap()
    };
    let sa = make("SA", "PostA", 1.0);
    let sb = make("SB", "PostB", 2.0);
    model.finalise(1.0).unwrap();

    // 'scale' is only used in sim code, so presynaptic fusion holds
    assert_eq!(
        model.synapse_group(sa).wu_pre_fuse_hash_digest(),
        model.synapse_group(sb).wu_pre_fuse_hash_digest()
    );
}

#[test]
fn test_dendritic_delay_detection() {
    let mut model = Model::new("test");
    add_izhikevich(&mut model, "Pre", 10, 0.02);
    add_izhikevich(&mut model, "Post", 10, 0.02);

    let mut wu_vars = BTreeMap::new();
    wu_vars.insert("g".to_string(), VarInit::constant(1.0));
    wu_vars.insert("d".to_string(), VarInit::constant(2.0));
    let synapse = SynapsePopulation {
        name: "S".to_string(),
        matrix_type: SynapseMatrixType::DENSE_INDIVIDUALG,
        delay_steps: 0,
        source: "Pre".to_string(),
        target: "Post".to_string(),
        wu_model: models::static_pulse_dendritic_delay(),
        wu_params: ParamValues::new(),
        wu_var_initialisers: wu_vars,
        wu_pre_var_initialisers: BTreeMap::new(),
        wu_post_var_initialisers: BTreeMap::new(),
        ps_model: models::delta_curr(),
        ps_params: ParamValues::new(),
        ps_var_initialisers: BTreeMap::new(),
        connectivity_initialiser: None,
        toeplitz_initialiser: None,
    };
    let sg = model.add_synapse_population(synapse).unwrap();
    assert!(model.synapse_group(sg).is_dendritic_delay_required());
}

#[test]
fn test_var_queue_inference_from_consumer_code() {
    use neurogen_model::WeightUpdateModel;
    use std::sync::Arc;

    let wu = Arc::new(WeightUpdateModel {
        name: "VoltageRead".into(),
        event_threshold_condition_code: "V_pre > -50.0".into(),
        event_code: "addToPost(0.1);\n".into(),
        ..Default::default()
    });

    let mut model = Model::new("test");
    add_izhikevich(&mut model, "Pre", 10, 0.02);
    add_izhikevich(&mut model, "Post", 10, 0.02);
    let synapse = SynapsePopulation {
        name: "S".to_string(),
        matrix_type: SynapseMatrixType::DENSE_GLOBALG,
        delay_steps: 0,
        source: "Pre".to_string(),
        target: "Post".to_string(),
        wu_model: wu,
        wu_params: ParamValues::new(),
        wu_var_initialisers: BTreeMap::new(),
        wu_pre_var_initialisers: BTreeMap::new(),
        wu_post_var_initialisers: BTreeMap::new(),
        ps_model: models::delta_curr(),
        ps_params: ParamValues::new(),
        ps_var_initialisers: BTreeMap::new(),
        connectivity_initialiser: None,
        toeplitz_initialiser: None,
    };
    model.add_synapse_population(synapse).unwrap();
    model.finalise(1.0).unwrap();

    let pre = model.find_neuron_group("Pre").unwrap();
    assert!(model.neuron_group(pre).is_var_queue_required("V"));
    assert!(!model.neuron_group(pre).is_var_queue_required("U"));
    assert!(model.neuron_group(pre).is_spike_event_required());
}

#[test]
fn test_spike_time_inference() {
    use neurogen_model::WeightUpdateModel;
    use std::sync::Arc;

    let wu = Arc::new(WeightUpdateModel {
        name: "Stdp".into(),
        vars: vec![neurogen_model::Var::new("g", "scalar")],
        sim_code: "addToPost(g);\ng += st_post - st_pre;\n".into(),
        learn_post_code: "g += st_pre;\n".into(),
        ..Default::default()
    });

    let mut model = Model::new("test");
    add_izhikevich(&mut model, "Pre", 10, 0.02);
    add_izhikevich(&mut model, "Post", 10, 0.02);
    let mut wu_vars = BTreeMap::new();
    wu_vars.insert("g".to_string(), VarInit::constant(0.5));
    let synapse = SynapsePopulation {
        name: "S".to_string(),
        matrix_type: SynapseMatrixType::SPARSE_INDIVIDUALG,
        delay_steps: 0,
        source: "Pre".to_string(),
        target: "Post".to_string(),
        wu_model: wu,
        wu_params: ParamValues::new(),
        wu_var_initialisers: wu_vars,
        wu_pre_var_initialisers: BTreeMap::new(),
        wu_post_var_initialisers: BTreeMap::new(),
        ps_model: models::delta_curr(),
        ps_params: ParamValues::new(),
        ps_var_initialisers: BTreeMap::new(),
        connectivity_initialiser: None,
        toeplitz_initialiser: None,
    };
    model.add_synapse_population(synapse).unwrap();
    model.finalise(1.0).unwrap();

    let pre = model.find_neuron_group("Pre").unwrap();
    let post = model.find_neuron_group("Post").unwrap();
    assert!(model.neuron_group(pre).is_spike_time_required());
    assert!(model.neuron_group(post).is_spike_time_required());
}

#[test]
fn test_model_digest_stable_across_builds() {
    let build = || {
        let mut model = Model::new("digest");
        add_izhikevich(&mut model, "N0", 10, 0.02);
        add_izhikevich(&mut model, "N1", 10, 0.03);
        model
            .add_synapse_population(static_pulse_synapse("S", "N0", "N1"))
            .unwrap();
        model.finalise(1.0).unwrap();
        model.hash_digest()
    };
    assert_eq!(build(), build());
}

#[test]
fn test_target_var_validation() {
    let mut model = Model::new("test");
    add_izhikevich(&mut model, "Pre", 10, 0.02);
    add_izhikevich(&mut model, "Post", 10, 0.02);
    let sg = model
        .add_synapse_population(static_pulse_synapse("S", "Pre", "Post"))
        .unwrap();

    // Isyn always exists; anything else needs an additional input var
    assert!(model.set_post_target_var(sg, "Isyn").is_ok());
    assert!(matches!(
        model.set_post_target_var(sg, "IsynExc"),
        Err(ModelError::UnknownTargetVariable { .. })
    ));
}
