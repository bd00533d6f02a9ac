// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Stock model library.
//!
//! The snippets every model ends up reaching for: classic neuron
//! models, pulse/graded weight updates, current-shape postsynaptic
//! models, constant/random variable initialisers and the common
//! connectivity builders. Each constructor returns a fresh `Arc`;
//! registration in a [`crate::SnippetRegistry`] is explicit.

use crate::snippet::*;
use crate::var_access::VarAccess;
use std::sync::Arc;

// ---------------------------------------------------------------------
// Neuron models
// ---------------------------------------------------------------------

/// Izhikevich model with the classic two-variable dynamics, integrated
/// with two half steps for V
pub fn izhikevich() -> Arc<NeuronModel> {
    Arc::new(NeuronModel {
        name: "Izhikevich".into(),
        params: vec!["a".into(), "b".into(), "c".into(), "d".into()],
        vars: vec![Var::new("V", "scalar"), Var::new("U", "scalar")],
        sim_code: "\
if (V >= 30.0) {\n\
    V = c;\n\
    U += d;\n\
}\n\
V += 0.5 * (0.04 * V * V + 5.0 * V + 140.0 - U + Isyn) * dt;\n\
V += 0.5 * (0.04 * V * V + 5.0 * V + 140.0 - U + Isyn) * dt;\n\
U += a * (b * V - U) * dt;\n"
            .into(),
        threshold_condition_code: "V >= 29.99".into(),
        ..Default::default()
    })
}

/// Leaky integrate-and-fire with refractory period
pub fn lif() -> Arc<NeuronModel> {
    Arc::new(NeuronModel {
        name: "LIF".into(),
        params: vec![
            "C".into(),
            "TauM".into(),
            "Vrest".into(),
            "Vreset".into(),
            "Vthresh".into(),
            "Ioffset".into(),
            "TauRefrac".into(),
        ],
        derived_params: vec![
            DerivedParam::new("ExpTC", |p, dt| (-dt / p["TauM"]).exp()),
            DerivedParam::new("Rmembrane", |p, _| p["TauM"] / p["C"]),
        ],
        vars: vec![Var::new("V", "scalar"), Var::new("RefracTime", "scalar")],
        sim_code: "\
if (RefracTime <= 0.0) {\n\
    scalar alpha = ((Isyn + Ioffset) * Rmembrane) + Vrest;\n\
    V = alpha - (ExpTC * (alpha - V));\n\
}\n\
else {\n\
    RefracTime -= dt;\n\
}\n"
            .into(),
        threshold_condition_code: "RefracTime <= 0.0 && V >= Vthresh".into(),
        reset_code: "V = Vreset;\nRefracTime = TauRefrac;\n".into(),
        ..Default::default()
    })
}

/// Empty neuron whose spikes are driven entirely from the host
pub fn spike_source() -> Arc<NeuronModel> {
    Arc::new(NeuronModel {
        name: "SpikeSource".into(),
        threshold_condition_code: "0".into(),
        ..Default::default()
    })
}

// ---------------------------------------------------------------------
// Weight update models
// ---------------------------------------------------------------------

/// Fixed-weight pulse on presynaptic spike
pub fn static_pulse() -> Arc<WeightUpdateModel> {
    Arc::new(WeightUpdateModel {
        name: "StaticPulse".into(),
        vars: vec![Var::with_access("g", "scalar", VarAccess::ReadOnly)],
        sim_code: "addToPost(g);\n".into(),
        ..Default::default()
    })
}

/// Fixed-weight pulse routed through the dendritic delay buffer
pub fn static_pulse_dendritic_delay() -> Arc<WeightUpdateModel> {
    Arc::new(WeightUpdateModel {
        name: "StaticPulseDendriticDelay".into(),
        vars: vec![
            Var::with_access("g", "scalar", VarAccess::ReadOnly),
            Var::with_access("d", "uint8_t", VarAccess::ReadOnly),
        ],
        sim_code: "addToPostDelay(g, d);\n".into(),
        ..Default::default()
    })
}

/// Graded transmission gated by a presynaptic threshold event
pub fn static_graded() -> Arc<WeightUpdateModel> {
    Arc::new(WeightUpdateModel {
        name: "StaticGraded".into(),
        params: vec!["Epre".into(), "Vslope".into()],
        vars: vec![Var::with_access("g", "scalar", VarAccess::ReadOnly)],
        event_threshold_condition_code: "V_pre > Epre".into(),
        event_code: "addToPost(fmax(0.0, g * tanh((V_pre - Epre) / Vslope) * dt));\n".into(),
        ..Default::default()
    })
}

// ---------------------------------------------------------------------
// Postsynaptic models
// ---------------------------------------------------------------------

/// Delta current: the accumulated input is applied once and cleared
pub fn delta_curr() -> Arc<PostsynapticModel> {
    Arc::new(PostsynapticModel {
        name: "DeltaCurr".into(),
        apply_input_code: "Isyn += inSyn;\n".into(),
        decay_code: "inSyn = 0;\n".into(),
        ..Default::default()
    })
}

/// Exponentially-decaying current
pub fn exp_curr() -> Arc<PostsynapticModel> {
    Arc::new(PostsynapticModel {
        name: "ExpCurr".into(),
        params: vec!["tau".into()],
        derived_params: vec![
            DerivedParam::new("expDecay", |p, dt| (-dt / p["tau"]).exp()),
            DerivedParam::new("init", |p, dt| {
                (p["tau"] * (1.0 - (-dt / p["tau"]).exp())) * (1.0 / dt)
            }),
        ],
        apply_input_code: "Isyn += init * inSyn;\n".into(),
        decay_code: "inSyn *= expDecay;\n".into(),
        ..Default::default()
    })
}

/// Alpha-shaped current with internal state
pub fn alpha_curr() -> Arc<PostsynapticModel> {
    Arc::new(PostsynapticModel {
        name: "AlphaCurr".into(),
        params: vec!["tau".into()],
        derived_params: vec![
            DerivedParam::new("expDecay", |p, dt| (-dt / p["tau"]).exp()),
            DerivedParam::new("init", |p, _| std::f64::consts::E / p["tau"]),
        ],
        vars: vec![Var::new("x", "scalar")],
        apply_input_code: "Isyn += x;\n".into(),
        decay_code: "\
x = (dt * expDecay * inSyn * init) + (expDecay * x);\n\
inSyn *= expDecay;\n"
            .into(),
        ..Default::default()
    })
}

// ---------------------------------------------------------------------
// Current source models
// ---------------------------------------------------------------------

/// Constant current injection
pub fn dc_source() -> Arc<CurrentSourceModel> {
    Arc::new(CurrentSourceModel {
        name: "DC".into(),
        params: vec!["amp".into()],
        injection_code: "injectCurrent(amp);\n".into(),
        ..Default::default()
    })
}

/// Per-neuron Gaussian noise current
pub fn gaussian_noise_source() -> Arc<CurrentSourceModel> {
    Arc::new(CurrentSourceModel {
        name: "GaussianNoise".into(),
        params: vec!["mean".into(), "sd".into()],
        injection_code: "injectCurrent(mean + (randNormal() * sd));\n".into(),
        ..Default::default()
    })
}

// ---------------------------------------------------------------------
// Variable initialisation snippets
// ---------------------------------------------------------------------

/// Every variable initialised to the same constant
pub fn constant_var_init() -> Arc<VarInitSnippet> {
    Arc::new(VarInitSnippet {
        name: "Constant".into(),
        params: vec!["constant".into()],
        code: "value = constant;\n".into(),
        ..Default::default()
    })
}

/// No generated initialisation; the host uploads the values before
/// `initializeSparse`
pub fn uninitialised_var_init() -> Arc<VarInitSnippet> {
    Arc::new(VarInitSnippet {
        name: "Uninitialised".into(),
        ..Default::default()
    })
}

/// Uniformly-distributed initial values
pub fn uniform_var_init() -> Arc<VarInitSnippet> {
    Arc::new(VarInitSnippet {
        name: "Uniform".into(),
        params: vec!["min".into(), "max".into()],
        code: "value = min + (randUniform() * (max - min));\n".into(),
        ..Default::default()
    })
}

/// Normally-distributed initial values
pub fn normal_var_init() -> Arc<VarInitSnippet> {
    Arc::new(VarInitSnippet {
        name: "Normal".into(),
        params: vec!["mean".into(), "sd".into()],
        code: "value = mean + (randNormal() * sd);\n".into(),
        ..Default::default()
    })
}

/// Values drawn from a shared kernel array indexed by kernel position
pub fn kernel_var_init() -> Arc<VarInitSnippet> {
    Arc::new(VarInitSnippet {
        name: "Kernel".into(),
        extra_global_params: vec![ExtraGlobalParam {
            name: "kernel".into(),
            ty: "scalar".into(),
        }],
        code: "value = kernel[id_kernel];\n".into(),
        ..Default::default()
    })
}

// ---------------------------------------------------------------------
// Sparse connectivity snippets
// ---------------------------------------------------------------------

/// Connectivity left entirely to the user
pub fn uninitialised_connectivity() -> Arc<SparseConnectivitySnippet> {
    Arc::new(SparseConnectivitySnippet {
        name: "Uninitialised".into(),
        ..Default::default()
    })
}

/// Each source neuron connects to the matching target neuron
pub fn one_to_one_connectivity() -> Arc<SparseConnectivitySnippet> {
    Arc::new(SparseConnectivitySnippet {
        name: "OneToOne".into(),
        row_build_code: "addSynapse(id_pre);\n".into(),
        calc_max_row_length: Some(Arc::new(|_, _, _| 1)),
        calc_max_col_length: Some(Arc::new(|_, _, _| 1)),
        ..Default::default()
    })
}

/// Bernoulli connectivity, built with geometric row-skipping so cost is
/// proportional to the number of synapses rather than pairs
pub fn fixed_probability_connectivity() -> Arc<SparseConnectivitySnippet> {
    Arc::new(SparseConnectivitySnippet {
        name: "FixedProbability".into(),
        params: vec!["prob".into()],
        derived_params: vec![DerivedParam::new("probLogRecip", |p, _| {
            1.0 / (1.0 - p["prob"]).ln()
        })],
        row_build_code: "\
int prevJ = -1;\n\
while (true) {\n\
    const scalar u = randUniform();\n\
    prevJ += 1 + (int)(log(u) * probLogRecip);\n\
    if (prevJ < num_post) {\n\
        addSynapse(prevJ);\n\
    }\n\
    else {\n\
        break;\n\
    }\n\
}\n"
        .into(),
        calc_max_row_length: Some(Arc::new(|num_pre, num_post, p| {
            binomial_inverse_cdf_bound(num_pre, num_post, p["prob"])
        })),
        calc_max_col_length: Some(Arc::new(|num_pre, num_post, p| {
            binomial_inverse_cdf_bound(num_post, num_pre, p["prob"])
        })),
        ..Default::default()
    })
}

/// A fixed number of targets per row, sampled with replacement
pub fn fixed_number_post_connectivity() -> Arc<SparseConnectivitySnippet> {
    Arc::new(SparseConnectivitySnippet {
        name: "FixedNumberPostWithReplacement".into(),
        params: vec!["num".into()],
        row_build_code: "\
for (unsigned int c = 0; c < num; c++) {\n\
    const unsigned int j = randUniform() * num_post;\n\
    addSynapse(j);\n\
}\n"
        .into(),
        calc_max_row_length: Some(Arc::new(|_, _, p| p["num"] as u32)),
        ..Default::default()
    })
}

/// Loose binomial upper bound on row occupancy at probability `p` over
/// `n` trials; a union bound across rows keeps overflow probability
/// negligible for any practical population count
fn binomial_inverse_cdf_bound(rows: u32, n: u32, p: f64) -> u32 {
    if p >= 1.0 {
        return n;
    }
    if p <= 0.0 || n == 0 {
        return 0;
    }
    let n_f = n as f64;
    let mean = n_f * p;
    let var = n_f * p * (1.0 - p);
    // Tail width grows with the log of the number of rows drawn
    let tail = (2.0 * var * (rows.max(2) as f64).ln().max(1.0)).sqrt() + 1.0;
    (mean + 3.0 * tail).ceil().min(n_f) as u32
}

// ---------------------------------------------------------------------
// Toeplitz connectivity snippets
// ---------------------------------------------------------------------

/// Single-channel same-padding 2D convolution expressed as Toeplitz
/// connectivity over a kernel
pub fn conv2d_toeplitz() -> Arc<ToeplitzConnectivitySnippet> {
    Arc::new(ToeplitzConnectivitySnippet {
        name: "Conv2D".into(),
        params: vec![
            "kern_h".into(),
            "kern_w".into(),
            "in_h".into(),
            "in_w".into(),
        ],
        derived_params: vec![
            DerivedParam::new("pad_h", |p, _| ((p["kern_h"] - 1.0) / 2.0).floor()),
            DerivedParam::new("pad_w", |p, _| ((p["kern_w"] - 1.0) / 2.0).floor()),
        ],
        diagonal_build_code: "\
const int kernRow = id_diag / kern_w;\n\
const int kernCol = id_diag % kern_w;\n\
const int inRow = id_pre / in_w;\n\
const int inCol = id_pre % in_w;\n\
const int outRow = inRow + pad_h - kernRow;\n\
const int outCol = inCol + pad_w - kernCol;\n\
if (outRow >= 0 && outRow < in_h && outCol >= 0 && outCol < in_w) {\n\
    addSynapse((outRow * in_w) + outCol, kernRow, kernCol);\n\
}\n"
        .into(),
        calc_max_row_length: Some(Arc::new(|_, _, p| {
            (p["kern_h"] * p["kern_w"]) as u32
        })),
        calc_kernel_size: Some(Arc::new(|p| {
            vec![p["kern_h"] as u32, p["kern_w"] as u32]
        })),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snippet::ParamValues;

    #[test]
    fn test_builtin_models_validate() {
        assert!(izhikevich().validate().is_ok());
        assert!(lif().validate().is_ok());
        assert!(static_pulse().validate().is_ok());
        assert!(delta_curr().validate().is_ok());
        assert!(alpha_curr().validate().is_ok());
        assert!(dc_source().validate().is_ok());
    }

    #[test]
    fn test_lif_derived_params() {
        let model = lif();
        let mut params = ParamValues::new();
        for (name, value) in [
            ("C", 1.0),
            ("TauM", 20.0),
            ("Vrest", -70.0),
            ("Vreset", -70.0),
            ("Vthresh", -50.0),
            ("Ioffset", 0.0),
            ("TauRefrac", 2.0),
        ] {
            params.insert(name.into(), value);
        }
        let exp_tc = model
            .derived_params
            .iter()
            .find(|d| d.name == "ExpTC")
            .unwrap();
        let value = (exp_tc.func)(&params, 1.0);
        assert!((value - (-1.0f64 / 20.0).exp()).abs() < 1.0e-12);
    }

    #[test]
    fn test_one_to_one_row_length() {
        let snippet = one_to_one_connectivity();
        let f = snippet.calc_max_row_length.as_ref().unwrap();
        assert_eq!(f(100, 100, &ParamValues::new()), 1);
    }

    #[test]
    fn test_fixed_probability_row_bound_sane() {
        let snippet = fixed_probability_connectivity();
        let f = snippet.calc_max_row_length.as_ref().unwrap();
        let mut params = ParamValues::new();
        params.insert("prob".into(), 0.1);
        let bound = f(1000, 1000, &params);
        // Must exceed the mean but never the population size
        assert!(bound > 100);
        assert!(bound <= 1000);
    }

    #[test]
    fn test_conv2d_kernel_size() {
        let snippet = conv2d_toeplitz();
        let mut params = ParamValues::new();
        params.insert("kern_h".into(), 3.0);
        params.insert("kern_w".into(), 3.0);
        params.insert("in_h".into(), 32.0);
        params.insert("in_w".into(), 32.0);
        let f = snippet.calc_kernel_size.as_ref().unwrap();
        assert_eq!(f(&params), vec![3, 3]);
    }
}
