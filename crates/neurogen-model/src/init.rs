// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Initialiser bindings: a snippet plus concrete parameter values,
//! with the snippet code scanned into tokens at construction.

use crate::fragment::CodeFragment;
use crate::hash::{HashBuilder, HashDigest};
use crate::snippet::{
    check_param_values as check_params, ParamValues, SparseConnectivitySnippet,
    ToeplitzConnectivitySnippet, VarInitSnippet,
};
use crate::Result;
use std::sync::Arc;

/// Everything needed to initialise one state variable: a snippet, its
/// parameters, and the scanned code tokens
#[derive(Debug, Clone)]
pub struct VarInit {
    snippet: Arc<VarInitSnippet>,
    params: ParamValues,
    derived_params: ParamValues,
    code: CodeFragment,
}

impl VarInit {
    pub fn new(snippet: Arc<VarInitSnippet>, params: ParamValues) -> Result<Self> {
        check_params(&snippet.name, &snippet.params, &params)?;
        let context = format!("Variable initialisation snippet '{}'", snippet.name);
        let code = CodeFragment::scan(&snippet.code, &context)?;
        Ok(Self {
            snippet,
            params,
            derived_params: ParamValues::new(),
            code,
        })
    }

    /// Shorthand for the ubiquitous constant initialiser
    pub fn constant(value: f64) -> Self {
        let snippet = crate::models::constant_var_init();
        let mut params = ParamValues::new();
        params.insert("constant".to_string(), value);
        Self::new(snippet, params).expect("constant initialiser always scans")
    }

    pub fn snippet(&self) -> &VarInitSnippet {
        &self.snippet
    }

    pub fn params(&self) -> &ParamValues {
        &self.params
    }

    pub fn derived_params(&self) -> &ParamValues {
        &self.derived_params
    }

    pub fn code(&self) -> &CodeFragment {
        &self.code
    }

    /// If this is a constant initialiser, its value
    pub fn constant_value(&self) -> Option<f64> {
        if self.snippet.name == "Constant" {
            self.params.get("constant").copied()
        } else {
            None
        }
    }

    pub fn is_rng_required(&self) -> bool {
        self.code.is_rng_required()
    }

    /// True when the snippet indexes into a kernel
    pub fn requires_kernel(&self) -> bool {
        self.code.references("id_kernel")
    }

    /// True when device initialisation code must run for this variable
    pub fn is_code_required(&self) -> bool {
        !self.code.is_empty() && !self.requires_kernel()
    }

    pub(crate) fn finalise(&mut self, dt: f64) {
        self.derived_params = self
            .snippet
            .derived_params
            .iter()
            .map(|d| (d.name.clone(), (d.func)(&self.params, dt)))
            .collect();
    }

    /// Structural digest: snippet shape only, never parameter values.
    /// Heterogeneous parameter values become runtime fields instead.
    pub fn hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("var-init");
        hash.update_digest(&self.snippet.hash_digest());
        hash.finalise()
    }
}

/// Sparse / bitmask / procedural connectivity initialiser binding
#[derive(Debug, Clone)]
pub struct ConnectivityInit {
    snippet: Arc<SparseConnectivitySnippet>,
    params: ParamValues,
    derived_params: ParamValues,
    row_build: CodeFragment,
    col_build: CodeFragment,
}

impl ConnectivityInit {
    pub fn new(snippet: Arc<SparseConnectivitySnippet>, params: ParamValues) -> Result<Self> {
        check_params(&snippet.name, &snippet.params, &params)?;
        let row_context = format!("Connectivity snippet '{}' row build code", snippet.name);
        let col_context = format!("Connectivity snippet '{}' column build code", snippet.name);
        let row_build = CodeFragment::scan(&snippet.row_build_code, &row_context)?;
        let col_build = CodeFragment::scan(&snippet.col_build_code, &col_context)?;
        Ok(Self {
            snippet,
            params,
            derived_params: ParamValues::new(),
            row_build,
            col_build,
        })
    }

    /// Connectivity left for the user to upload before `initializeSparse`
    pub fn uninitialised() -> Self {
        Self::new(crate::models::uninitialised_connectivity(), ParamValues::new())
            .expect("uninitialised connectivity always scans")
    }

    pub fn snippet(&self) -> &SparseConnectivitySnippet {
        &self.snippet
    }

    pub fn params(&self) -> &ParamValues {
        &self.params
    }

    pub fn derived_params(&self) -> &ParamValues {
        &self.derived_params
    }

    pub fn row_build(&self) -> &CodeFragment {
        &self.row_build
    }

    pub fn col_build(&self) -> &CodeFragment {
        &self.col_build
    }

    pub fn has_build_code(&self) -> bool {
        !self.row_build.is_empty() || !self.col_build.is_empty()
    }

    pub fn calc_max_row_length(&self, num_pre: u32, num_post: u32) -> Option<u32> {
        self.snippet
            .calc_max_row_length
            .as_ref()
            .map(|f| f(num_pre, num_post, &self.params))
    }

    pub fn calc_max_col_length(&self, num_pre: u32, num_post: u32) -> Option<u32> {
        self.snippet
            .calc_max_col_length
            .as_ref()
            .map(|f| f(num_pre, num_post, &self.params))
    }

    pub fn calc_kernel_size(&self) -> Option<Vec<u32>> {
        self.snippet.calc_kernel_size.as_ref().map(|f| f(&self.params))
    }

    pub(crate) fn finalise(&mut self, dt: f64) {
        self.derived_params = self
            .snippet
            .derived_params
            .iter()
            .map(|d| (d.name.clone(), (d.func)(&self.params, dt)))
            .collect();
    }

    pub fn hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("connectivity-init");
        hash.update_digest(&self.snippet.hash_digest());
        hash.finalise()
    }
}

/// Toeplitz connectivity initialiser binding
#[derive(Debug, Clone)]
pub struct ToeplitzInit {
    snippet: Arc<ToeplitzConnectivitySnippet>,
    params: ParamValues,
    derived_params: ParamValues,
    diagonal_build: CodeFragment,
}

impl ToeplitzInit {
    pub fn new(snippet: Arc<ToeplitzConnectivitySnippet>, params: ParamValues) -> Result<Self> {
        check_params(&snippet.name, &snippet.params, &params)?;
        let context = format!(
            "Toeplitz connectivity snippet '{}' diagonal build code",
            snippet.name
        );
        let diagonal_build = CodeFragment::scan(&snippet.diagonal_build_code, &context)?;
        Ok(Self {
            snippet,
            params,
            derived_params: ParamValues::new(),
            diagonal_build,
        })
    }

    pub fn snippet(&self) -> &ToeplitzConnectivitySnippet {
        &self.snippet
    }

    pub fn params(&self) -> &ParamValues {
        &self.params
    }

    pub fn derived_params(&self) -> &ParamValues {
        &self.derived_params
    }

    pub fn diagonal_build(&self) -> &CodeFragment {
        &self.diagonal_build
    }

    pub fn calc_max_row_length(&self, num_pre: u32, num_post: u32) -> Option<u32> {
        self.snippet
            .calc_max_row_length
            .as_ref()
            .map(|f| f(num_pre, num_post, &self.params))
    }

    pub fn calc_kernel_size(&self) -> Option<Vec<u32>> {
        self.snippet.calc_kernel_size.as_ref().map(|f| f(&self.params))
    }

    pub(crate) fn finalise(&mut self, dt: f64) {
        self.derived_params = self
            .snippet
            .derived_params
            .iter()
            .map(|d| (d.name.clone(), (d.func)(&self.params, dt)))
            .collect();
    }

    pub fn hash_digest(&self) -> HashDigest {
        let mut hash = HashBuilder::new("toeplitz-init");
        hash.update_digest(&self.snippet.hash_digest());
        hash.finalise()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModelError;

    #[test]
    fn test_constant_initialiser() {
        let init = VarInit::constant(1.5);
        assert_eq!(init.constant_value(), Some(1.5));
        assert!(!init.is_rng_required());
        assert!(init.is_code_required());
    }

    #[test]
    fn test_missing_parameter_rejected() {
        let snippet = crate::models::uniform_var_init();
        let err = VarInit::new(snippet, ParamValues::new()).unwrap_err();
        assert!(matches!(err, ModelError::MissingParameter { .. }));
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let mut params = ParamValues::new();
        params.insert("constant".into(), 1.0);
        params.insert("bogus".into(), 2.0);
        let err = VarInit::new(crate::models::constant_var_init(), params).unwrap_err();
        assert!(matches!(err, ModelError::UnknownParameter { .. }));
    }

    #[test]
    fn test_uniform_requires_rng() {
        let mut params = ParamValues::new();
        params.insert("min".into(), 0.0);
        params.insert("max".into(), 1.0);
        let init = VarInit::new(crate::models::uniform_var_init(), params).unwrap();
        assert!(init.is_rng_required());
        assert_eq!(init.constant_value(), None);
    }

    #[test]
    fn test_derived_params_evaluated_at_finalise() {
        let mut params = ParamValues::new();
        params.insert("constant".into(), 2.0);
        let mut init = VarInit::new(crate::models::constant_var_init(), params).unwrap();
        init.finalise(0.1);
        // Constant has no derived params; map stays empty but finalise runs
        assert!(init.derived_params().is_empty());
    }
}
