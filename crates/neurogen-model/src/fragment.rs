// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Code fragments: user model code scanned once at IR construction.

use crate::hash::HashBuilder;
use crate::Result;
use neurogen_transpiler::{references_identifier, scan, tokens_empty, Token};

/// A user code fragment and its token stream.
///
/// Scanning happens exactly once, when the fragment enters the IR; a
/// scan failure surfaces immediately with the fragment's context.
/// Downstream components only ever see the tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeFragment {
    source: String,
    tokens: Vec<Token>,
}

impl CodeFragment {
    pub fn scan(source: &str, context: &str) -> Result<Self> {
        let tokens = scan(source, context)?;
        Ok(Self {
            source: source.to_string(),
            tokens,
        })
    }

    pub fn empty() -> Self {
        Self::scan("", "empty").expect("scanning the empty fragment cannot fail")
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_empty(&self) -> bool {
        tokens_empty(&self.tokens)
    }

    /// Identifier-reference query; the one raw inspection downstream
    /// components perform on token streams
    pub fn references(&self, identifier: &str) -> bool {
        references_identifier(&self.tokens, identifier)
    }

    /// Does this fragment draw from the per-element RNG?
    pub fn is_rng_required(&self) -> bool {
        const RNG_FUNCTIONS: &[&str] = &[
            "randUniform",
            "randNormal",
            "randExponential",
            "randLogNormal",
            "randGamma",
            "randBinomial",
        ];
        RNG_FUNCTIONS.iter().any(|f| self.references(f))
    }

    pub(crate) fn update_hash(&self, hash: &mut HashBuilder) {
        hash.update_str(&self.source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_once_and_query() {
        let frag = CodeFragment::scan("V += Isyn * g_pre;", "test").unwrap();
        assert!(!frag.is_empty());
        assert!(frag.references("g_pre"));
        assert!(!frag.references("g"));
    }

    #[test]
    fn test_empty_fragment() {
        assert!(CodeFragment::empty().is_empty());
    }

    #[test]
    fn test_rng_detection() {
        let frag = CodeFragment::scan("value = randUniform() * scale;", "test").unwrap();
        assert!(frag.is_rng_required());
        let plain = CodeFragment::scan("value = scale;", "test").unwrap();
        assert!(!plain.is_rng_required());
    }

    #[test]
    fn test_scan_error_carries_context() {
        let err = CodeFragment::scan("$(", "Neuron group 'N' sim code").unwrap_err();
        assert!(err.to_string().contains("Neuron group 'N' sim code"));
    }
}
