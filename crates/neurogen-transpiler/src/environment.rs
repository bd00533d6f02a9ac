// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Environment interface seen by the type checker and pretty printer.
//!
//! The concrete layered environments (merged-group fields, local-var
//! caches) live in the code generator; the transpiler only needs name
//! lookup. A lookup takes `&mut self` so implementations can record
//! which bindings a fragment actually uses - that usage set drives
//! deferred initialiser emission and local-variable caching.

use ahash::AHashMap;
use neurogen_types::{NumericType, ResolvedType, TypeContext};

/// A resolved environment binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvSymbol {
    pub ty: ResolvedType,
    /// Expansion written in place of the identifier. May reference other
    /// environment names as `$(name)`. For function symbols, either a
    /// template containing positional placeholders `$(0)`, `$(1)`, ...
    /// or a bare callee name.
    pub expansion: String,
}

/// Name table consulted during type checking and pretty printing.
/// Resolution is inner-first; an unresolved name is a diagnostic.
pub trait Environment {
    fn lookup(&mut self, name: &str) -> Option<EnvSymbol>;
}

/// Block-scoped fragment-local declarations, shared by the type checker
/// and pretty printer so locals shadow environment names consistently.
#[derive(Debug, Default)]
pub struct LocalScopes {
    scopes: Vec<AHashMap<String, ResolvedType>>,
}

impl LocalScopes {
    pub fn new() -> Self {
        Self {
            scopes: vec![AHashMap::new()],
        }
    }

    pub fn push(&mut self) {
        self.scopes.push(AHashMap::new());
    }

    pub fn pop(&mut self) {
        self.scopes.pop();
    }

    pub fn define(&mut self, name: &str, ty: ResolvedType) -> bool {
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .insert(name.to_string(), ty)
            .is_none()
    }

    pub fn lookup(&self, name: &str) -> Option<&ResolvedType> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }
}

/// The functions model code may call without declaring them: the usual
/// single- and two-argument math set, typed over `scalar`.
pub fn standard_library(ctx: &TypeContext) -> Vec<(String, EnvSymbol)> {
    let scalar = ctx.scalar_type();
    let unary = ResolvedType::function(scalar.clone(), vec![scalar.clone()]);
    let binary = ResolvedType::function(scalar.clone(), vec![scalar.clone(), scalar.clone()]);
    let mut lib = Vec::new();
    for name in [
        "exp", "log", "log2", "sqrt", "cbrt", "sin", "cos", "tan", "sinh", "cosh", "tanh",
        "asin", "acos", "atan", "fabs", "floor", "ceil", "round",
    ] {
        lib.push((
            name.to_string(),
            EnvSymbol {
                ty: unary.clone(),
                expansion: name.to_string(),
            },
        ));
    }
    for name in ["pow", "fmod", "fmin", "fmax", "atan2", "hypot"] {
        lib.push((
            name.to_string(),
            EnvSymbol {
                ty: binary.clone(),
                expansion: name.to_string(),
            },
        ));
    }
    // Integer helpers used by connectivity-building code
    let uint = ResolvedType::numeric(NumericType::Uint32);
    lib.push((
        "min".to_string(),
        EnvSymbol {
            ty: binary.clone(),
            expansion: "fmin".to_string(),
        },
    ));
    lib.push((
        "max".to_string(),
        EnvSymbol {
            ty: binary,
            expansion: "fmax".to_string(),
        },
    ));
    lib.push((
        "clz".to_string(),
        EnvSymbol {
            ty: ResolvedType::function(uint.clone(), vec![uint]),
            expansion: "clz".to_string(),
        },
    ));
    lib
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_scopes_shadowing() {
        let mut locals = LocalScopes::new();
        let float = ResolvedType::numeric(NumericType::Float);
        let int = ResolvedType::numeric(NumericType::Int32);
        assert!(locals.define("x", float.clone()));
        locals.push();
        assert!(locals.define("x", int.clone()));
        assert_eq!(locals.lookup("x"), Some(&int));
        locals.pop();
        assert_eq!(locals.lookup("x"), Some(&float));
    }

    #[test]
    fn test_duplicate_definition_detected() {
        let mut locals = LocalScopes::new();
        let float = ResolvedType::numeric(NumericType::Float);
        assert!(locals.define("x", float.clone()));
        assert!(!locals.define("x", float));
    }

    #[test]
    fn test_standard_library_contains_math() {
        let ctx = TypeContext::default();
        let lib = standard_library(&ctx);
        assert!(lib.iter().any(|(n, _)| n == "exp"));
        assert!(lib.iter().any(|(n, s)| n == "pow" && s.ty.is_function()));
    }
}
