// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Resolved types: numeric scalars, pointers, functions, with a const
//! qualifier carried alongside the kind.
//!
//! Const-ness doubles as the read-only marker for environment captures:
//! the type checker rejects assignment to any const-typed binding.

use crate::numeric::NumericType;

/// Structural kind of a resolved type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Numeric(NumericType),
    Pointer(Box<ResolvedType>),
    Function {
        ret: Box<ResolvedType>,
        args: Vec<ResolvedType>,
    },
    Void,
}

/// A fully-resolved type as used throughout code generation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedType {
    pub kind: TypeKind,
    pub is_const: bool,
}

impl ResolvedType {
    pub fn numeric(n: NumericType) -> Self {
        Self {
            kind: TypeKind::Numeric(n),
            is_const: false,
        }
    }

    pub fn void() -> Self {
        Self {
            kind: TypeKind::Void,
            is_const: false,
        }
    }

    pub fn function(ret: ResolvedType, args: Vec<ResolvedType>) -> Self {
        Self {
            kind: TypeKind::Function {
                ret: Box::new(ret),
                args,
            },
            is_const: false,
        }
    }

    /// Pointer to this type
    pub fn create_pointer(&self) -> Self {
        Self {
            kind: TypeKind::Pointer(Box::new(self.clone())),
            is_const: false,
        }
    }

    /// Same type with the const qualifier added
    pub fn add_const(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            is_const: true,
        }
    }

    /// Same type with the const qualifier removed
    pub fn remove_const(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            is_const: false,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.kind, TypeKind::Numeric(_))
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.kind, TypeKind::Pointer(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self.kind, TypeKind::Function { .. })
    }

    pub fn numeric_value(&self) -> Option<NumericType> {
        match self.kind {
            TypeKind::Numeric(n) => Some(n),
            _ => None,
        }
    }

    /// Element type of a pointer
    pub fn pointee(&self) -> Option<&ResolvedType> {
        match &self.kind {
            TypeKind::Pointer(inner) => Some(inner),
            _ => None,
        }
    }

    /// Spelling of this type in generated source
    pub fn name(&self) -> String {
        let base = match &self.kind {
            TypeKind::Numeric(n) => n.name().to_string(),
            TypeKind::Pointer(inner) => format!("{}*", inner.name()),
            TypeKind::Function { ret, args } => {
                let args: Vec<String> = args.iter().map(|a| a.name()).collect();
                format!("{}({})", ret.name(), args.join(", "))
            }
            TypeKind::Void => "void".to_string(),
        };
        if self.is_const {
            format!("const {}", base)
        } else {
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_name() {
        let ty = ResolvedType::numeric(NumericType::Float).create_pointer();
        assert_eq!(ty.name(), "float*");
        assert_eq!(
            ty.pointee().unwrap(),
            &ResolvedType::numeric(NumericType::Float)
        );
    }

    #[test]
    fn test_const_qualifier() {
        let ty = ResolvedType::numeric(NumericType::Double).add_const();
        assert_eq!(ty.name(), "const double");
        assert!(ty.is_const);
        assert!(!ty.remove_const().is_const);
    }

    #[test]
    fn test_function_type() {
        let f = ResolvedType::function(
            ResolvedType::numeric(NumericType::Float),
            vec![ResolvedType::numeric(NumericType::Float)],
        );
        assert!(f.is_function());
        assert_eq!(f.name(), "float(float)");
    }
}
