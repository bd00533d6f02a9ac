// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # Neurogen Type System
//!
//! Resolved types for the code-generation pipeline: numeric types with
//! limits, pointer and const wrappers, and the type context which binds
//! the model-level precision policy (`scalar` / `timepoint`) to concrete
//! numeric types.
//!
//! Model code fragments name types symbolically (`"scalar"`, `"unsigned
//! int"`); everything downstream of the model IR works with
//! [`ResolvedType`] obtained through a [`TypeContext`].

pub mod numeric;
pub mod resolved;

pub use numeric::NumericType;
pub use resolved::{ResolvedType, TypeKind};

use thiserror::Error;

/// Errors raised while resolving symbolic type names
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("Unknown type name '{0}'")]
    UnknownTypeName(String),

    #[error("Type '{0}' is not numeric")]
    NotNumeric(String),
}

pub type Result<T> = std::result::Result<T, TypeError>;

/// Floating point precision used for `scalar` typed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScalarPrecision {
    #[default]
    Float,
    Double,
    LongDouble,
}

impl ScalarPrecision {
    pub fn numeric_type(self) -> NumericType {
        match self {
            ScalarPrecision::Float => NumericType::Float,
            ScalarPrecision::Double => NumericType::Double,
            ScalarPrecision::LongDouble => NumericType::LongDouble,
        }
    }
}

/// Precision used for time-valued state (`t`, spike times)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TimePrecision {
    /// Time uses the model's scalar precision
    #[default]
    Default,
    /// Single precision - not suitable for long simulations
    Float,
    /// Double precision - may reduce performance on some devices
    Double,
}

/// Binds the model's precision policy to concrete numeric types and
/// resolves the symbolic type names permitted in model code.
///
/// The context is built once per generation pass from the model's
/// configured precisions and threaded explicitly through the transpiler
/// and emitters; there is no global type state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeContext {
    scalar: NumericType,
    time: NumericType,
}

impl TypeContext {
    pub fn new(precision: ScalarPrecision, time_precision: TimePrecision) -> Self {
        let scalar = precision.numeric_type();
        let time = match time_precision {
            TimePrecision::Default => scalar,
            TimePrecision::Float => NumericType::Float,
            TimePrecision::Double => NumericType::Double,
        };
        Self { scalar, time }
    }

    /// Concrete type of `scalar` state variables
    pub fn scalar_type(&self) -> ResolvedType {
        ResolvedType::numeric(self.scalar)
    }

    /// Concrete type of time-valued state
    pub fn time_type(&self) -> ResolvedType {
        ResolvedType::numeric(self.time)
    }

    /// Resolve a symbolic type name used in a snippet definition.
    ///
    /// Accepts the fixed-width aliases (`uint32_t` etc.), the C spellings
    /// (`unsigned int`), and the model-policy names `scalar` and
    /// `timepoint`.
    pub fn resolve(&self, name: &str) -> Result<ResolvedType> {
        let numeric = match name.trim() {
            "scalar" => self.scalar,
            "timepoint" => self.time,
            "bool" => NumericType::Bool,
            "char" | "int8_t" | "signed char" => NumericType::Int8,
            "unsigned char" | "uint8_t" => NumericType::Uint8,
            "short" | "int16_t" => NumericType::Int16,
            "unsigned short" | "uint16_t" => NumericType::Uint16,
            "int" | "int32_t" => NumericType::Int32,
            "unsigned int" | "uint32_t" => NumericType::Uint32,
            "long long" | "int64_t" => NumericType::Int64,
            "unsigned long long" | "uint64_t" | "size_t" => NumericType::Uint64,
            "float" => NumericType::Float,
            "double" => NumericType::Double,
            "long double" => NumericType::LongDouble,
            other => return Err(TypeError::UnknownTypeName(other.to_string())),
        };
        Ok(ResolvedType::numeric(numeric))
    }
}

impl Default for TypeContext {
    fn default() -> Self {
        Self::new(ScalarPrecision::default(), TimePrecision::default())
    }
}

/// Format a numeric constant as a literal of the given type, with the
/// suffix the target language expects (`1.0f` for float, plain for
/// double, integral without fraction).
pub fn write_numeric(value: f64, ty: &ResolvedType) -> String {
    match ty.numeric_value() {
        Some(n) if n.is_integral() => format!("{}", value as i64),
        Some(NumericType::Float) => {
            if value == value.trunc() && value.abs() < 1.0e15 {
                format!("{:.1}f", value)
            } else {
                format!("{}f", value)
            }
        }
        _ => {
            if value == value.trunc() && value.abs() < 1.0e15 {
                format!("{:.1}", value)
            } else {
                format!("{}", value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_follows_precision() {
        let ctx = TypeContext::new(ScalarPrecision::Double, TimePrecision::Default);
        assert_eq!(ctx.scalar_type(), ResolvedType::numeric(NumericType::Double));
        assert_eq!(ctx.time_type(), ResolvedType::numeric(NumericType::Double));
    }

    #[test]
    fn test_time_precision_override() {
        let ctx = TypeContext::new(ScalarPrecision::Float, TimePrecision::Double);
        assert_eq!(ctx.scalar_type(), ResolvedType::numeric(NumericType::Float));
        assert_eq!(ctx.time_type(), ResolvedType::numeric(NumericType::Double));
    }

    #[test]
    fn test_resolve_aliases() {
        let ctx = TypeContext::default();
        assert_eq!(
            ctx.resolve("uint16_t").unwrap(),
            ResolvedType::numeric(NumericType::Uint16)
        );
        assert_eq!(
            ctx.resolve("unsigned int").unwrap(),
            ResolvedType::numeric(NumericType::Uint32)
        );
        assert!(ctx.resolve("quaternion").is_err());
    }

    #[test]
    fn test_write_numeric_suffixes() {
        let float = ResolvedType::numeric(NumericType::Float);
        let double = ResolvedType::numeric(NumericType::Double);
        let uint = ResolvedType::numeric(NumericType::Uint32);
        assert_eq!(write_numeric(1.0, &float), "1.0f");
        assert_eq!(write_numeric(0.5, &double), "0.5");
        assert_eq!(write_numeric(3.0, &uint), "3");
    }
}
