// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Diagnostics for user model code.
//!
//! Every diagnostic carries the identity of the fragment it arose from
//! (e.g. `"Synapse group 'S' weight update model sim code"`) plus the
//! line and column inside that fragment. A generation pass keeps going
//! after a fragment fails so all diagnostics surface together.

use crate::token::Token;
use thiserror::Error;

/// Scanner failure. Scanning happens at IR construction, so this is the
/// one transpiler error that surfaces immediately rather than being
/// accumulated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{context}: syntax error at line {line}, column {column}: {message}")]
pub struct ScanError {
    pub context: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

/// A single accumulated diagnostic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub context: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: error at line {}, column {}: {}",
            self.context, self.line, self.column, self.message
        )
    }
}

/// Accumulates diagnostics for one code fragment.
///
/// The parser and type checker report here and keep going where they
/// can; emission of the fragment is aborted if any error was recorded,
/// but the caller continues with other groups.
#[derive(Debug)]
pub struct ErrorHandler {
    context: String,
    errors: Vec<Diagnostic>,
}

impl ErrorHandler {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            errors: Vec::new(),
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// Record an error anchored at a token
    pub fn error(&mut self, token: &Token, message: impl Into<String>) {
        self.errors.push(Diagnostic {
            context: self.context.clone(),
            line: token.line,
            column: token.column,
            message: message.into(),
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.errors
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.errors
    }
}
