// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # Neurogen Transpiler
//!
//! Rewrites user-supplied model code fragments (membrane update, weight
//! update, threshold, decay, reset, connectivity build) into
//! backend-specific source.
//!
//! ## Pipeline
//!
//! ```text
//! source text
//!   └─ scan         → token stream with source locations
//!       └─ parse    → expression / statement trees (no implicit semicolons)
//!           └─ type-check  → resolve identifiers against the Environment,
//!           │                verify numeric compatibility and arities,
//!           │                reject writes to read-only captures
//!           └─ pretty-print → backend source, substituting identifier
//!                             expansions and inlining function
//!                             substitutions ($(0), $(1), ...)
//! ```
//!
//! Fragments are scanned once at IR construction; downstream components
//! only ever see token streams. Errors accumulate in an [`ErrorHandler`]
//! carrying the fragment's identity so a generation pass can collect
//! every diagnostic before failing.

pub mod environment;
pub mod error;
pub mod parser;
pub mod pretty_printer;
pub mod scanner;
pub mod token;
pub mod type_checker;

pub use environment::{standard_library, EnvSymbol, Environment};
pub use error::{Diagnostic, ErrorHandler, ScanError};
pub use parser::{parse_expression, parse_statements, Expression, Statement};
pub use pretty_printer::{pretty_print_expression, pretty_print_statements};
pub use scanner::scan;
pub use token::{Token, TokenKind};
pub use type_checker::{type_check_expression, type_check_statements};

use token::TokenKind as Tk;

/// True when a token stream contains no executable content
pub fn tokens_empty(tokens: &[Token]) -> bool {
    tokens.iter().all(|t| t.kind == Tk::Eof)
}

/// True when any identifier token in the stream matches `name`.
///
/// This is the only raw query components perform on token streams; it
/// drives delay-queue inference and referenced-parameter detection.
pub fn references_identifier(tokens: &[Token], name: &str) -> bool {
    tokens
        .iter()
        .any(|t| t.kind == Tk::Identifier && t.lexeme == name)
}
