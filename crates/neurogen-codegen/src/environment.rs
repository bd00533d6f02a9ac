// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Emission environments.
//!
//! A [`KernelEnvironment`] is the stack-scoped name table the
//! transpiler resolves identifiers against while a merged group is
//! being emitted. Layers are pushed and popped around each child
//! fragment; an inner binding shadows an outer one.
//!
//! Three binding flavours:
//! - plain bindings: name → (type, expansion text)
//! - field bindings: additionally register a field in the merged group
//!   the first time the fragment actually uses the name
//! - local-var cache bindings: on first use emit a typed local seeded
//!   from the backing array, redirect reads/writes to the local, and
//!   flush writes back on scope exit through the write-slot index

use crate::code_stream::CodeStream;
use crate::merged::Field;
use ahash::AHashMap;
use neurogen_model::CodeFragment;
use neurogen_transpiler::{
    parse_expression, parse_statements, pretty_print_expression, pretty_print_statements,
    standard_library, type_check_expression, type_check_statements, EnvSymbol, Environment,
    ErrorHandler,
};
use neurogen_types::{ResolvedType, TypeContext};

/// A variable cached in a register for the duration of a scope
#[derive(Debug, Clone)]
pub struct CachedVar {
    /// Name model code uses
    pub name: String,
    /// Register alias emitted into the kernel
    pub local_name: String,
    pub ty: ResolvedType,
    /// Backing array expression, e.g. `group->V`
    pub array: String,
    /// Index used to seed the local (read-slot for delayed groups)
    pub read_index: String,
    /// Index used to flush the local (write-slot for delayed groups)
    pub write_index: String,
    /// Whether the local is flushed back on scope exit
    pub write_back: bool,
}

struct Binding {
    symbol: EnvSymbol,
    init_lines: Vec<String>,
    field: Option<Field>,
    used: bool,
    emitted: bool,
}

struct Scope {
    bindings: AHashMap<String, Binding>,
    order: Vec<String>,
    cached: Vec<CachedVar>,
}

impl Scope {
    fn new() -> Self {
        Self {
            bindings: AHashMap::new(),
            order: Vec::new(),
            cached: Vec::new(),
        }
    }
}

/// The layered emission environment
pub struct KernelEnvironment<'c> {
    ctx: &'c TypeContext,
    scopes: Vec<Scope>,
    fields: Vec<Field>,
}

impl<'c> KernelEnvironment<'c> {
    /// Root environment seeded with the standard function library
    pub fn new(ctx: &'c TypeContext) -> Self {
        let mut env = Self {
            ctx,
            scopes: vec![Scope::new()],
            fields: Vec::new(),
        };
        for (name, symbol) in standard_library(ctx) {
            env.insert(
                name,
                Binding {
                    symbol,
                    init_lines: Vec::new(),
                    field: None,
                    used: false,
                    emitted: false,
                },
            );
        }
        env
    }

    pub fn type_context(&self) -> &TypeContext {
        self.ctx
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Scope::new());
    }

    /// Pop the innermost scope, flushing used cached variables back to
    /// their arrays
    pub fn pop_scope(&mut self, stream: &mut CodeStream) {
        let scope = self.scopes.pop().expect("scope stack is never empty");
        for cached in &scope.cached {
            let used = scope
                .bindings
                .get(&cached.name)
                .map(|b| b.used)
                .unwrap_or(false);
            if used && cached.write_back {
                let line = format!(
                    "{}[{}] = {};",
                    cached.array, cached.write_index, cached.local_name
                );
                stream.line(self.resolve_in_scopes(&line, &scope));
            }
        }
    }

    fn insert(&mut self, name: String, binding: Binding) {
        let scope = self.scopes.last_mut().expect("scope stack is never empty");
        if scope.bindings.insert(name.clone(), binding).is_none() {
            scope.order.push(name);
        }
    }

    /// Plain binding: the identifier expands to `expansion`
    pub fn add(&mut self, name: impl Into<String>, ty: ResolvedType, expansion: impl Into<String>) {
        self.insert(
            name.into(),
            Binding {
                symbol: EnvSymbol {
                    ty,
                    expansion: expansion.into(),
                },
                init_lines: Vec::new(),
                field: None,
                used: false,
                emitted: false,
            },
        );
    }

    /// Binding whose initialiser lines are emitted on first use, in
    /// binding order. Later bindings may depend on earlier ones while
    /// the emission order stays the code's lexical order.
    pub fn add_with_init(
        &mut self,
        name: impl Into<String>,
        ty: ResolvedType,
        expansion: impl Into<String>,
        init_lines: Vec<String>,
    ) {
        self.insert(
            name.into(),
            Binding {
                symbol: EnvSymbol {
                    ty,
                    expansion: expansion.into(),
                },
                init_lines,
                field: None,
                used: false,
                emitted: false,
            },
        );
    }

    /// Field binding: using the name registers a field in the merged
    /// group and expands to the field access
    pub fn add_field(
        &mut self,
        name: impl Into<String>,
        ty: ResolvedType,
        expansion: impl Into<String>,
        field: Field,
    ) {
        self.insert(
            name.into(),
            Binding {
                symbol: EnvSymbol {
                    ty,
                    expansion: expansion.into(),
                },
                init_lines: Vec::new(),
                field: Some(field),
                used: false,
                emitted: false,
            },
        );
    }

    /// Local-var cache binding (see module docs)
    pub fn add_cached(&mut self, cached: CachedVar) {
        let decl = format!(
            "{} {} = {}[{}];",
            cached.ty.remove_const().name(),
            cached.local_name,
            cached.array,
            cached.read_index
        );
        self.insert(
            cached.name.clone(),
            Binding {
                symbol: EnvSymbol {
                    ty: cached.ty.clone(),
                    expansion: cached.local_name.clone(),
                },
                init_lines: vec![decl],
                field: None,
                used: false,
                emitted: false,
            },
        );
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .cached
            .push(cached);
    }

    /// Force a binding to count as used (for unconditional preamble
    /// state like spike-count resets)
    pub fn mark_used(&mut self, name: &str) {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(binding) = scope.bindings.get_mut(name) {
                binding.used = true;
                return;
            }
        }
    }

    /// After type checking, write the initialiser lines of every used
    /// binding and register used fields. Must run before printing.
    pub fn flush(&mut self, stream: &mut CodeStream) {
        self.propagate_usage();

        // Emit in scope order, outermost first, insertion order within
        // a scope; collect the work first so resolution can re-borrow
        let mut pending: Vec<(usize, String)> = Vec::new();
        for (depth, scope) in self.scopes.iter().enumerate() {
            for name in &scope.order {
                let binding = &scope.bindings[name];
                if binding.used && !binding.emitted {
                    pending.push((depth, name.clone()));
                }
            }
        }
        for (depth, name) in pending {
            let (lines, field) = {
                let binding = self.scopes[depth].bindings.get_mut(&name).unwrap();
                binding.emitted = true;
                (binding.init_lines.clone(), binding.field.take())
            };
            if let Some(field) = field {
                self.fields.push(field);
            }
            for line in lines {
                let resolved = self.resolve(&line);
                stream.line(resolved);
            }
        }
    }

    /// Drain the fields registered by used bindings
    pub fn take_fields(&mut self) -> Vec<Field> {
        std::mem::take(&mut self.fields)
    }

    /// Transitively mark bindings referenced from used bindings'
    /// expansions and initialiser lines
    fn propagate_usage(&mut self) {
        loop {
            let mut newly_used: Vec<String> = Vec::new();
            for scope in &self.scopes {
                for binding in scope.bindings.values() {
                    if !binding.used {
                        continue;
                    }
                    let mut scan = |text: &str| {
                        for reference in references(text) {
                            if let Some(target) = self.find(&reference) {
                                if !target.used && !newly_used.contains(&reference) {
                                    newly_used.push(reference.clone());
                                }
                            }
                        }
                    };
                    scan(&binding.symbol.expansion);
                    for line in &binding.init_lines {
                        scan(line);
                    }
                }
            }
            if newly_used.is_empty() {
                break;
            }
            for name in newly_used {
                self.mark_used(&name);
            }
        }
    }

    fn find(&self, name: &str) -> Option<&Binding> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.bindings.get(name))
    }

    /// Resolve `$(name)` references against the current scope stack
    pub fn resolve(&self, text: &str) -> String {
        self.resolve_depth(text, 0)
    }

    /// Resolve and write one line, marking referenced bindings used so
    /// their fields and initialisers materialise
    pub fn print_line(&mut self, stream: &mut CodeStream, text: impl AsRef<str>) {
        let text = text.as_ref();
        for reference in references(text) {
            self.mark_used(&reference);
        }
        stream.line(self.resolve(text));
    }

    /// Resolve and open a brace scope
    pub fn print_open(&mut self, stream: &mut CodeStream, prefix: impl AsRef<str>) {
        let prefix = prefix.as_ref();
        for reference in references(prefix) {
            self.mark_used(&reference);
        }
        stream.open(&self.resolve(prefix));
    }

    fn resolve_depth(&self, text: &str, depth: usize) -> String {
        if depth >= 16 || !text.contains("$(") {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(pos) = rest.find("$(") {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos + 2..];
            let Some(close) = tail.find(')') else {
                out.push_str(tail);
                return out;
            };
            let name = &tail[..close];
            match self.find(name) {
                Some(binding) => {
                    out.push_str(&self.resolve_depth(&binding.symbol.expansion, depth + 1))
                }
                None => out.push_str(name),
            }
            rest = &tail[close + 1..];
        }
        out.push_str(rest);
        out
    }

    /// Resolve against a scope that has already been popped plus the
    /// remaining stack (for cached-var flush lines)
    fn resolve_in_scopes(&self, text: &str, popped: &Scope) -> String {
        if !text.contains("$(") {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(pos) = rest.find("$(") {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos + 2..];
            let Some(close) = tail.find(')') else {
                out.push_str(tail);
                return out;
            };
            let name = &tail[..close];
            if let Some(binding) = popped.bindings.get(name) {
                out.push_str(&self.resolve(&binding.symbol.expansion));
            } else if let Some(binding) = self.find(name) {
                out.push_str(&self.resolve(&binding.symbol.expansion));
            } else {
                out.push_str(name);
            }
            rest = &tail[close + 1..];
        }
        out.push_str(rest);
        out
    }
}

impl Environment for KernelEnvironment<'_> {
    fn lookup(&mut self, name: &str) -> Option<EnvSymbol> {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(binding) = scope.bindings.get_mut(name) {
                binding.used = true;
                return Some(binding.symbol.clone());
            }
        }
        None
    }
}

fn references(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find("$(") {
        let tail = &rest[pos + 2..];
        let Some(close) = tail.find(')') else {
            break;
        };
        out.push(tail[..close].to_string());
        rest = &tail[close + 1..];
    }
    out
}

/// Transpile a statement fragment into the stream: type-check against
/// the environment, flush used initialisers, pretty-print. Returns
/// false when the fragment failed; diagnostics stay in the handler.
pub fn emit_statements(
    env: &mut KernelEnvironment<'_>,
    fragment: &CodeFragment,
    handler: &mut ErrorHandler,
    stream: &mut CodeStream,
) -> bool {
    if fragment.is_empty() {
        return true;
    }
    let ctx = *env.type_context();
    let Ok(statements) = parse_statements(fragment.tokens(), handler) else {
        return false;
    };
    if type_check_statements(&statements, &ctx, env, handler).is_err() {
        return false;
    }
    env.flush(stream);
    match pretty_print_statements(&statements, &ctx, env, handler) {
        Ok(text) => {
            stream.raw(&text);
            true
        }
        Err(_) => false,
    }
}

/// Transpile a condition expression; returns the printed text
pub fn emit_expression(
    env: &mut KernelEnvironment<'_>,
    fragment: &CodeFragment,
    handler: &mut ErrorHandler,
    stream: &mut CodeStream,
) -> Option<String> {
    let ctx = *env.type_context();
    let Ok(expression) = parse_expression(fragment.tokens(), handler) else {
        return None;
    };
    if type_check_expression(&expression, &ctx, env, handler).is_err() {
        return None;
    }
    env.flush(stream);
    pretty_print_expression(&expression, &ctx, env, handler).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use neurogen_types::NumericType;

    fn scalar() -> ResolvedType {
        ResolvedType::numeric(NumericType::Float)
    }

    #[test]
    fn test_inner_scope_shadows_outer() {
        let ctx = TypeContext::default();
        let mut env = KernelEnvironment::new(&ctx);
        env.add("V", scalar(), "outerV");
        env.push_scope();
        env.add("V", scalar(), "innerV");
        assert_eq!(env.lookup("V").unwrap().expansion, "innerV");
        let mut stream = CodeStream::new();
        env.pop_scope(&mut stream);
        assert_eq!(env.lookup("V").unwrap().expansion, "outerV");
    }

    #[test]
    fn test_cached_var_emits_on_use_and_flushes() {
        let ctx = TypeContext::default();
        let mut env = KernelEnvironment::new(&ctx);
        env.add("id", ResolvedType::numeric(NumericType::Uint32).add_const(), "lid");
        env.push_scope();
        env.add_cached(CachedVar {
            name: "V".into(),
            local_name: "lV".into(),
            ty: scalar(),
            array: "group->V".into(),
            read_index: "$(id)".into(),
            write_index: "$(id)".into(),
            write_back: true,
        });
        env.add_cached(CachedVar {
            name: "U".into(),
            local_name: "lU".into(),
            ty: scalar(),
            array: "group->U".into(),
            read_index: "$(id)".into(),
            write_index: "$(id)".into(),
            write_back: true,
        });

        let fragment = CodeFragment::scan("V += 1.0;", "test").unwrap();
        let mut handler = ErrorHandler::new("test");
        let mut stream = CodeStream::new();
        assert!(emit_statements(&mut env, &fragment, &mut handler, &mut stream));
        env.pop_scope(&mut stream);

        let out = stream.as_str();
        // Only the used variable is declared and flushed
        assert!(out.contains("float lV = group->V[lid];"));
        assert!(out.contains("lV += 1.0;"));
        assert!(out.contains("group->V[lid] = lV;"));
        assert!(!out.contains("lU"));
    }

    #[test]
    fn test_field_registered_on_use_only() {
        use crate::merged::{FieldInit, GroupRef};
        use neurogen_model::NeuronGroupId;

        let ctx = TypeContext::default();
        let mut env = KernelEnvironment::new(&ctx);
        let field = |name: &str| Field {
            name: name.into(),
            ty: scalar().create_pointer(),
            values: vec![FieldInit::Array {
                group: GroupRef::Neuron(NeuronGroupId(0)),
                var: name.into(),
            }],
        };
        env.add_field("_out_post", scalar().create_pointer(), "group->outPost0", field("outPost0"));
        env.add_field("_den_delay", scalar().create_pointer(), "group->denDelay0", field("denDelay0"));

        let fragment = CodeFragment::scan("_out_post[0] = 0.0;", "test").unwrap();
        let mut handler = ErrorHandler::new("test");
        let mut stream = CodeStream::new();
        assert!(emit_statements(&mut env, &fragment, &mut handler, &mut stream));

        let fields = env.take_fields();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "outPost0");
    }

    #[test]
    fn test_function_substitution_through_env() {
        let ctx = TypeContext::default();
        let mut env = KernelEnvironment::new(&ctx);
        env.add("Isyn", scalar(), "lIsyn");
        env.add(
            "injectCurrent",
            ResolvedType::function(ResolvedType::void(), vec![ctx.scalar_type()]),
            "$(Isyn) += $(0)",
        );
        env.add("amp", scalar().add_const(), "group->amp");

        let fragment = CodeFragment::scan("injectCurrent(amp);", "test").unwrap();
        let mut handler = ErrorHandler::new("test");
        let mut stream = CodeStream::new();
        assert!(emit_statements(&mut env, &fragment, &mut handler, &mut stream));
        assert!(stream.as_str().contains("lIsyn += group->amp;"));
    }

    #[test]
    fn test_unresolved_identifier_diagnosed() {
        let ctx = TypeContext::default();
        let mut env = KernelEnvironment::new(&ctx);
        let fragment = CodeFragment::scan("V += 1.0;", "Neuron group 'N' sim code").unwrap();
        let mut handler = ErrorHandler::new("Neuron group 'N' sim code");
        let mut stream = CodeStream::new();
        assert!(!emit_statements(&mut env, &fragment, &mut handler, &mut stream));
        assert!(handler.has_errors());
        assert!(handler.diagnostics()[0]
            .message
            .contains("undefined identifier 'V'"));
    }
}
