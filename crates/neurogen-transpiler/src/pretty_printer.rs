// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Pretty printer: writes parsed fragments back out as backend source,
//! substituting identifier expansions from the environment and inlining
//! function substitutions with positional argument placeholders
//! (`$(0)`, `$(1)`, ...).
//!
//! Identifiers that resolve to nothing are printed verbatim; the type
//! checker has already diagnosed genuinely unknown names, and printing
//! with an empty environment must round-trip a fragment unchanged up to
//! whitespace.

use crate::environment::{Environment, LocalScopes};
use crate::error::ErrorHandler;
use crate::parser::{Expression, Statement};
use crate::token::{Token, TokenKind};
use neurogen_types::TypeContext;

/// Marker returned when printing failed (malformed substitution template)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrintFailed;

const MAX_EXPANSION_DEPTH: usize = 16;

struct PrettyPrinter<'a> {
    ctx: &'a TypeContext,
    env: &'a mut dyn Environment,
    locals: LocalScopes,
    handler: &'a mut ErrorHandler,
    out: String,
    indent: usize,
    failed: bool,
}

/// Print a statement sequence; returns the emitted source text.
pub fn pretty_print_statements(
    statements: &[Statement],
    ctx: &TypeContext,
    env: &mut dyn Environment,
    handler: &mut ErrorHandler,
) -> Result<String, PrintFailed> {
    let mut printer = PrettyPrinter::new(ctx, env, handler);
    for statement in statements {
        printer.statement(statement);
    }
    printer.finish()
}

/// Print a single expression (threshold / event conditions)
pub fn pretty_print_expression(
    expression: &Expression,
    ctx: &TypeContext,
    env: &mut dyn Environment,
    handler: &mut ErrorHandler,
) -> Result<String, PrintFailed> {
    let mut printer = PrettyPrinter::new(ctx, env, handler);
    let text = printer.expression(expression);
    if printer.failed {
        Err(PrintFailed)
    } else {
        Ok(text)
    }
}

impl<'a> PrettyPrinter<'a> {
    fn new(
        ctx: &'a TypeContext,
        env: &'a mut dyn Environment,
        handler: &'a mut ErrorHandler,
    ) -> Self {
        Self {
            ctx,
            env,
            locals: LocalScopes::new(),
            handler,
            out: String::new(),
            indent: 0,
            failed: false,
        }
    }

    fn finish(self) -> Result<String, PrintFailed> {
        if self.failed {
            Err(PrintFailed)
        } else {
            Ok(self.out)
        }
    }

    // ---- statements -------------------------------------------------

    fn statement(&mut self, statement: &Statement) {
        match statement {
            Statement::Expression(e) => {
                let text = self.expression(e);
                self.line(&format!("{};", text));
            }
            Statement::VarDeclaration {
                is_const,
                type_tokens,
                declarators,
            } => {
                let mut decl = String::new();
                if *is_const {
                    decl.push_str("const ");
                }
                decl.push_str(&self.type_spelling(type_tokens));
                decl.push(' ');
                for (i, (name, init)) in declarators.iter().enumerate() {
                    if i > 0 {
                        decl.push_str(", ");
                    }
                    decl.push_str(&name.lexeme);
                    if let Some(init) = init {
                        let text = self.expression(init);
                        decl.push_str(" = ");
                        decl.push_str(&text);
                    }
                    self.locals
                        .define(&name.lexeme, self.ctx.scalar_type());
                }
                self.line(&format!("{};", decl));
            }
            Statement::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let cond = self.expression(condition);
                self.line(&format!("if ({})", cond));
                self.branch(then_branch);
                if let Some(else_branch) = else_branch {
                    self.line("else");
                    self.branch(else_branch);
                }
            }
            Statement::For {
                init,
                condition,
                increment,
                body,
            } => {
                self.locals.push();
                let init_text = match init.as_deref() {
                    Some(Statement::Expression(e)) => self.expression(e),
                    Some(decl @ Statement::VarDeclaration { .. }) => {
                        self.declaration_inline(decl)
                    }
                    _ => String::new(),
                };
                let cond_text = condition
                    .as_ref()
                    .map(|c| self.expression(c))
                    .unwrap_or_default();
                let inc_text = increment
                    .as_ref()
                    .map(|i| self.expression(i))
                    .unwrap_or_default();
                self.line(&format!("for ({}; {}; {})", init_text, cond_text, inc_text));
                self.branch(body);
                self.locals.pop();
            }
            Statement::While { condition, body } => {
                let cond = self.expression(condition);
                self.line(&format!("while ({})", cond));
                self.branch(body);
            }
            Statement::Do { body, condition } => {
                self.line("do");
                self.branch(body);
                let cond = self.expression(condition);
                self.line(&format!("while ({});", cond));
            }
            Statement::Compound(statements) => {
                self.line("{");
                self.indent += 1;
                self.locals.push();
                for s in statements {
                    self.statement(s);
                }
                self.locals.pop();
                self.indent -= 1;
                self.line("}");
            }
            Statement::Break(_) => self.line("break;"),
            Statement::Continue(_) => self.line("continue;"),
            Statement::Empty => self.line(";"),
        }
    }

    /// Print a branch body: compound statements keep their braces,
    /// single statements stay single so the fragment round-trips with
    /// its original statement shape.
    fn branch(&mut self, body: &Statement) {
        if matches!(body, Statement::Compound(_)) {
            self.statement(body);
        } else {
            self.indent += 1;
            self.statement(body);
            self.indent -= 1;
        }
    }

    /// Declaration without trailing semicolon, for for-initialisers
    fn declaration_inline(&mut self, declaration: &Statement) -> String {
        let Statement::VarDeclaration {
            is_const,
            type_tokens,
            declarators,
        } = declaration
        else {
            return String::new();
        };
        let mut decl = String::new();
        if *is_const {
            decl.push_str("const ");
        }
        decl.push_str(&self.type_spelling(type_tokens));
        decl.push(' ');
        for (i, (name, init)) in declarators.iter().enumerate() {
            if i > 0 {
                decl.push_str(", ");
            }
            decl.push_str(&name.lexeme);
            if let Some(init) = init {
                let text = self.expression(init);
                decl.push_str(" = ");
                decl.push_str(&text);
            }
            self.locals.define(&name.lexeme, self.ctx.scalar_type());
        }
        decl
    }

    /// Spell a declaration's type, lowering the model-policy names to
    /// their concrete types and leaving everything else as written.
    fn type_spelling(&self, type_tokens: &[Token]) -> String {
        let spelled: Vec<String> = type_tokens
            .iter()
            .map(|t| match t.lexeme.as_str() {
                "scalar" => self.ctx.scalar_type().name(),
                "timepoint" => self.ctx.time_type().name(),
                other => other.to_string(),
            })
            .collect();
        spelled.join(" ")
    }

    // ---- expressions ------------------------------------------------

    fn expression(&mut self, expression: &Expression) -> String {
        match expression {
            Expression::Literal(token) => token.lexeme.clone(),
            Expression::Variable(token) => self.variable(token),
            Expression::Grouped(inner) => format!("({})", self.expression(inner)),
            Expression::Unary { op, operand } => {
                format!("{}{}", op.lexeme, self.expression(operand))
            }
            Expression::IncDec { op, target, prefix } => {
                let target = self.expression(target);
                if *prefix {
                    format!("{}{}", op.lexeme, target)
                } else {
                    format!("{}{}", target, op.lexeme)
                }
            }
            Expression::Binary { left, op, right } => {
                format!(
                    "{} {} {}",
                    self.expression(left),
                    op.lexeme,
                    self.expression(right)
                )
            }
            Expression::Assignment { target, op, value } => {
                format!(
                    "{} {} {}",
                    self.expression(target),
                    op.lexeme,
                    self.expression(value)
                )
            }
            Expression::Conditional {
                condition,
                then_value,
                else_value,
            } => {
                format!(
                    "{} ? {} : {}",
                    self.expression(condition),
                    self.expression(then_value),
                    self.expression(else_value)
                )
            }
            Expression::Call { callee, paren, args } => self.call(callee, paren, args),
            Expression::Cast {
                type_tokens,
                operand,
            } => {
                format!(
                    "({}){}",
                    self.type_spelling(type_tokens),
                    self.expression(operand)
                )
            }
            Expression::Subscript { array, index } => {
                format!(
                    "{}[{}]",
                    self.expression(array),
                    self.expression(index)
                )
            }
        }
    }

    fn variable(&mut self, token: &Token) -> String {
        if self.locals.lookup(&token.lexeme).is_some() {
            return token.lexeme.clone();
        }
        match self.env.lookup(&token.lexeme) {
            Some(symbol) => self.resolve_text(&symbol.expansion, 0),
            None => token.lexeme.clone(),
        }
    }

    fn call(&mut self, callee: &Expression, paren: &Token, args: &[Expression]) -> String {
        let printed_args: Vec<String> = args.iter().map(|a| self.expression(a)).collect();

        if let Expression::Variable(name) = callee {
            if self.locals.lookup(&name.lexeme).is_none() {
                if let Some(symbol) = self.env.lookup(&name.lexeme) {
                    if has_positional_placeholder(&symbol.expansion) {
                        // Template substitution: inline the body with
                        // positional arguments spliced in
                        let substituted =
                            self.substitute_args(&symbol.expansion, &printed_args, paren);
                        return self.resolve_text(&substituted, 0);
                    }
                    // Bare callee name substitution (e.g. min -> fmin)
                    let callee = self.resolve_text(&symbol.expansion, 0);
                    return format!("{}({})", callee, printed_args.join(", "));
                }
            }
        }
        let callee = self.expression(callee);
        format!("{}({})", callee, printed_args.join(", "))
    }

    /// Replace `$(i)` placeholders with printed argument text
    fn substitute_args(&mut self, template: &str, args: &[String], paren: &Token) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(pos) = rest.find("$(") {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos + 2..];
            let Some(close) = tail.find(')') else {
                self.handler
                    .error(paren, "malformed substitution template");
                self.failed = true;
                return out;
            };
            let name = &tail[..close];
            if let Ok(index) = name.parse::<usize>() {
                match args.get(index) {
                    Some(arg) => out.push_str(arg),
                    None => {
                        self.handler.error(
                            paren,
                            format!("substitution references missing argument $({})", index),
                        );
                        self.failed = true;
                    }
                }
            } else {
                // Named reference, resolved later
                out.push_str("$(");
                out.push_str(name);
                out.push(')');
            }
            rest = &tail[close + 1..];
        }
        out.push_str(rest);
        out
    }

    /// Resolve `$(name)` references inside an expansion, inner-first
    fn resolve_text(&mut self, text: &str, depth: usize) -> String {
        if depth >= MAX_EXPANSION_DEPTH {
            self.failed = true;
            return text.to_string();
        }
        if !text.contains("$(") {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(pos) = rest.find("$(") {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos + 2..];
            let Some(close) = tail.find(')') else {
                self.failed = true;
                out.push_str(tail);
                return out;
            };
            let name = &tail[..close];
            match self.env.lookup(name) {
                Some(symbol) => {
                    let resolved = self.resolve_text(&symbol.expansion, depth + 1);
                    out.push_str(&resolved);
                }
                None => {
                    // Print the bare name; unresolved references were
                    // already diagnosed during type checking
                    out.push_str(name);
                }
            }
            rest = &tail[close + 1..];
        }
        out.push_str(rest);
        out
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }
}

fn has_positional_placeholder(template: &str) -> bool {
    let mut rest = template;
    while let Some(pos) = rest.find("$(") {
        let tail = &rest[pos + 2..];
        let Some(close) = tail.find(')') else {
            return false;
        };
        if tail[..close].parse::<usize>().is_ok() {
            return true;
        }
        rest = &tail[close + 1..];
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvSymbol;
    use crate::parser::{parse_expression, parse_statements};
    use crate::scanner::scan;
    use ahash::AHashMap;
    use neurogen_types::ResolvedType;

    struct MapEnv(AHashMap<String, EnvSymbol>);

    impl MapEnv {
        fn empty() -> Self {
            Self(AHashMap::new())
        }

        fn with(entries: &[(&str, &str)]) -> Self {
            let ctx = TypeContext::default();
            Self(
                entries
                    .iter()
                    .map(|(n, e)| {
                        (
                            n.to_string(),
                            EnvSymbol {
                                ty: ctx.scalar_type(),
                                expansion: e.to_string(),
                            },
                        )
                    })
                    .collect(),
            )
        }
    }

    impl Environment for MapEnv {
        fn lookup(&mut self, name: &str) -> Option<EnvSymbol> {
            self.0.get(name).cloned()
        }
    }

    fn print(src: &str, env: &mut MapEnv) -> String {
        let ctx = TypeContext::default();
        let tokens = scan(src, "test").unwrap();
        let mut handler = ErrorHandler::new("test");
        let statements = parse_statements(&tokens, &mut handler).unwrap();
        pretty_print_statements(&statements, &ctx, env, &mut handler).unwrap()
    }

    #[test]
    fn test_identifier_expansion() {
        let mut env = MapEnv::with(&[("V", "group->V[lid]")]);
        let out = print("V = V + 1.0;", &mut env);
        assert_eq!(out, "group->V[lid] = group->V[lid] + 1.0;\n");
    }

    #[test]
    fn test_nested_expansion() {
        let mut env = MapEnv::with(&[("V", "group->V[$(id)]"), ("id", "lid")]);
        let out = print("V = 0.0;", &mut env);
        assert_eq!(out, "group->V[lid] = 0.0;\n");
    }

    #[test]
    fn test_function_template_substitution() {
        let mut env = MapEnv::with(&[("x", "lx")]);
        let ctx = TypeContext::default();
        env.0.insert(
            "injectCurrent".to_string(),
            EnvSymbol {
                ty: ResolvedType::function(ResolvedType::void(), vec![ctx.scalar_type()]),
                expansion: "Isyn += $(0)".to_string(),
            },
        );
        let out = print("injectCurrent(x * 2.0);", &mut env);
        assert_eq!(out, "Isyn += lx * 2.0;\n");
    }

    #[test]
    fn test_round_trip_with_empty_environment() {
        let src = "if (V >= 30.0f) { V = c; U += d; }";
        let mut env = MapEnv::empty();
        let printed = print(src, &mut env);

        // Printing with an empty environment must re-parse to the same shape
        let tokens_a = scan(src, "a").unwrap();
        let tokens_b = scan(&printed, "b").unwrap();
        let mut ha = ErrorHandler::new("a");
        let mut hb = ErrorHandler::new("b");
        let ast_a = parse_statements(&tokens_a, &mut ha).unwrap();
        let ast_b = parse_statements(&tokens_b, &mut hb).unwrap();
        // Locations differ; compare printed forms instead of raw trees
        let mut env2 = MapEnv::empty();
        let ctx = TypeContext::default();
        let mut h2 = ErrorHandler::new("c");
        let reprinted = pretty_print_statements(&ast_b, &ctx, &mut env2, &mut h2).unwrap();
        let mut h3 = ErrorHandler::new("d");
        let printed_a = pretty_print_statements(&ast_a, &ctx, &mut env2, &mut h3).unwrap();
        assert_eq!(reprinted, printed_a);
    }

    #[test]
    fn test_scalar_type_lowered_in_declarations() {
        let mut env = MapEnv::empty();
        let out = print("scalar x = 1.0;", &mut env);
        assert_eq!(out, "float x = 1.0;\n");
    }

    #[test]
    fn test_locals_not_expanded() {
        let mut env = MapEnv::with(&[("x", "group->x[lid]")]);
        let out = print("{ scalar x = 0.0; x += 1.0; }", &mut env);
        assert!(out.contains("x += 1.0;"));
        assert!(!out.contains("group->x[lid] += 1.0;"));
    }

    #[test]
    fn test_condition_expression_printing() {
        let ctx = TypeContext::default();
        let tokens = scan("V >= Vthresh", "test").unwrap();
        let mut handler = ErrorHandler::new("test");
        let expr = parse_expression(&tokens, &mut handler).unwrap();
        let mut env = MapEnv::with(&[("V", "lV"), ("Vthresh", "30.0f")]);
        let out = pretty_print_expression(&expr, &ctx, &mut env, &mut handler).unwrap();
        assert_eq!(out, "lV >= 30.0f");
    }
}
