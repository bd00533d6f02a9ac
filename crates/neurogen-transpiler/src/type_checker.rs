// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Type checker for parsed fragments.
//!
//! Resolves every identifier against the active [`Environment`],
//! verifies numeric compatibility and function arities, and rejects
//! writes to read-only captures (const-typed bindings). Errors are
//! accumulated in the fragment's [`ErrorHandler`]; checking continues
//! past recoverable errors so one pass surfaces as much as possible.

use crate::environment::{Environment, LocalScopes};
use crate::error::ErrorHandler;
use crate::parser::{Expression, Statement};
use crate::token::{Token, TokenKind};
use neurogen_types::{NumericType, ResolvedType, TypeContext, TypeKind};

/// Marker returned when a fragment failed type checking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckFailed;

struct TypeChecker<'a> {
    ctx: &'a TypeContext,
    env: &'a mut dyn Environment,
    locals: LocalScopes,
    handler: &'a mut ErrorHandler,
    failed: bool,
}

/// Type-check a statement sequence against an environment
pub fn type_check_statements(
    statements: &[Statement],
    ctx: &TypeContext,
    env: &mut dyn Environment,
    handler: &mut ErrorHandler,
) -> Result<(), CheckFailed> {
    let mut checker = TypeChecker {
        ctx,
        env,
        locals: LocalScopes::new(),
        handler,
        failed: false,
    };
    for statement in statements {
        checker.statement(statement);
    }
    if checker.failed || checker.handler.has_errors() {
        Err(CheckFailed)
    } else {
        Ok(())
    }
}

/// Type-check a condition expression; it must produce a numeric or
/// boolean value.
pub fn type_check_expression(
    expression: &Expression,
    ctx: &TypeContext,
    env: &mut dyn Environment,
    handler: &mut ErrorHandler,
) -> Result<(), CheckFailed> {
    let mut checker = TypeChecker {
        ctx,
        env,
        locals: LocalScopes::new(),
        handler,
        failed: false,
    };
    checker.expression(expression);
    if checker.failed || checker.handler.has_errors() {
        Err(CheckFailed)
    } else {
        Ok(())
    }
}

impl<'a> TypeChecker<'a> {
    fn statement(&mut self, statement: &Statement) {
        match statement {
            Statement::Expression(e) => {
                self.expression(e);
            }
            Statement::VarDeclaration {
                is_const,
                type_tokens,
                declarators,
            } => self.declaration(*is_const, type_tokens, declarators),
            Statement::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.condition(condition);
                self.statement(then_branch);
                if let Some(else_branch) = else_branch {
                    self.statement(else_branch);
                }
            }
            Statement::For {
                init,
                condition,
                increment,
                body,
            } => {
                self.locals.push();
                if let Some(init) = init {
                    self.statement(init);
                }
                if let Some(condition) = condition {
                    self.condition(condition);
                }
                if let Some(increment) = increment {
                    self.expression(increment);
                }
                self.statement(body);
                self.locals.pop();
            }
            Statement::While { condition, body } => {
                self.condition(condition);
                self.statement(body);
            }
            Statement::Do { body, condition } => {
                self.statement(body);
                self.condition(condition);
            }
            Statement::Compound(statements) => {
                self.locals.push();
                for s in statements {
                    self.statement(s);
                }
                self.locals.pop();
            }
            Statement::Break(_) | Statement::Continue(_) | Statement::Empty => {}
        }
    }

    fn declaration(
        &mut self,
        is_const: bool,
        type_tokens: &[Token],
        declarators: &[(Token, Option<Expression>)],
    ) {
        let spelled: Vec<&str> = type_tokens.iter().map(|t| t.lexeme.as_str()).collect();
        let spelled = spelled.join(" ");
        let ty = match self.ctx.resolve(&spelled) {
            Ok(ty) => {
                if is_const {
                    ty.add_const()
                } else {
                    ty
                }
            }
            Err(_) => {
                self.handler
                    .error(&type_tokens[0], format!("unknown type '{}'", spelled));
                self.failed = true;
                return;
            }
        };
        for (name, init) in declarators {
            if let Some(init) = init {
                if let Some(init_ty) = self.expression(init) {
                    if !init_ty.is_numeric() {
                        self.handler.error(
                            name,
                            format!(
                                "cannot initialise '{}' from non-numeric value",
                                name.lexeme
                            ),
                        );
                        self.failed = true;
                    }
                }
            }
            if !self.locals.define(&name.lexeme, ty.clone()) {
                self.handler.error(
                    name,
                    format!("redefinition of local variable '{}'", name.lexeme),
                );
                self.failed = true;
            }
        }
    }

    fn condition(&mut self, condition: &Expression) {
        if let Some(ty) = self.expression(condition) {
            if !ty.is_numeric() {
                if let Some(tok) = anchor(condition) {
                    self.handler
                        .error(tok, "condition must be a numeric or boolean value");
                    self.failed = true;
                }
            }
        }
    }

    fn expression(&mut self, expression: &Expression) -> Option<ResolvedType> {
        match expression {
            Expression::Literal(token) => Some(self.literal(token)),
            Expression::Variable(token) => self.variable(token),
            Expression::Grouped(inner) => self.expression(inner),
            Expression::Unary { op, operand } => {
                let ty = self.expression(operand)?;
                let numeric = self.require_numeric(&ty, op)?;
                match op.kind {
                    TokenKind::Not => Some(ResolvedType::numeric(NumericType::Bool)),
                    TokenKind::Tilde => {
                        if !numeric.is_integral() {
                            self.handler
                                .error(op, "operand of '~' must be integral");
                            self.failed = true;
                            None
                        } else {
                            Some(ResolvedType::numeric(numeric))
                        }
                    }
                    _ => Some(ResolvedType::numeric(numeric)),
                }
            }
            Expression::IncDec { op, target, .. } => {
                let ty = self.expression(target)?;
                self.require_assignable(target, &ty, op);
                let numeric = self.require_numeric(&ty, op)?;
                Some(ResolvedType::numeric(numeric))
            }
            Expression::Binary { left, op, right } => {
                let lt = self.expression(left);
                let rt = self.expression(right);
                let (lt, rt) = (lt?, rt?);
                let ln = self.require_numeric(&lt, op)?;
                let rn = self.require_numeric(&rt, op)?;
                match op.kind {
                    TokenKind::EqualEqual
                    | TokenKind::NotEqual
                    | TokenKind::Less
                    | TokenKind::LessEqual
                    | TokenKind::Greater
                    | TokenKind::GreaterEqual
                    | TokenKind::AmpersandAmpersand
                    | TokenKind::PipePipe => Some(ResolvedType::numeric(NumericType::Bool)),
                    TokenKind::Percent
                    | TokenKind::Ampersand
                    | TokenKind::Pipe
                    | TokenKind::Caret
                    | TokenKind::ShiftLeft
                    | TokenKind::ShiftRight => {
                        if !ln.is_integral() || !rn.is_integral() {
                            // fmod covers floating '%'; bitwise stays integral
                            if op.kind == TokenKind::Percent {
                                Some(ResolvedType::numeric(NumericType::common(ln, rn)))
                            } else {
                                self.handler
                                    .error(op, "bitwise operands must be integral");
                                self.failed = true;
                                None
                            }
                        } else {
                            Some(ResolvedType::numeric(NumericType::common(ln, rn)))
                        }
                    }
                    _ => Some(ResolvedType::numeric(NumericType::common(ln, rn))),
                }
            }
            Expression::Assignment { target, op, value } => {
                let target_ty = self.expression(target)?;
                self.require_assignable(target, &target_ty, op);
                let value_ty = self.expression(value)?;
                if target_ty.is_numeric() && !value_ty.is_numeric() {
                    self.handler
                        .error(op, "cannot assign non-numeric value");
                    self.failed = true;
                    return None;
                }
                Some(target_ty.remove_const())
            }
            Expression::Conditional {
                condition,
                then_value,
                else_value,
            } => {
                self.condition(condition);
                let tt = self.expression(then_value)?;
                let et = self.expression(else_value)?;
                match (tt.numeric_value(), et.numeric_value()) {
                    (Some(a), Some(b)) => Some(ResolvedType::numeric(NumericType::common(a, b))),
                    _ => Some(tt),
                }
            }
            Expression::Call { callee, paren, args } => self.call(callee, paren, args),
            Expression::Cast {
                type_tokens,
                operand,
            } => {
                let operand_ty = self.expression(operand);
                let spelled: Vec<&str> =
                    type_tokens.iter().map(|t| t.lexeme.as_str()).collect();
                let spelled = spelled.join(" ");
                match self.ctx.resolve(&spelled) {
                    Ok(ty) => {
                        if let Some(operand_ty) = operand_ty {
                            if !operand_ty.is_numeric() {
                                self.handler.error(
                                    &type_tokens[0],
                                    "cast operand must be a numeric value",
                                );
                                self.failed = true;
                            }
                        }
                        Some(ty)
                    }
                    Err(_) => {
                        self.handler
                            .error(&type_tokens[0], format!("unknown type '{}'", spelled));
                        self.failed = true;
                        None
                    }
                }
            }
            Expression::Subscript { array, index } => {
                let array_ty = self.expression(array)?;
                let index_ty = self.expression(index)?;
                if let Some(n) = index_ty.numeric_value() {
                    if !n.is_integral() {
                        if let Some(tok) = anchor(index) {
                            self.handler.error(tok, "array index must be integral");
                            self.failed = true;
                        }
                    }
                }
                match array_ty.pointee() {
                    Some(element) => {
                        let element = if array_ty.is_const {
                            element.add_const()
                        } else {
                            element.clone()
                        };
                        Some(element)
                    }
                    None => {
                        if let Some(tok) = anchor(array) {
                            self.handler
                                .error(tok, "subscripted value is not an array");
                            self.failed = true;
                        }
                        None
                    }
                }
            }
        }
    }

    fn call(
        &mut self,
        callee: &Expression,
        paren: &Token,
        args: &[Expression],
    ) -> Option<ResolvedType> {
        let Expression::Variable(name) = callee else {
            self.handler.error(paren, "called value is not a function");
            self.failed = true;
            return None;
        };
        let symbol_ty = match self.variable(name) {
            Some(ty) => ty,
            None => return None,
        };
        let TypeKind::Function { ret, args: params } = &symbol_ty.kind else {
            self.handler
                .error(name, format!("'{}' is not a function", name.lexeme));
            self.failed = true;
            return None;
        };
        if params.len() != args.len() {
            self.handler.error(
                paren,
                format!(
                    "'{}' expects {} argument(s), {} provided",
                    name.lexeme,
                    params.len(),
                    args.len()
                ),
            );
            self.failed = true;
        }
        for (arg, param) in args.iter().zip(params.iter()) {
            if let Some(arg_ty) = self.expression(arg) {
                if param.is_numeric() && !arg_ty.is_numeric() {
                    if let Some(tok) = anchor(arg) {
                        self.handler
                            .error(tok, "argument must be a numeric value");
                        self.failed = true;
                    }
                }
            }
        }
        // Check any surplus arguments too so their identifiers resolve
        for arg in args.iter().skip(params.len()) {
            self.expression(arg);
        }
        Some((**ret).clone())
    }

    fn variable(&mut self, token: &Token) -> Option<ResolvedType> {
        if let Some(ty) = self.locals.lookup(&token.lexeme) {
            return Some(ty.clone());
        }
        match self.env.lookup(&token.lexeme) {
            Some(symbol) => Some(symbol.ty),
            None => {
                self.handler
                    .error(token, format!("undefined identifier '{}'", token.lexeme));
                self.failed = true;
                None
            }
        }
    }

    fn literal(&mut self, token: &Token) -> ResolvedType {
        match token.kind {
            TokenKind::IntLiteral => {
                if token.lexeme.ends_with('u') || token.lexeme.ends_with('U') {
                    ResolvedType::numeric(NumericType::Uint32)
                } else {
                    ResolvedType::numeric(NumericType::Int32)
                }
            }
            TokenKind::FloatLiteral => {
                if token.lexeme.ends_with('f') || token.lexeme.ends_with('F') {
                    ResolvedType::numeric(NumericType::Float)
                } else {
                    // Unsuffixed floating literals take the model's scalar type
                    self.ctx.scalar_type()
                }
            }
            TokenKind::BoolLiteral => ResolvedType::numeric(NumericType::Bool),
            _ => ResolvedType::numeric(NumericType::Int8).create_pointer().add_const(),
        }
    }

    fn require_numeric(&mut self, ty: &ResolvedType, at: &Token) -> Option<NumericType> {
        match ty.numeric_value() {
            Some(n) => Some(n),
            None => {
                self.handler
                    .error(at, "operand must be a numeric value");
                self.failed = true;
                None
            }
        }
    }

    fn require_assignable(&mut self, target: &Expression, ty: &ResolvedType, at: &Token) {
        if ty.is_const {
            let name = match target {
                Expression::Variable(t) => t.lexeme.clone(),
                _ => "expression".to_string(),
            };
            self.handler
                .error(at, format!("cannot write to read-only '{}'", name));
            self.failed = true;
        }
    }
}

fn anchor(expression: &Expression) -> Option<&Token> {
    match expression {
        Expression::Literal(t) | Expression::Variable(t) => Some(t),
        Expression::Unary { op, .. } | Expression::IncDec { op, .. } => Some(op),
        Expression::Binary { op, .. } | Expression::Assignment { op, .. } => Some(op),
        Expression::Call { paren, .. } => Some(paren),
        Expression::Grouped(inner) => anchor(inner),
        Expression::Subscript { array, .. } => anchor(array),
        Expression::Cast { operand, .. } => anchor(operand),
        Expression::Conditional { condition, .. } => anchor(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvSymbol;
    use crate::parser::parse_statements;
    use crate::scanner::scan;
    use ahash::AHashMap;

    struct MapEnv {
        symbols: AHashMap<String, EnvSymbol>,
        used: Vec<String>,
    }

    impl MapEnv {
        fn new(entries: &[(&str, ResolvedType)]) -> Self {
            let symbols = entries
                .iter()
                .map(|(n, t)| {
                    (
                        n.to_string(),
                        EnvSymbol {
                            ty: t.clone(),
                            expansion: n.to_string(),
                        },
                    )
                })
                .collect();
            Self {
                symbols,
                used: Vec::new(),
            }
        }
    }

    impl Environment for MapEnv {
        fn lookup(&mut self, name: &str) -> Option<EnvSymbol> {
            let symbol = self.symbols.get(name).cloned();
            if symbol.is_some() && !self.used.iter().any(|u| u == name) {
                self.used.push(name.to_string());
            }
            symbol
        }
    }

    fn check(src: &str, env: &mut MapEnv) -> Result<(), CheckFailed> {
        let ctx = TypeContext::default();
        let tokens = scan(src, "test").unwrap();
        let mut handler = ErrorHandler::new("test");
        let statements = parse_statements(&tokens, &mut handler).unwrap();
        type_check_statements(&statements, &ctx, env, &mut handler)
    }

    fn scalar() -> ResolvedType {
        TypeContext::default().scalar_type()
    }

    #[test]
    fn test_resolves_environment_names() {
        let mut env = MapEnv::new(&[("V", scalar()), ("Isyn", scalar().add_const())]);
        assert!(check("V += Isyn;", &mut env).is_ok());
        assert_eq!(env.used, vec!["V", "Isyn"]);
    }

    #[test]
    fn test_undefined_identifier() {
        let mut env = MapEnv::new(&[("V", scalar())]);
        assert!(check("V = W;", &mut env).is_err());
    }

    #[test]
    fn test_write_to_read_only_rejected() {
        let mut env = MapEnv::new(&[("Isyn", scalar().add_const())]);
        assert!(check("Isyn = 0.0;", &mut env).is_err());
    }

    #[test]
    fn test_function_arity_checked() {
        let f = ResolvedType::function(scalar(), vec![scalar()]);
        let mut env = MapEnv::new(&[("exp", f), ("V", scalar())]);
        assert!(check("V = exp(V);", &mut env).is_ok());
        assert!(check("V = exp(V, V);", &mut env).is_err());
    }

    #[test]
    fn test_locals_shadow_environment() {
        let mut env = MapEnv::new(&[("V", scalar().add_const())]);
        // The local V is writable even though the captured V is not
        assert!(check("{ scalar V = 1.0; V = 2.0; }", &mut env).is_ok());
    }

    #[test]
    fn test_subscript_requires_pointer() {
        let mut env = MapEnv::new(&[("g", scalar().create_pointer()), ("x", scalar())]);
        assert!(check("g[0] = 1.0;", &mut env).is_ok());
        assert!(check("x[0] = 1.0;", &mut env).is_err());
    }

    #[test]
    fn test_bitwise_requires_integral() {
        let mut env = MapEnv::new(&[("x", scalar())]);
        assert!(check("x = x & 1;", &mut env).is_err());
    }
}
