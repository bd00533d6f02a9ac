// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Recursive-descent parser for the embedded DSL.
//!
//! Statement grammar is a C subset: expression statements, declarations,
//! `if`/`else`, `for`, `while`, `do`, compound blocks, `break` and
//! `continue`. There are no implicit semicolons; a missing terminator is
//! a diagnostic, not a recovery point.

use crate::error::ErrorHandler;
use crate::token::{Token, TokenKind};

/// Expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Token),
    Variable(Token),
    Unary {
        op: Token,
        operand: Box<Expression>,
    },
    /// `++x`, `x--` and friends
    IncDec {
        op: Token,
        target: Box<Expression>,
        prefix: bool,
    },
    Binary {
        left: Box<Expression>,
        op: Token,
        right: Box<Expression>,
    },
    Assignment {
        target: Box<Expression>,
        op: Token,
        value: Box<Expression>,
    },
    Conditional {
        condition: Box<Expression>,
        then_value: Box<Expression>,
        else_value: Box<Expression>,
    },
    Call {
        callee: Box<Expression>,
        /// Token of the opening parenthesis, for diagnostics
        paren: Token,
        args: Vec<Expression>,
    },
    Subscript {
        array: Box<Expression>,
        index: Box<Expression>,
    },
    /// C-style cast: `(int)x`
    Cast {
        type_tokens: Vec<Token>,
        operand: Box<Expression>,
    },
    Grouped(Box<Expression>),
}

/// Statement tree
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Expression(Expression),
    /// `const? type a = x, b;`
    VarDeclaration {
        is_const: bool,
        type_tokens: Vec<Token>,
        declarators: Vec<(Token, Option<Expression>)>,
    },
    If {
        condition: Expression,
        then_branch: Box<Statement>,
        else_branch: Option<Box<Statement>>,
    },
    For {
        init: Option<Box<Statement>>,
        condition: Option<Expression>,
        increment: Option<Expression>,
        body: Box<Statement>,
    },
    While {
        condition: Expression,
        body: Box<Statement>,
    },
    Do {
        body: Box<Statement>,
        condition: Expression,
    },
    Compound(Vec<Statement>),
    Break(Token),
    Continue(Token),
    Empty,
}

/// Marker returned when a fragment failed to parse; diagnostics live in
/// the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseFailed;

struct Parser<'a> {
    tokens: &'a [Token],
    current: usize,
    handler: &'a mut ErrorHandler,
}

/// Parse a statement sequence (a code fragment body)
pub fn parse_statements(
    tokens: &[Token],
    handler: &mut ErrorHandler,
) -> Result<Vec<Statement>, ParseFailed> {
    let mut parser = Parser {
        tokens,
        current: 0,
        handler,
    };
    let mut statements = Vec::new();
    while !parser.at_end() {
        statements.push(parser.statement()?);
    }
    if parser.handler.has_errors() {
        Err(ParseFailed)
    } else {
        Ok(statements)
    }
}

/// Parse a single expression (threshold / event conditions)
pub fn parse_expression(
    tokens: &[Token],
    handler: &mut ErrorHandler,
) -> Result<Expression, ParseFailed> {
    let mut parser = Parser {
        tokens,
        current: 0,
        handler,
    };
    let expr = parser.expression()?;
    if !parser.at_end() {
        let tok = parser.peek().clone();
        parser.handler.error(&tok, "unexpected trailing tokens");
        return Err(ParseFailed);
    }
    if parser.handler.has_errors() {
        Err(ParseFailed)
    } else {
        Ok(expr)
    }
}

impl<'a> Parser<'a> {
    // ---- statements -------------------------------------------------

    fn statement(&mut self) -> Result<Statement, ParseFailed> {
        match self.peek().kind {
            TokenKind::Semicolon => {
                self.advance();
                Ok(Statement::Empty)
            }
            TokenKind::LeftBrace => self.compound(),
            TokenKind::If => self.if_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::Do => self.do_statement(),
            TokenKind::Break => {
                let tok = self.advance().clone();
                self.consume(TokenKind::Semicolon, "expected ';' after 'break'")?;
                Ok(Statement::Break(tok))
            }
            TokenKind::Continue => {
                let tok = self.advance().clone();
                self.consume(TokenKind::Semicolon, "expected ';' after 'continue'")?;
                Ok(Statement::Continue(tok))
            }
            TokenKind::Const | TokenKind::TypeSpecifier => self.declaration(),
            _ => {
                let expr = self.expression()?;
                self.consume(TokenKind::Semicolon, "expected ';' after expression")?;
                Ok(Statement::Expression(expr))
            }
        }
    }

    fn compound(&mut self) -> Result<Statement, ParseFailed> {
        self.consume(TokenKind::LeftBrace, "expected '{'")?;
        let mut statements = Vec::new();
        while self.peek().kind != TokenKind::RightBrace && !self.at_end() {
            statements.push(self.statement()?);
        }
        self.consume(TokenKind::RightBrace, "expected '}' to close block")?;
        Ok(Statement::Compound(statements))
    }

    fn declaration(&mut self) -> Result<Statement, ParseFailed> {
        let mut is_const = false;
        while self.peek().kind == TokenKind::Const {
            is_const = true;
            self.advance();
        }
        let mut type_tokens = Vec::new();
        while self.peek().kind == TokenKind::TypeSpecifier {
            type_tokens.push(self.advance().clone());
        }
        if type_tokens.is_empty() {
            let tok = self.peek().clone();
            self.handler.error(&tok, "expected type name in declaration");
            return Err(ParseFailed);
        }

        let mut declarators = Vec::new();
        loop {
            let name = self
                .consume(TokenKind::Identifier, "expected variable name")?
                .clone();
            let init = if self.peek().kind == TokenKind::Equal {
                self.advance();
                Some(self.assignment()?)
            } else {
                None
            };
            declarators.push((name, init));
            if self.peek().kind != TokenKind::Comma {
                break;
            }
            self.advance();
        }
        self.consume(TokenKind::Semicolon, "expected ';' after declaration")?;
        Ok(Statement::VarDeclaration {
            is_const,
            type_tokens,
            declarators,
        })
    }

    fn if_statement(&mut self) -> Result<Statement, ParseFailed> {
        self.advance();
        self.consume(TokenKind::LeftParen, "expected '(' after 'if'")?;
        let condition = self.expression()?;
        self.consume(TokenKind::RightParen, "expected ')' after condition")?;
        let then_branch = Box::new(self.statement()?);
        let else_branch = if self.peek().kind == TokenKind::Else {
            self.advance();
            Some(Box::new(self.statement()?))
        } else {
            None
        };
        Ok(Statement::If {
            condition,
            then_branch,
            else_branch,
        })
    }

    fn for_statement(&mut self) -> Result<Statement, ParseFailed> {
        self.advance();
        self.consume(TokenKind::LeftParen, "expected '(' after 'for'")?;

        let init = match self.peek().kind {
            TokenKind::Semicolon => {
                self.advance();
                None
            }
            TokenKind::Const | TokenKind::TypeSpecifier => Some(Box::new(self.declaration()?)),
            _ => {
                let expr = self.expression()?;
                self.consume(TokenKind::Semicolon, "expected ';' after for-initialiser")?;
                Some(Box::new(Statement::Expression(expr)))
            }
        };

        let condition = if self.peek().kind == TokenKind::Semicolon {
            None
        } else {
            Some(self.expression()?)
        };
        self.consume(TokenKind::Semicolon, "expected ';' after for-condition")?;

        let increment = if self.peek().kind == TokenKind::RightParen {
            None
        } else {
            Some(self.expression()?)
        };
        self.consume(TokenKind::RightParen, "expected ')' after for-clauses")?;

        let body = Box::new(self.statement()?);
        Ok(Statement::For {
            init,
            condition,
            increment,
            body,
        })
    }

    fn while_statement(&mut self) -> Result<Statement, ParseFailed> {
        self.advance();
        self.consume(TokenKind::LeftParen, "expected '(' after 'while'")?;
        let condition = self.expression()?;
        self.consume(TokenKind::RightParen, "expected ')' after condition")?;
        let body = Box::new(self.statement()?);
        Ok(Statement::While { condition, body })
    }

    fn do_statement(&mut self) -> Result<Statement, ParseFailed> {
        self.advance();
        let body = Box::new(self.statement()?);
        self.consume(TokenKind::While, "expected 'while' after do-body")?;
        self.consume(TokenKind::LeftParen, "expected '(' after 'while'")?;
        let condition = self.expression()?;
        self.consume(TokenKind::RightParen, "expected ')' after condition")?;
        self.consume(TokenKind::Semicolon, "expected ';' after do-while")?;
        Ok(Statement::Do { body, condition })
    }

    // ---- expressions ------------------------------------------------

    fn expression(&mut self) -> Result<Expression, ParseFailed> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Expression, ParseFailed> {
        let expr = self.conditional()?;
        if self.peek().kind.is_assignment() {
            let op = self.advance().clone();
            let value = self.assignment()?;
            if !matches!(
                expr,
                Expression::Variable(_) | Expression::Subscript { .. }
            ) {
                self.handler.error(&op, "invalid assignment target");
                return Err(ParseFailed);
            }
            return Ok(Expression::Assignment {
                target: Box::new(expr),
                op,
                value: Box::new(value),
            });
        }
        Ok(expr)
    }

    fn conditional(&mut self) -> Result<Expression, ParseFailed> {
        let condition = self.logical_or()?;
        if self.peek().kind == TokenKind::Question {
            self.advance();
            let then_value = self.expression()?;
            self.consume(TokenKind::Colon, "expected ':' in conditional expression")?;
            let else_value = self.conditional()?;
            return Ok(Expression::Conditional {
                condition: Box::new(condition),
                then_value: Box::new(then_value),
                else_value: Box::new(else_value),
            });
        }
        Ok(condition)
    }

    fn logical_or(&mut self) -> Result<Expression, ParseFailed> {
        self.binary_level(&[TokenKind::PipePipe], Self::logical_and)
    }

    fn logical_and(&mut self) -> Result<Expression, ParseFailed> {
        self.binary_level(&[TokenKind::AmpersandAmpersand], Self::bitwise_or)
    }

    fn bitwise_or(&mut self) -> Result<Expression, ParseFailed> {
        self.binary_level(&[TokenKind::Pipe], Self::bitwise_xor)
    }

    fn bitwise_xor(&mut self) -> Result<Expression, ParseFailed> {
        self.binary_level(&[TokenKind::Caret], Self::bitwise_and)
    }

    fn bitwise_and(&mut self) -> Result<Expression, ParseFailed> {
        self.binary_level(&[TokenKind::Ampersand], Self::equality)
    }

    fn equality(&mut self) -> Result<Expression, ParseFailed> {
        self.binary_level(
            &[TokenKind::EqualEqual, TokenKind::NotEqual],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> Result<Expression, ParseFailed> {
        self.binary_level(
            &[
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
            ],
            Self::shift,
        )
    }

    fn shift(&mut self) -> Result<Expression, ParseFailed> {
        self.binary_level(&[TokenKind::ShiftLeft, TokenKind::ShiftRight], Self::term)
    }

    fn term(&mut self) -> Result<Expression, ParseFailed> {
        self.binary_level(&[TokenKind::Plus, TokenKind::Minus], Self::factor)
    }

    fn factor(&mut self) -> Result<Expression, ParseFailed> {
        self.binary_level(
            &[TokenKind::Star, TokenKind::Slash, TokenKind::Percent],
            Self::unary,
        )
    }

    fn binary_level(
        &mut self,
        ops: &[TokenKind],
        next: fn(&mut Self) -> Result<Expression, ParseFailed>,
    ) -> Result<Expression, ParseFailed> {
        let mut expr = next(self)?;
        while ops.contains(&self.peek().kind) {
            let op = self.advance().clone();
            let right = next(self)?;
            expr = Expression::Binary {
                left: Box::new(expr),
                op,
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<Expression, ParseFailed> {
        // A parenthesised type specifier is a cast, not a grouping
        if self.peek().kind == TokenKind::LeftParen
            && self.peek_next().kind == TokenKind::TypeSpecifier
        {
            self.advance();
            let mut type_tokens = Vec::new();
            while self.peek().kind == TokenKind::TypeSpecifier {
                type_tokens.push(self.advance().clone());
            }
            self.consume(TokenKind::RightParen, "expected ')' after cast type")?;
            let operand = self.unary()?;
            return Ok(Expression::Cast {
                type_tokens,
                operand: Box::new(operand),
            });
        }
        match self.peek().kind {
            TokenKind::Minus | TokenKind::Plus | TokenKind::Not | TokenKind::Tilde => {
                let op = self.advance().clone();
                let operand = self.unary()?;
                Ok(Expression::Unary {
                    op,
                    operand: Box::new(operand),
                })
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                let op = self.advance().clone();
                let target = self.unary()?;
                Ok(Expression::IncDec {
                    op,
                    target: Box::new(target),
                    prefix: true,
                })
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expression, ParseFailed> {
        let mut expr = self.primary()?;
        loop {
            match self.peek().kind {
                TokenKind::LeftParen => {
                    let paren = self.advance().clone();
                    let mut args = Vec::new();
                    if self.peek().kind != TokenKind::RightParen {
                        loop {
                            args.push(self.assignment()?);
                            if self.peek().kind != TokenKind::Comma {
                                break;
                            }
                            self.advance();
                        }
                    }
                    self.consume(TokenKind::RightParen, "expected ')' after arguments")?;
                    expr = Expression::Call {
                        callee: Box::new(expr),
                        paren,
                        args,
                    };
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let index = self.expression()?;
                    self.consume(TokenKind::RightBracket, "expected ']' after subscript")?;
                    expr = Expression::Subscript {
                        array: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                TokenKind::PlusPlus | TokenKind::MinusMinus => {
                    let op = self.advance().clone();
                    expr = Expression::IncDec {
                        op,
                        target: Box::new(expr),
                        prefix: false,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expression, ParseFailed> {
        match self.peek().kind {
            TokenKind::IntLiteral
            | TokenKind::FloatLiteral
            | TokenKind::StringLiteral
            | TokenKind::BoolLiteral => Ok(Expression::Literal(self.advance().clone())),
            TokenKind::Identifier => Ok(Expression::Variable(self.advance().clone())),
            TokenKind::LeftParen => {
                self.advance();
                let expr = self.expression()?;
                self.consume(TokenKind::RightParen, "expected ')' after expression")?;
                Ok(Expression::Grouped(Box::new(expr)))
            }
            _ => {
                let tok = self.peek().clone();
                self.handler
                    .error(&tok, format!("expected expression, found {}", tok));
                Err(ParseFailed)
            }
        }
    }

    // ---- plumbing ---------------------------------------------------

    fn consume(&mut self, kind: TokenKind, message: &str) -> Result<&Token, ParseFailed> {
        if self.peek().kind == kind {
            Ok(self.advance())
        } else {
            let tok = self.peek().clone();
            self.handler.error(&tok, message);
            Err(ParseFailed)
        }
    }

    fn advance(&mut self) -> &Token {
        let tok = &self.tokens[self.current];
        if tok.kind != TokenKind::Eof {
            self.current += 1;
        }
        tok
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    fn peek_next(&self) -> &Token {
        if self.tokens[self.current].kind == TokenKind::Eof {
            &self.tokens[self.current]
        } else {
            &self.tokens[self.current + 1]
        }
    }

    fn at_end(&self) -> bool {
        self.tokens[self.current].kind == TokenKind::Eof
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::scan;

    fn parse(src: &str) -> Vec<Statement> {
        let tokens = scan(src, "test").unwrap();
        let mut handler = ErrorHandler::new("test");
        parse_statements(&tokens, &mut handler).unwrap()
    }

    #[test]
    fn test_parse_assignment_statement() {
        let stmts = parse("V = V + Isyn;");
        assert_eq!(stmts.len(), 1);
        assert!(matches!(
            stmts[0],
            Statement::Expression(Expression::Assignment { .. })
        ));
    }

    #[test]
    fn test_parse_declaration_with_initialiser() {
        let stmts = parse("const scalar alpha = exp(1.0) / tau;");
        match &stmts[0] {
            Statement::VarDeclaration {
                is_const,
                declarators,
                ..
            } => {
                assert!(is_const);
                assert_eq!(declarators.len(), 1);
                assert_eq!(declarators[0].0.lexeme, "alpha");
                assert!(declarators[0].1.is_some());
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_parse_if_else() {
        let stmts = parse("if (V >= Vthresh) { V = Vreset; } else { U += d; }");
        assert!(matches!(
            stmts[0],
            Statement::If {
                else_branch: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn test_parse_for_loop() {
        let stmts = parse("for (unsigned int i = 0; i < num; i++) { total += w[i]; }");
        assert!(matches!(stmts[0], Statement::For { .. }));
    }

    #[test]
    fn test_missing_semicolon_is_error() {
        let tokens = scan("V = 1", "test").unwrap();
        let mut handler = ErrorHandler::new("Neuron group 'N' sim code");
        assert!(parse_statements(&tokens, &mut handler).is_err());
        assert!(handler.has_errors());
        assert_eq!(handler.diagnostics()[0].context, "Neuron group 'N' sim code");
    }

    #[test]
    fn test_parse_condition_expression() {
        let tokens = scan("V >= 30.0f && !refrac", "test").unwrap();
        let mut handler = ErrorHandler::new("test");
        let expr = parse_expression(&tokens, &mut handler).unwrap();
        assert!(matches!(expr, Expression::Binary { .. }));
    }

    #[test]
    fn test_assignment_to_literal_rejected() {
        let tokens = scan("3 = x;", "test").unwrap();
        let mut handler = ErrorHandler::new("test");
        assert!(parse_statements(&tokens, &mut handler).is_err());
    }

    #[test]
    fn test_conditional_expression() {
        let tokens = scan("x > 0 ? x : -x", "test").unwrap();
        let mut handler = ErrorHandler::new("test");
        let expr = parse_expression(&tokens, &mut handler).unwrap();
        assert!(matches!(expr, Expression::Conditional { .. }));
    }

    #[test]
    fn test_cast_expression() {
        let tokens = scan("(unsigned int)(u * scale)", "test").unwrap();
        let mut handler = ErrorHandler::new("test");
        let expr = parse_expression(&tokens, &mut handler).unwrap();
        match expr {
            Expression::Cast { type_tokens, .. } => {
                assert_eq!(type_tokens.len(), 2);
            }
            other => panic!("expected cast, got {:?}", other),
        }
    }
}
