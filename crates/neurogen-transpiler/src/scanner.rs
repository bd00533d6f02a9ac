// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Scanner for the embedded model-code DSL.
//!
//! Recognises C-like arithmetic, comparison and assignment operators,
//! call syntax, block braces, integer / floating (optional `f` suffix) /
//! string literals, line comments, and the reserved `$(name)` sigil form
//! accepted as an alias for a bare identifier to keep legacy model code
//! scanning.

use crate::error::ScanError;
use crate::token::{Token, TokenKind};

const TYPE_SPECIFIERS: &[&str] = &[
    "bool", "char", "short", "int", "long", "float", "double", "signed", "unsigned", "scalar",
    "timepoint", "int8_t", "uint8_t", "int16_t", "uint16_t", "int32_t", "uint32_t", "int64_t",
    "uint64_t", "size_t",
];

struct Scanner<'a> {
    source: &'a [u8],
    context: String,
    start: usize,
    current: usize,
    line: u32,
    column: u32,
    start_column: u32,
    tokens: Vec<Token>,
}

/// Scan a fragment into a token stream. The `context` names the
/// fragment for diagnostics.
pub fn scan(source: &str, context: &str) -> Result<Vec<Token>, ScanError> {
    let mut scanner = Scanner {
        source: source.as_bytes(),
        context: context.to_string(),
        start: 0,
        current: 0,
        line: 1,
        column: 1,
        start_column: 1,
        tokens: Vec::new(),
    };
    scanner.run()?;
    Ok(scanner.tokens)
}

impl<'a> Scanner<'a> {
    fn run(&mut self) -> Result<(), ScanError> {
        while !self.at_end() {
            self.start = self.current;
            self.start_column = self.column;
            self.scan_token()?;
        }
        self.tokens
            .push(Token::new(TokenKind::Eof, "", self.line, self.column));
        Ok(())
    }

    fn scan_token(&mut self) -> Result<(), ScanError> {
        let c = self.advance();
        match c {
            b' ' | b'\r' | b'\t' => {}
            b'\n' => {
                self.line += 1;
                self.column = 1;
            }
            b'(' => self.add(TokenKind::LeftParen),
            b')' => self.add(TokenKind::RightParen),
            b'{' => self.add(TokenKind::LeftBrace),
            b'}' => self.add(TokenKind::RightBrace),
            b'[' => self.add(TokenKind::LeftBracket),
            b']' => self.add(TokenKind::RightBracket),
            b',' => self.add(TokenKind::Comma),
            b';' => self.add(TokenKind::Semicolon),
            b':' => self.add(TokenKind::Colon),
            b'?' => self.add(TokenKind::Question),
            b'~' => self.add(TokenKind::Tilde),
            b'+' => {
                if self.matches(b'=') {
                    self.add(TokenKind::PlusEqual);
                } else if self.matches(b'+') {
                    self.add(TokenKind::PlusPlus);
                } else {
                    self.add(TokenKind::Plus);
                }
            }
            b'-' => {
                if self.matches(b'=') {
                    self.add(TokenKind::MinusEqual);
                } else if self.matches(b'-') {
                    self.add(TokenKind::MinusMinus);
                } else {
                    self.add(TokenKind::Minus);
                }
            }
            b'*' => {
                if self.matches(b'=') {
                    self.add(TokenKind::StarEqual);
                } else {
                    self.add(TokenKind::Star);
                }
            }
            b'/' => {
                if self.matches(b'/') {
                    // Line comment, discarded
                    while !self.at_end() && self.peek() != b'\n' {
                        self.advance();
                    }
                } else if self.matches(b'=') {
                    self.add(TokenKind::SlashEqual);
                } else {
                    self.add(TokenKind::Slash);
                }
            }
            b'%' => {
                if self.matches(b'=') {
                    self.add(TokenKind::PercentEqual);
                } else {
                    self.add(TokenKind::Percent);
                }
            }
            b'&' => {
                if self.matches(b'&') {
                    self.add(TokenKind::AmpersandAmpersand);
                } else if self.matches(b'=') {
                    self.add(TokenKind::AmpersandEqual);
                } else {
                    self.add(TokenKind::Ampersand);
                }
            }
            b'|' => {
                if self.matches(b'|') {
                    self.add(TokenKind::PipePipe);
                } else if self.matches(b'=') {
                    self.add(TokenKind::PipeEqual);
                } else {
                    self.add(TokenKind::Pipe);
                }
            }
            b'^' => {
                if self.matches(b'=') {
                    self.add(TokenKind::CaretEqual);
                } else {
                    self.add(TokenKind::Caret);
                }
            }
            b'!' => {
                if self.matches(b'=') {
                    self.add(TokenKind::NotEqual);
                } else {
                    self.add(TokenKind::Not);
                }
            }
            b'=' => {
                if self.matches(b'=') {
                    self.add(TokenKind::EqualEqual);
                } else {
                    self.add(TokenKind::Equal);
                }
            }
            b'<' => {
                if self.matches(b'=') {
                    self.add(TokenKind::LessEqual);
                } else if self.matches(b'<') {
                    if self.matches(b'=') {
                        self.add(TokenKind::ShiftLeftEqual);
                    } else {
                        self.add(TokenKind::ShiftLeft);
                    }
                } else {
                    self.add(TokenKind::Less);
                }
            }
            b'>' => {
                if self.matches(b'=') {
                    self.add(TokenKind::GreaterEqual);
                } else if self.matches(b'>') {
                    if self.matches(b'=') {
                        self.add(TokenKind::ShiftRightEqual);
                    } else {
                        self.add(TokenKind::ShiftRight);
                    }
                } else {
                    self.add(TokenKind::Greater);
                }
            }
            b'"' => self.string()?,
            b'$' => self.sigil()?,
            b'0'..=b'9' => self.number()?,
            c if c == b'_' || c.is_ascii_alphabetic() => self.identifier(),
            other => {
                return Err(self.error(format!("unexpected character '{}'", other as char)));
            }
        }
        Ok(())
    }

    // $(name) is accepted as an alias for the bare identifier `name`
    fn sigil(&mut self) -> Result<(), ScanError> {
        if !self.matches(b'(') {
            return Err(self.error("expected '(' after '$'".to_string()));
        }
        let name_start = self.current;
        while !self.at_end() && (self.peek() == b'_' || self.peek().is_ascii_alphanumeric()) {
            self.advance();
        }
        if self.current == name_start {
            return Err(self.error("empty '$()' reference".to_string()));
        }
        let name = std::str::from_utf8(&self.source[name_start..self.current])
            .unwrap()
            .to_string();
        if !self.matches(b')') {
            return Err(self.error(format!("unterminated '$({}' reference", name)));
        }
        self.tokens.push(Token::new(
            TokenKind::Identifier,
            name,
            self.line,
            self.start_column,
        ));
        Ok(())
    }

    fn string(&mut self) -> Result<(), ScanError> {
        while !self.at_end() && self.peek() != b'"' {
            if self.peek() == b'\n' {
                return Err(self.error("unterminated string literal".to_string()));
            }
            self.advance();
        }
        if self.at_end() {
            return Err(self.error("unterminated string literal".to_string()));
        }
        self.advance(); // closing quote
        self.add(TokenKind::StringLiteral);
        Ok(())
    }

    fn number(&mut self) -> Result<(), ScanError> {
        // Hex literal
        if self.source[self.start] == b'0' && (self.peek() == b'x' || self.peek() == b'X') {
            self.advance();
            while !self.at_end() && self.peek().is_ascii_hexdigit() {
                self.advance();
            }
            self.add(TokenKind::IntLiteral);
            return Ok(());
        }

        while !self.at_end() && self.peek().is_ascii_digit() {
            self.advance();
        }

        let mut floating = false;
        if !self.at_end() && self.peek() == b'.' {
            floating = true;
            self.advance();
            while !self.at_end() && self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        if !self.at_end() && (self.peek() == b'e' || self.peek() == b'E') {
            floating = true;
            self.advance();
            if !self.at_end() && (self.peek() == b'+' || self.peek() == b'-') {
                self.advance();
            }
            if self.at_end() || !self.peek().is_ascii_digit() {
                return Err(self.error("malformed exponent".to_string()));
            }
            while !self.at_end() && self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        // Optional single-precision suffix
        if !self.at_end() && (self.peek() == b'f' || self.peek() == b'F') {
            floating = true;
            self.advance();
        }
        // Unsigned suffix on integers
        if !floating && !self.at_end() && (self.peek() == b'u' || self.peek() == b'U') {
            self.advance();
        }

        self.add(if floating {
            TokenKind::FloatLiteral
        } else {
            TokenKind::IntLiteral
        });
        Ok(())
    }

    fn identifier(&mut self) {
        while !self.at_end() && (self.peek() == b'_' || self.peek().is_ascii_alphanumeric()) {
            self.advance();
        }
        let lexeme = std::str::from_utf8(&self.source[self.start..self.current]).unwrap();
        let kind = match lexeme {
            "const" => TokenKind::Const,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "for" => TokenKind::For,
            "while" => TokenKind::While,
            "do" => TokenKind::Do,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "true" | "false" => TokenKind::BoolLiteral,
            s if TYPE_SPECIFIERS.contains(&s) => TokenKind::TypeSpecifier,
            _ => TokenKind::Identifier,
        };
        self.add(kind);
    }

    fn add(&mut self, kind: TokenKind) {
        let lexeme = std::str::from_utf8(&self.source[self.start..self.current]).unwrap();
        self.tokens
            .push(Token::new(kind, lexeme, self.line, self.start_column));
    }

    fn error(&self, message: String) -> ScanError {
        ScanError {
            context: self.context.clone(),
            line: self.line,
            column: self.start_column,
            message,
        }
    }

    fn advance(&mut self) -> u8 {
        let c = self.source[self.current];
        self.current += 1;
        self.column += 1;
        c
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.at_end() || self.source[self.current] != expected {
            false
        } else {
            self.current += 1;
            self.column += 1;
            true
        }
    }

    fn peek(&self) -> u8 {
        self.source[self.current]
    }

    fn at_end(&self) -> bool {
        self.current >= self.source.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        scan(src, "test").unwrap().iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_scan_arithmetic() {
        assert_eq!(
            kinds("V += Isyn * 0.5f;"),
            vec![
                TokenKind::Identifier,
                TokenKind::PlusEqual,
                TokenKind::Identifier,
                TokenKind::Star,
                TokenKind::FloatLiteral,
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_sigil_aliases_identifier() {
        let tokens = scan("$(V) = $(Vrest);", "test").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Identifier);
        assert_eq!(tokens[0].lexeme, "V");
        assert_eq!(tokens[2].lexeme, "Vrest");
    }

    #[test]
    fn test_line_comment_discarded() {
        let tokens = scan("x = 1; // reset\ny = 2;", "test").unwrap();
        let lexemes: Vec<&str> = tokens.iter().map(|t| t.lexeme.as_str()).collect();
        assert!(!lexemes.iter().any(|l| l.contains("reset")));
        assert_eq!(tokens.iter().filter(|t| t.kind == TokenKind::Semicolon).count(), 2);
    }

    #[test]
    fn test_source_locations() {
        let tokens = scan("a;\n  b;", "test").unwrap();
        let b = tokens.iter().find(|t| t.lexeme == "b").unwrap();
        assert_eq!(b.line, 2);
        assert_eq!(b.column, 3);
    }

    #[test]
    fn test_type_specifiers() {
        let tokens = scan("const unsigned int i = 0;", "test").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Const);
        assert_eq!(tokens[1].kind, TokenKind::TypeSpecifier);
        assert_eq!(tokens[2].kind, TokenKind::TypeSpecifier);
    }

    #[test]
    fn test_unterminated_sigil_fails() {
        let err = scan("$(V", "Neuron group 'N' sim code").unwrap_err();
        assert_eq!(err.context, "Neuron group 'N' sim code");
    }

    #[test]
    fn test_float_exponent_forms() {
        assert_eq!(kinds("1e-3;")[0], TokenKind::FloatLiteral);
        assert_eq!(kinds("2.5E+4f;")[0], TokenKind::FloatLiteral);
        assert_eq!(kinds("0x1F;")[0], TokenKind::IntLiteral);
    }
}
