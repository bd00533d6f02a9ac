// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Indented output stream for generated source.

/// Accumulates generated source with brace-scoped indentation
#[derive(Debug, Default)]
pub struct CodeStream {
    out: String,
    indent: usize,
}

impl CodeStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write one line at the current indentation
    pub fn line(&mut self, text: impl AsRef<str>) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    /// Write pre-formatted multi-line text, re-indenting each line
    pub fn raw(&mut self, text: &str) {
        for line in text.lines() {
            if line.is_empty() {
                self.out.push('\n');
            } else {
                self.line(line);
            }
        }
    }

    pub fn blank(&mut self) {
        self.out.push('\n');
    }

    /// Open a brace scope: `prefix {`
    pub fn open(&mut self, prefix: &str) {
        if prefix.is_empty() {
            self.line("{");
        } else {
            self.line(format!("{} {{", prefix));
        }
        self.indent += 1;
    }

    /// Close the innermost brace scope
    pub fn close(&mut self) {
        self.indent = self.indent.saturating_sub(1);
        self.line("}");
    }

    /// Close with a trailing suffix, e.g. `};`
    pub fn close_with(&mut self, suffix: &str) {
        self.indent = self.indent.saturating_sub(1);
        self.line(format!("}}{}", suffix));
    }

    pub fn indent_level(&self) -> usize {
        self.indent
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.out
    }

    pub fn into_string(self) -> String {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_indentation() {
        let mut stream = CodeStream::new();
        stream.open("if (spiked)");
        stream.line("count++;");
        stream.close();
        assert_eq!(stream.as_str(), "if (spiked) {\n    count++;\n}\n");
    }

    #[test]
    fn test_raw_reindents() {
        let mut stream = CodeStream::new();
        stream.open("");
        stream.raw("a;\nb;\n");
        stream.close();
        assert_eq!(stream.as_str(), "{\n    a;\n    b;\n}\n");
    }
}
