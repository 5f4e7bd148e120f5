//! Structural parser for PHP-style template sources.
//!
//! This is not a full grammar. It splits a file into inline markup and code,
//! tracks strings, comments, heredocs and bracket nesting, and reports the
//! top-level statements. Input is handled as raw bytes so files in any
//! encoding can be inspected.

use thiserror::Error;

/// A top-level statement of a parsed file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Literal text outside the open/close tags
    InlineHtml(String),
    /// Anything the interpreter would execute, including `<?=` echoes
    Code(String),
}

impl Statement {
    /// True for statements that only carry literal markup
    pub fn is_inert(&self) -> bool {
        matches!(self, Statement::InlineHtml(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unterminated string starting at byte {0}")]
    UnterminatedString(usize),

    #[error("unterminated comment starting at byte {0}")]
    UnterminatedComment(usize),

    #[error("unterminated heredoc starting at byte {0}")]
    UnterminatedHeredoc(usize),

    #[error("unexpected '{found}' at byte {offset}")]
    UnbalancedBracket { found: char, offset: usize },

    #[error("unclosed '{0}' at end of file")]
    UnclosedBracket(char),

    #[error("unterminated statement at end of file")]
    UnterminatedStatement,
}

const HALT_COMPILER: &[u8] = b"__halt_compiler";

/// Does the content contain an opening code tag (`<?php` or `<?=`)?
pub fn has_open_tag(src: &[u8]) -> bool {
    find_open_tag(src, 0).is_some()
}

/// Parse `src` into its top-level statements.
pub fn parse(src: &[u8]) -> Result<Vec<Statement>, ParseError> {
    Parser::new(src).run()
}

/// Location of the next open tag at or after `from`:
/// (tag start, bytes consumed by the tag, is `<?=`)
fn find_open_tag(src: &[u8], from: usize) -> Option<(usize, usize, bool)> {
    let mut i = from;
    while i + 1 < src.len() {
        if src[i] == b'<' && src[i + 1] == b'?' {
            let rest = &src[i + 2..];
            if rest.first() == Some(&b'=') {
                return Some((i, 3, true));
            }
            if rest.len() >= 3 && rest[..3].eq_ignore_ascii_case(b"php") {
                match rest.get(3) {
                    None => return Some((i, 5, false)),
                    Some(c) if c.is_ascii_whitespace() => return Some((i, 6, false)),
                    _ => {}
                }
            }
        }
        i += 1;
    }
    None
}

fn is_ident_start(b: u8) -> bool {
    b == b'_' || b.is_ascii_alphabetic() || b >= 0x80
}

fn is_ident_char(b: u8) -> bool {
    is_ident_start(b) || b.is_ascii_digit()
}

fn closing_for(open: u8) -> u8 {
    match open {
        b'(' => b')',
        b'[' => b']',
        _ => b'}',
    }
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    in_code: bool,
    stack: Vec<u8>,
    stmt_start: Option<usize>,
    statements: Vec<Statement>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a [u8]) -> Self {
        Self {
            src,
            pos: 0,
            in_code: false,
            stack: Vec::new(),
            stmt_start: None,
            statements: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Vec<Statement>, ParseError> {
        while self.pos < self.src.len() {
            if self.in_code {
                if self.step_code()? {
                    return Ok(self.statements);
                }
            } else {
                self.step_markup();
            }
        }

        if let Some(&open) = self.stack.last() {
            return Err(ParseError::UnclosedBracket(open as char));
        }
        if self.in_code && self.stmt_start.is_some() {
            return Err(ParseError::UnterminatedStatement);
        }

        Ok(self.statements)
    }

    /// Consume markup up to (and including) the next open tag.
    fn step_markup(&mut self) {
        let (html_end, next) = match find_open_tag(self.src, self.pos) {
            Some((start, len, is_echo)) => (start, Some((start, len, is_echo))),
            None => (self.src.len(), None),
        };

        // Markup nested inside a block belongs to that block's statement
        let top_level = self.stack.is_empty() && self.stmt_start.is_none();
        if top_level && html_end > self.pos {
            let html = String::from_utf8_lossy(&self.src[self.pos..html_end]).into_owned();
            self.statements.push(Statement::InlineHtml(html));
        }

        match next {
            Some((start, len, is_echo)) => {
                self.pos = start + len;
                self.in_code = true;
                if is_echo {
                    self.stmt_start.get_or_insert(start);
                }
            }
            None => self.pos = self.src.len(),
        }
    }

    /// Consume one code token. Returns true once `__halt_compiler` is seen.
    fn step_code(&mut self) -> Result<bool, ParseError> {
        let b = self.src[self.pos];
        let next = self.src.get(self.pos + 1).copied();

        match (b, next) {
            (b'?', Some(b'>')) => {
                if self.stack.is_empty() {
                    self.finish_statement(self.pos);
                }
                self.pos += 2;
                // A single newline directly after the close tag is eaten
                if self.src[self.pos..].starts_with(b"\r\n") {
                    self.pos += 2;
                } else if self.src.get(self.pos) == Some(&b'\n') {
                    self.pos += 1;
                }
                self.in_code = false;
            }
            (b'#', Some(b'[')) => {
                // attribute
                self.mark();
                self.stack.push(b'[');
                self.pos += 2;
            }
            (b'#', _) | (b'/', Some(b'/')) => self.skip_line_comment(),
            (b'/', Some(b'*')) => self.skip_block_comment()?,
            (b'\'', _) | (b'"', _) | (b'`', _) => {
                self.mark();
                self.skip_string(b)?;
            }
            (b'<', Some(b'<')) if self.src[self.pos..].starts_with(b"<<<") => {
                self.mark();
                self.skip_heredoc()?;
            }
            (b'(', _) | (b'[', _) | (b'{', _) => {
                self.mark();
                self.stack.push(b);
                self.pos += 1;
            }
            (b')', _) | (b']', _) | (b'}', _) => {
                self.mark();
                match self.stack.pop() {
                    Some(open) if closing_for(open) == b => {}
                    _ => {
                        return Err(ParseError::UnbalancedBracket {
                            found: b as char,
                            offset: self.pos,
                        })
                    }
                }
                self.pos += 1;
                if b == b'}' && self.stack.is_empty() {
                    self.finish_statement(self.pos);
                }
            }
            (b';', _) => {
                if self.stack.is_empty() {
                    self.finish_statement(self.pos);
                }
                self.pos += 1;
            }
            _ if b.is_ascii_whitespace() => self.pos += 1,
            _ if is_ident_start(b) => {
                let start = self.pos;
                while self.pos < self.src.len() && is_ident_char(self.src[self.pos]) {
                    self.pos += 1;
                }
                let word = &self.src[start..self.pos];
                if self.stack.is_empty()
                    && self.stmt_start.is_none()
                    && word.eq_ignore_ascii_case(HALT_COMPILER)
                {
                    self.statements
                        .push(Statement::Code(String::from_utf8_lossy(word).into_owned()));
                    return Ok(true);
                }
                self.stmt_start.get_or_insert(start);
            }
            _ => {
                self.mark();
                self.pos += 1;
            }
        }

        Ok(false)
    }

    fn mark(&mut self) {
        self.stmt_start.get_or_insert(self.pos);
    }

    fn finish_statement(&mut self, end: usize) {
        if let Some(start) = self.stmt_start.take() {
            let text = String::from_utf8_lossy(&self.src[start..end]).trim().to_string();
            self.statements.push(Statement::Code(text));
        }
    }

    /// Line comments end at a newline or right before a close tag.
    fn skip_line_comment(&mut self) {
        while self.pos < self.src.len() {
            if self.src[self.pos] == b'\n' || self.src[self.pos..].starts_with(b"?>") {
                return;
            }
            self.pos += 1;
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        self.pos += 2;
        while self.pos + 1 < self.src.len() {
            if self.src[self.pos] == b'*' && self.src[self.pos + 1] == b'/' {
                self.pos += 2;
                return Ok(());
            }
            self.pos += 1;
        }
        Err(ParseError::UnterminatedComment(start))
    }

    fn skip_string(&mut self, quote: u8) -> Result<(), ParseError> {
        let start = self.pos;
        self.pos += 1;
        while self.pos < self.src.len() {
            match self.src[self.pos] {
                b'\\' => self.pos += 2,
                c if c == quote => {
                    self.pos += 1;
                    return Ok(());
                }
                _ => self.pos += 1,
            }
        }
        Err(ParseError::UnterminatedString(start))
    }

    /// `<<<ID`, `<<<"ID"` or `<<<'ID'`, closed by a line starting with ID
    /// (optionally indented). Anything else is left to the generic scanner.
    fn skip_heredoc(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        let mut i = self.pos + 3;
        while i < self.src.len() && (self.src[i] == b' ' || self.src[i] == b'\t') {
            i += 1;
        }

        let quote = match self.src.get(i) {
            Some(&q) if q == b'\'' || q == b'"' => {
                i += 1;
                Some(q)
            }
            _ => None,
        };

        let ident_start = i;
        if i >= self.src.len() || !is_ident_start(self.src[i]) {
            self.pos += 1;
            return Ok(());
        }
        while i < self.src.len() && is_ident_char(self.src[i]) {
            i += 1;
        }
        let ident = &self.src[ident_start..i];

        if let Some(q) = quote {
            if self.src.get(i) != Some(&q) {
                self.pos += 1;
                return Ok(());
            }
            i += 1;
        }
        if self.src[i..].starts_with(b"\r\n") {
            i += 2;
        } else if self.src.get(i) == Some(&b'\n') {
            i += 1;
        } else {
            self.pos += 1;
            return Ok(());
        }

        while i < self.src.len() {
            let mut j = i;
            while j < self.src.len() && (self.src[j] == b' ' || self.src[j] == b'\t') {
                j += 1;
            }
            if self.src[j..].starts_with(ident)
                && self
                    .src
                    .get(j + ident.len())
                    .map_or(true, |&c| !is_ident_char(c))
            {
                self.pos = j + ident.len();
                return Ok(());
            }
            match self.src[i..].iter().position(|&c| c == b'\n') {
                Some(offset) => i += offset + 1,
                None => break,
            }
        }

        Err(ParseError::UnterminatedHeredoc(start))
    }
}
