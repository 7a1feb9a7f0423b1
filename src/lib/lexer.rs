use log::trace;
use logos::Logos;
use std::collections::VecDeque;
use std::ops::Range;

use crate::error::{AsmError, DiagSink, ErrorKind};
use crate::token::{Token, TokenKind, Vocabulary};

/// Shape classification of the raw input. Semantic classification (reserved
/// word vs identifier, symbol splitting) happens in the Tokenizer, because
/// the vocabulary is supplied by the litter profile at runtime.
#[derive(Logos, Debug, PartialEq, Eq, Copy, Clone)]
enum RawToken {
    #[regex(r"[A-Za-z_][A-Za-z_0-9]*")]
    Word,

    // Greedy, so malformed literals like `12ab` arrive as one token and can
    // be rejected whole.
    #[regex(r"[0-9][0-9A-Za-z_]*")]
    Number,

    #[regex(r"#[A-Za-z]+")]
    Directive,

    // Only meaningful inside a `#line` directive.
    #[regex(r#""[^"\r\n]*""#)]
    Quoted,

    // A run of symbol characters; the Tokenizer splits it longest-first.
    #[regex(r"[-+*/%&|^~!<>=?:;()]+")]
    Puncts,

    #[regex(r"//[^\r\n]*", priority = 10)]
    Comment,

    #[regex(r"\r\n|\n|\r")]
    Newline,

    #[regex(r"[^\S\n\r]+")]
    Whitespace,

    // Unrecognised characters.
    #[error]
    Unknown,
}

/// The token cursor handed to the parser.
///
/// `peek(k)` returns the k-th unconsumed token without consuming it and
/// `advance(n)` consumes n tokens. Past end-of-file, `peek` returns an
/// endless supply of `Eof` tokens, so callers never need a separate at-end
/// check. Lexical errors are reported straight into the sink, yield an
/// `Illegal` token, and discard the rest of the source line.
pub struct Tokenizer<'a> {
    raw: logos::Lexer<'a, RawToken>,
    source: &'a str,
    vocab: &'a Vocabulary,
    buffer: VecDeque<Token<'a>>,
    /// Logical filename, remapped by `#line`.
    file: &'a str,
    /// Logical line number of the current position.
    line: u32,
    /// Byte offset of the start of the current physical line.
    line_start: usize,
    /// Whether whitespace has been seen since the last semantic token.
    padded: bool,
    suppress_octal_warning: bool,
    done: bool,
}

impl<'a> Tokenizer<'a> {
    pub fn new(
        source: &'a str,
        file: &'a str,
        vocab: &'a Vocabulary,
        suppress_octal_warning: bool,
    ) -> Self {
        Self {
            raw: RawToken::lexer(source),
            source,
            vocab,
            buffer: VecDeque::with_capacity(8),
            file,
            line: 1,
            line_start: 0,
            padded: true,
            suppress_octal_warning,
            done: false,
        }
    }

    /// Peek at the k-th unconsumed token. Idempotent.
    pub fn peek(&mut self, k: usize, sink: &mut DiagSink) -> Token<'a> {
        while self.buffer.len() <= k && !self.done {
            self.step(sink);
        }
        match self.buffer.get(k) {
            Some(token) => *token,
            None => self.eof_token(),
        }
    }

    /// Consume `n` tokens. Consuming past end-of-file is a no-op.
    pub fn advance(&mut self, n: usize) {
        for _ in 0..n {
            if self.buffer.pop_front().is_none() {
                break;
            }
        }
    }

    /// Process one raw token, pushing zero or more semantic tokens.
    fn step(&mut self, sink: &mut DiagSink) {
        let raw = match self.raw.next() {
            Some(raw) => raw,
            None => {
                self.done = true;
                return;
            }
        };
        let span = self.raw.span();
        let slice = self.raw.slice();
        match raw {
            RawToken::Whitespace | RawToken::Comment => self.padded = true,
            RawToken::Newline => self.newline(span.end),
            RawToken::Word => {
                let kind = match self.vocab.word(slice) {
                    Some(word) => TokenKind::Reserved(word),
                    None => TokenKind::Ident(slice),
                };
                self.push(kind, span);
            }
            RawToken::Number => match parse_int(slice) {
                Ok((value, ambiguous_octal)) => {
                    let token = self.make_token(TokenKind::Int(value), span);
                    if ambiguous_octal && !self.suppress_octal_warning {
                        sink.warning(AsmError::new(
                            ErrorKind::Lexical,
                            &token,
                            "leading zero does not make this octal; use 0o \
                             if octal was intended",
                        ));
                    }
                    self.push_token(token);
                }
                Err(msg) => self.illegal(span, msg, sink),
            },
            RawToken::Puncts => self.puncts(span, sink),
            RawToken::Directive => self.directive(span, slice, sink),
            RawToken::Quoted => {
                self.illegal(span, "unexpected string literal".into(), sink)
            }
            RawToken::Unknown => self.illegal(
                span,
                format!("unrecognised character '{slice}'"),
                sink,
            ),
        }
    }

    /// Split a punctuation run into symbol tokens, longest-first.
    fn puncts(&mut self, span: Range<usize>, sink: &mut DiagSink) {
        let mut offset = 0;
        let slice = &self.source[span.clone()];
        while offset < slice.len() {
            match self.vocab.symbol_prefix(&slice[offset..]) {
                Some((sym, len)) => {
                    let start = span.start + offset;
                    self.push(TokenKind::Sym(sym), start..start + len);
                    offset += len;
                }
                None => {
                    let start = span.start + offset;
                    self.illegal(
                        start..span.end,
                        format!("unrecognised symbol '{}'", &slice[offset..]),
                        sink,
                    );
                    return;
                }
            }
        }
    }

    /// Handle a `#line <n> "<file>"` directive. Emits no token; remaps the
    /// logical filename and line number used by subsequent diagnostics.
    fn directive(&mut self, span: Range<usize>, slice: &'a str, sink: &mut DiagSink) {
        if !slice.eq_ignore_ascii_case("#line") {
            self.illegal(span, format!("unknown directive '{slice}'"), sink);
            return;
        }
        let mut number: Option<u32> = None;
        let mut file: Option<&'a str> = None;
        loop {
            let raw = match self.raw.next() {
                Some(raw) => raw,
                None => {
                    // Directive at end of file; still applies.
                    self.done = true;
                    break;
                }
            };
            let arg_span = self.raw.span();
            let arg = self.raw.slice();
            match raw {
                RawToken::Whitespace => continue,
                RawToken::Number if number.is_none() => match arg.parse() {
                    Ok(n) => number = Some(n),
                    Err(_) => {
                        self.illegal(span, "malformed #line directive".into(), sink);
                        return;
                    }
                },
                RawToken::Quoted if number.is_some() && file.is_none() => {
                    file = Some(&arg[1..arg.len() - 1]);
                }
                RawToken::Newline => {
                    if number.is_none() || file.is_none() {
                        self.illegal(span, "malformed #line directive".into(), sink);
                        return;
                    }
                    self.line_start = arg_span.end;
                    self.padded = true;
                    break;
                }
                _ => {
                    self.illegal(span, "malformed #line directive".into(), sink);
                    return;
                }
            }
        }
        match (number, file) {
            (Some(n), Some(f)) => {
                trace!("#line remaps to {f}:{n}");
                self.line = n;
                self.file = f;
            }
            _ => {
                let token = self.make_token(TokenKind::Illegal, span);
                sink.error(AsmError::new(
                    ErrorKind::Lexical,
                    &token,
                    "malformed #line directive",
                ));
                self.push_token(token);
            }
        }
    }

    /// Report a lexical error, emit an `Illegal` token for the offending
    /// slice, and discard the rest of the line.
    fn illegal(&mut self, span: Range<usize>, msg: String, sink: &mut DiagSink) {
        let token = self.make_token(TokenKind::Illegal, span);
        sink.error(AsmError::new(ErrorKind::Lexical, &token, msg));
        self.push_token(token);
        self.skip_line();
    }

    /// Discard raw tokens up to and including the next line terminator.
    fn skip_line(&mut self) {
        loop {
            match self.raw.next() {
                None => {
                    self.done = true;
                    return;
                }
                Some(RawToken::Newline) => {
                    let end = self.raw.span().end;
                    self.newline(end);
                    return;
                }
                Some(_) => continue,
            }
        }
    }

    fn newline(&mut self, line_start: usize) {
        self.line += 1;
        self.line_start = line_start;
        self.padded = true;
    }

    fn push(&mut self, kind: TokenKind<'a>, span: Range<usize>) {
        let token = self.make_token(kind, span);
        self.push_token(token);
    }

    fn push_token(&mut self, token: Token<'a>) {
        trace!("token {:?} at {}:{}", token.kind, token.line, token.col);
        self.buffer.push_back(token);
        self.padded = false;
    }

    fn make_token(&self, kind: TokenKind<'a>, span: Range<usize>) -> Token<'a> {
        Token {
            kind,
            text: &self.source[span.clone()],
            file: self.file,
            line_text: self.line_text(),
            line: self.line,
            col: (span.start - self.line_start + 1) as u32,
            padded: self.padded,
        }
    }

    /// The text of the current physical line, for diagnostics.
    fn line_text(&self) -> &'a str {
        let rest = &self.source[self.line_start..];
        let end = rest.find('\n').unwrap_or(rest.len());
        rest[..end].trim_end_matches('\r')
    }

    fn eof_token(&self) -> Token<'a> {
        Token {
            kind: TokenKind::Eof,
            text: "",
            file: self.file,
            line_text: self.line_text(),
            line: self.line,
            col: (self.source.len().saturating_sub(self.line_start) + 1) as u32,
            padded: true,
        }
    }
}

/// Parse an integer literal with an optional `0b`/`0o`/`0x` base prefix.
/// Returns the value and whether a bare leading-zero decimal was seen.
fn parse_int(slice: &str) -> Result<(i64, bool), String> {
    let lower = slice.as_bytes();
    let (radix, digits) = if lower.len() >= 2 && lower[0] == b'0' {
        match lower[1] {
            b'b' | b'B' => (2, &slice[2..]),
            b'o' | b'O' => (8, &slice[2..]),
            b'x' | b'X' => (16, &slice[2..]),
            _ => (10, slice),
        }
    } else {
        (10, slice)
    };
    if digits.is_empty() {
        return Err(format!("integer literal '{slice}' has no digits"));
    }
    let mut value: i64 = 0;
    for c in digits.chars() {
        let digit = c
            .to_digit(radix)
            .ok_or_else(|| format!("invalid digit '{c}' in integer literal '{slice}'"))?;
        value = value
            .checked_mul(radix as i64)
            .and_then(|v| v.checked_add(digit as i64))
            .ok_or_else(|| format!("integer literal '{slice}' overflows"))?;
    }
    let ambiguous_octal = radix == 10 && slice.len() > 1 && slice.starts_with('0');
    Ok((value, ambiguous_octal))
}
