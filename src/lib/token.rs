use std::hash::{Hash, Hasher};

/// Reserved words. The tokenizer matches these case-insensitively against
/// the profile vocabulary, so by the time a token exists the spelling is
/// irrelevant.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum Reserved {
    // Dram commands
    Nop,
    Act,
    Pre,
    Ref,
    Pde,
    Srx,
    Read,
    Write,

    // Register operations
    Load,
    Incr,
    Prbs,

    // Control bits
    Hold,
    Stop,
    Cke,
    Ila,
    Cal,
    UseDbi,
    Rfm,

    // Branches
    Jmp,
    Jre,
    Jnre,

    // The bitfield escape hatch.
    SetBits,

    // Pattern RAM
    Patram,
    Dq,
    Ecc,
    Dbi,

    // Directives
    Fbpa,
    MaxCyc,

    /// A register operand, e.g. `R5`.
    Reg(u8),
    /// A channel operand (`CHA` = 0, `CHB` = 1); multi-channel litters only.
    Chan(u8),
}

/// Symbols, matched longest-first so `<=` beats `<` `=`.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum Sym {
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    AndAnd,
    OrOr,
    Question,
    Colon,
    LParen,
    RParen,
    Semi,
}

/// The semantic content of a token.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum TokenKind<'a> {
    Reserved(Reserved),
    Sym(Sym),
    Int(i64),
    Ident(&'a str),
    /// A malformed token; the tokenizer has already reported it.
    Illegal,
    Eof,
}

/// One token, borrowing the source buffer.
///
/// `file`, `line_text`, `line` and `col` exist purely for diagnostics;
/// equality and hashing consider only `kind`, so two spellings of the same
/// reserved word (or the same integer in different bases) compare equal.
#[derive(Debug, Copy, Clone)]
pub struct Token<'a> {
    pub kind: TokenKind<'a>,
    pub text: &'a str,
    pub file: &'a str,
    pub line_text: &'a str,
    pub line: u32,
    pub col: u32,
    /// Whether whitespace (or the start of a line) preceded this token.
    /// The expression parser's argument-splitting rule depends on it.
    pub padded: bool,
}

impl<'a> PartialEq for Token<'a> {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl<'a> Eq for Token<'a> {}

impl<'a> Hash for Token<'a> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
    }
}

impl<'a> Token<'a> {
    /// Location string in `file:line` form, used when one diagnostic needs
    /// to cite a second statement.
    pub fn location(&self) -> String {
        format!("{}:{}", self.file, self.line)
    }
}

/// The reserved-word and symbol tables for one litter, handed to the
/// Tokenizer. Symbols are kept sorted longest-first so prefix matching
/// prefers `<=` over `<`.
#[derive(Debug)]
pub struct Vocabulary {
    words: Vec<(&'static str, Reserved)>,
    symbols: Vec<(&'static str, Sym)>,
}

impl Vocabulary {
    pub fn new(
        words: Vec<(&'static str, Reserved)>,
        mut symbols: Vec<(&'static str, Sym)>,
    ) -> Self {
        symbols.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { words, symbols }
    }

    /// Case-insensitive reserved-word lookup.
    pub fn word(&self, text: &str) -> Option<Reserved> {
        self.words
            .iter()
            .find(|(w, _)| w.eq_ignore_ascii_case(text))
            .map(|(_, r)| *r)
    }

    /// Match the longest symbol that prefixes `text`, returning it and its
    /// length in bytes.
    pub fn symbol_prefix(&self, text: &str) -> Option<(Sym, usize)> {
        self.symbols
            .iter()
            .find(|(s, _)| text.starts_with(s))
            .map(|(s, sym)| (*sym, s.len()))
    }
}

/// The symbol table shared by every litter.
pub fn standard_symbols() -> Vec<(&'static str, Sym)> {
    vec![
        ("+", Sym::Plus),
        ("-", Sym::Minus),
        ("*", Sym::Star),
        ("/", Sym::Slash),
        ("%", Sym::Percent),
        ("&", Sym::Amp),
        ("|", Sym::Pipe),
        ("^", Sym::Caret),
        ("~", Sym::Tilde),
        ("!", Sym::Bang),
        ("<<", Sym::Shl),
        (">>", Sym::Shr),
        ("<", Sym::Lt),
        ("<=", Sym::Le),
        (">", Sym::Gt),
        (">=", Sym::Ge),
        ("==", Sym::Eq),
        ("!=", Sym::Ne),
        ("&&", Sym::AndAnd),
        ("||", Sym::OrOr),
        ("?", Sym::Question),
        (":", Sym::Colon),
        ("(", Sym::LParen),
        (")", Sym::RParen),
        (";", Sym::Semi),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok(kind: TokenKind) -> Token {
        Token {
            kind,
            text: "",
            file: "a.mucc",
            line_text: "",
            line: 1,
            col: 1,
            padded: false,
        }
    }

    #[test]
    fn equality_ignores_spelling() {
        let mut a = tok(TokenKind::Int(16));
        a.text = "0x10";
        let mut b = tok(TokenKind::Int(16));
        b.text = "16";
        b.line = 99;
        assert_eq!(a, b);
        assert_ne!(a, tok(TokenKind::Int(17)));
    }

    #[test]
    fn word_lookup_is_case_insensitive() {
        let vocab = Vocabulary::new(
            vec![("LOAD", Reserved::Load), ("R1", Reserved::Reg(1))],
            standard_symbols(),
        );
        assert_eq!(vocab.word("load"), Some(Reserved::Load));
        assert_eq!(vocab.word("Load"), Some(Reserved::Load));
        assert_eq!(vocab.word("r1"), Some(Reserved::Reg(1)));
        assert_eq!(vocab.word("loader"), None);
    }

    #[test]
    fn symbols_match_longest_first() {
        let vocab = Vocabulary::new(vec![], standard_symbols());
        assert_eq!(vocab.symbol_prefix("<=3"), Some((Sym::Le, 2)));
        assert_eq!(vocab.symbol_prefix("<3"), Some((Sym::Lt, 1)));
        assert_eq!(vocab.symbol_prefix(">>1"), Some((Sym::Shr, 2)));
        assert_eq!(vocab.symbol_prefix("@"), None);
    }
}
