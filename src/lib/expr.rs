use log::trace;

use crate::error::{AsmError, AsmResult, DiagSink, ErrorKind};
use crate::lexer::Tokenizer;
use crate::token::{Sym, Token, TokenKind};

/// An expression tree. Immutable once built; evaluation is a separate phase
/// because identifier leaves may name labels that don't exist yet.
#[derive(Debug, Clone)]
pub enum Expr<'a> {
    Leaf(Token<'a>),
    Unary {
        op: Sym,
        token: Token<'a>,
        operand: Box<Expr<'a>>,
    },
    Binary {
        op: Sym,
        token: Token<'a>,
        lhs: Box<Expr<'a>>,
        rhs: Box<Expr<'a>>,
    },
    Ternary {
        cond: Box<Expr<'a>>,
        then: Box<Expr<'a>>,
        otherwise: Box<Expr<'a>>,
    },
}

/// Resolves identifier leaves during evaluation.
pub trait LabelScope {
    fn lookup(&self, name: &str) -> Option<i64>;

    fn missing_message(&self, name: &str) -> String {
        format!("undefined label '{name}'")
    }
}

/// Scope for constant-only positions such as phase numbers and bit indices.
pub struct NoLabels;

impl LabelScope for NoLabels {
    fn lookup(&self, _name: &str) -> Option<i64> {
        None
    }

    fn missing_message(&self, name: &str) -> String {
        format!("labels are not allowed here ('{name}')")
    }
}

impl<'a> Expr<'a> {
    /// The leftmost token of the expression, used to anchor diagnostics.
    pub fn token(&self) -> Token<'a> {
        match self {
            Expr::Leaf(t) => *t,
            Expr::Unary { token, .. } => *token,
            Expr::Binary { lhs, .. } => lhs.token(),
            Expr::Ternary { cond, .. } => cond.token(),
        }
    }

    /// Evaluate to a 64-bit signed two's-complement value. Only the taken
    /// branch of a ternary is evaluated; everything else is strict.
    pub fn eval(&self, scope: &dyn LabelScope) -> AsmResult<i64> {
        match self {
            Expr::Leaf(t) => match t.kind {
                TokenKind::Int(v) => Ok(v),
                TokenKind::Ident(name) => scope.lookup(name).ok_or_else(|| {
                    AsmError::new(
                        ErrorKind::Semantic,
                        t,
                        scope.missing_message(name),
                    )
                }),
                _ => Err(AsmError::new(
                    ErrorKind::Internal,
                    t,
                    "non-value token reached evaluation",
                )),
            },
            Expr::Unary { op, token, operand } => {
                let v = operand.eval(scope)?;
                match op {
                    Sym::Plus => Ok(v),
                    Sym::Minus => Ok(0i64.wrapping_sub(v)),
                    Sym::Tilde => Ok(!v),
                    Sym::Bang => Ok((v == 0) as i64),
                    _ => Err(AsmError::new(
                        ErrorKind::Internal,
                        token,
                        "unary operator has no evaluation handler",
                    )),
                }
            }
            Expr::Binary { op, token, lhs, rhs } => {
                let a = lhs.eval(scope)?;
                let b = rhs.eval(scope)?;
                match op {
                    Sym::Plus => Ok(a.wrapping_add(b)),
                    Sym::Minus => Ok(a.wrapping_sub(b)),
                    Sym::Star => Ok(a.wrapping_mul(b)),
                    Sym::Slash | Sym::Percent if b == 0 => Err(AsmError::new(
                        ErrorKind::Semantic,
                        token,
                        "division by zero",
                    )),
                    Sym::Slash => Ok(a.wrapping_div(b)),
                    Sym::Percent => Ok(a.wrapping_rem(b)),
                    Sym::Shl => Ok(shift_left(a, b)),
                    Sym::Shr => Ok(shift_right(a, b)),
                    Sym::Amp => Ok(a & b),
                    Sym::Pipe => Ok(a | b),
                    Sym::Caret => Ok(a ^ b),
                    Sym::Lt => Ok((a < b) as i64),
                    Sym::Le => Ok((a <= b) as i64),
                    Sym::Gt => Ok((a > b) as i64),
                    Sym::Ge => Ok((a >= b) as i64),
                    Sym::Eq => Ok((a == b) as i64),
                    Sym::Ne => Ok((a != b) as i64),
                    Sym::AndAnd => Ok((a != 0 && b != 0) as i64),
                    Sym::OrOr => Ok((a != 0 || b != 0) as i64),
                    _ => Err(AsmError::new(
                        ErrorKind::Internal,
                        token,
                        "binary operator has no evaluation handler",
                    )),
                }
            }
            Expr::Ternary {
                cond,
                then,
                otherwise,
            } => {
                if cond.eval(scope)? != 0 {
                    then.eval(scope)
                } else {
                    otherwise.eval(scope)
                }
            }
        }
    }
}

/// A negative shift amount shifts in the opposite direction.
fn shift_left(a: i64, b: i64) -> i64 {
    if b < 0 {
        shift_right(a, b.saturating_neg())
    } else if b >= 64 {
        0
    } else {
        ((a as u64) << b) as i64
    }
}

fn shift_right(a: i64, b: i64) -> i64 {
    if b < 0 {
        shift_left(a, b.saturating_neg())
    } else if b >= 64 {
        if a < 0 {
            -1
        } else {
            0
        }
    } else {
        a >> b
    }
}

/// Check a resolved value against the union of the signed and unsigned
/// ranges of a `width`-bit field: `[-2^(w-1), 2^w - 1]`.
pub fn check_limits(token: &Token, value: i64, width: usize) -> AsmResult<()> {
    debug_assert!(width >= 1 && width <= 64, "bad field width {width}");
    let min = -(1i128 << (width - 1));
    let max = (1i128 << width) - 1;
    if (value as i128) < min || (value as i128) > max {
        Err(AsmError::new(
            ErrorKind::Semantic,
            token,
            format!("value {value} does not fit in a {width}-bit field"),
        ))
    } else {
        Ok(())
    }
}

/// True if `token` can begin an expression.
pub fn starts_expression(token: &Token) -> bool {
    matches!(
        token.kind,
        TokenKind::Int(_)
            | TokenKind::Ident(_)
            | TokenKind::Sym(
                Sym::Plus | Sym::Minus | Sym::Tilde | Sym::Bang | Sym::LParen
            )
    )
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum OpKind {
    Unary,
    Binary,
    TernaryQ,
    TernaryC,
}

/// Dual-precedence operator descriptor. Smaller numbers bind tighter. An
/// incoming operator reduces every stacked operator whose `prec` is at most
/// its own `shunt`; right-associative operators therefore carry
/// `shunt = prec - 1` so they stack instead of reducing their own kind.
#[derive(Debug, Copy, Clone)]
struct OpInfo {
    prec: u8,
    shunt: u8,
    kind: OpKind,
}

/// Classify `sym` as an operator, given whether a value precedes it.
/// `+` and `-` are unary without a preceding value and binary with one.
fn op_info(sym: Sym, have_value: bool) -> Option<OpInfo> {
    let info = |prec, shunt, kind| Some(OpInfo { prec, shunt, kind });
    if !have_value {
        return match sym {
            Sym::Plus | Sym::Minus | Sym::Tilde | Sym::Bang => {
                info(1, 0, OpKind::Unary)
            }
            _ => None,
        };
    }
    match sym {
        Sym::Star | Sym::Slash | Sym::Percent => info(2, 2, OpKind::Binary),
        Sym::Plus | Sym::Minus => info(3, 3, OpKind::Binary),
        Sym::Shl | Sym::Shr => info(4, 4, OpKind::Binary),
        Sym::Lt | Sym::Le | Sym::Gt | Sym::Ge => info(5, 5, OpKind::Binary),
        Sym::Eq | Sym::Ne => info(6, 6, OpKind::Binary),
        Sym::Amp => info(7, 7, OpKind::Binary),
        Sym::Caret => info(8, 8, OpKind::Binary),
        Sym::Pipe => info(9, 9, OpKind::Binary),
        Sym::AndAnd => info(10, 10, OpKind::Binary),
        Sym::OrOr => info(11, 11, OpKind::Binary),
        // Arranged so chained ternaries associate right-to-left while
        // adjacent colons reduce eagerly:
        // shunt(?) < prec(:) <= shunt(:) < prec(?).
        Sym::Question => info(14, 12, OpKind::TernaryQ),
        Sym::Colon => info(13, 13, OpKind::TernaryC),
        _ => None,
    }
}

#[derive(Debug)]
enum StackOp<'a> {
    Paren(Token<'a>),
    Op {
        info: OpInfo,
        sym: Sym,
        token: Token<'a>,
    },
}

struct Shunter<'a> {
    values: Vec<Expr<'a>>,
    ops: Vec<StackOp<'a>>,
    depth: usize,
    have_value: bool,
}

impl<'a> Shunter<'a> {
    fn new() -> Self {
        Self {
            values: Vec::new(),
            ops: Vec::new(),
            depth: 0,
            have_value: false,
        }
    }

    fn pop_value(&mut self, at: &Token<'a>) -> AsmResult<Expr<'a>> {
        self.values.pop().ok_or_else(|| {
            AsmError::new(ErrorKind::Syntax, at, "operator is missing its operand")
        })
    }

    /// Build a tree node from the top stacked operator.
    fn apply(&mut self, op: StackOp<'a>) -> AsmResult<()> {
        let (info, sym, token) = match op {
            StackOp::Paren(token) => {
                return Err(AsmError::new(
                    ErrorKind::Syntax,
                    &token,
                    "unmatched '('",
                ));
            }
            StackOp::Op { info, sym, token } => (info, sym, token),
        };
        match info.kind {
            OpKind::Unary => {
                let operand = Box::new(self.pop_value(&token)?);
                self.values.push(Expr::Unary {
                    op: sym,
                    token,
                    operand,
                });
            }
            OpKind::Binary => {
                let rhs = Box::new(self.pop_value(&token)?);
                let lhs = Box::new(self.pop_value(&token)?);
                self.values.push(Expr::Binary {
                    op: sym,
                    token,
                    lhs,
                    rhs,
                });
            }
            OpKind::TernaryC => {
                let otherwise = Box::new(self.pop_value(&token)?);
                let then = Box::new(self.pop_value(&token)?);
                match self.ops.pop() {
                    Some(StackOp::Op {
                        info:
                            OpInfo {
                                kind: OpKind::TernaryQ,
                                ..
                            },
                        token: q_token,
                        ..
                    }) => {
                        let cond = Box::new(self.pop_value(&q_token)?);
                        self.values.push(Expr::Ternary {
                            cond,
                            then,
                            otherwise,
                        });
                    }
                    _ => {
                        return Err(AsmError::new(
                            ErrorKind::Syntax,
                            &token,
                            "':' without a matching '?'",
                        ));
                    }
                }
            }
            OpKind::TernaryQ => {
                return Err(AsmError::new(
                    ErrorKind::Syntax,
                    &token,
                    "'?' without a matching ':'",
                ));
            }
        }
        Ok(())
    }

    /// Reduce stacked operators that outrank the incoming one, then stack it.
    fn shunt(&mut self, info: OpInfo, sym: Sym, token: Token<'a>) -> AsmResult<()> {
        loop {
            match self.ops.last() {
                Some(StackOp::Op { info: top, .. }) if top.prec <= info.shunt => {
                    let op = self.ops.pop().unwrap();
                    self.apply(op)?;
                }
                _ => break,
            }
        }
        self.ops.push(StackOp::Op { info, sym, token });
        self.have_value = false;
        Ok(())
    }

    /// Reduce back to the matching '('.
    fn close_paren(&mut self, token: &Token<'a>) -> AsmResult<()> {
        while let Some(op) = self.ops.pop() {
            if let StackOp::Paren(_) = op {
                self.depth -= 1;
                return Ok(());
            }
            self.apply(op)?;
        }
        Err(AsmError::new(ErrorKind::Syntax, token, "unmatched ')'"))
    }

    fn finish(mut self, first: &Token<'a>) -> AsmResult<Expr<'a>> {
        while let Some(op) = self.ops.pop() {
            self.apply(op)?;
        }
        match self.values.len() {
            0 => Err(AsmError::new(
                ErrorKind::Syntax,
                first,
                "expected an expression",
            )),
            1 => Ok(self.values.pop().unwrap()),
            // The value/operator preconditions make this unreachable for any
            // token sequence, so it indicates a bug here, not bad input.
            _ => Err(AsmError::new(
                ErrorKind::Internal,
                first,
                "expression reduced to more than one value",
            )),
        }
    }
}

/// Parse the maximal expression starting at the cursor.
///
/// Consumption stops at the first non-expression token, or — outside
/// parentheses — at the first whitespace-separated token following a
/// complete value. The asymmetry is what lets `OP +5 +10` read as two
/// arguments while `OP (+5 +10)` reads as one expression.
pub fn parse_expression<'a>(
    tokens: &mut Tokenizer<'a>,
    sink: &mut DiagSink,
) -> AsmResult<Expr<'a>> {
    let first = tokens.peek(0, sink);
    let mut shunter = Shunter::new();
    loop {
        let t = tokens.peek(0, sink);
        // Argument-splitting rule: a whitespace-separated token after a
        // complete value ends the expression when not inside parentheses.
        if shunter.have_value && shunter.depth == 0 && t.padded {
            break;
        }
        match t.kind {
            TokenKind::Int(_) | TokenKind::Ident(_) => {
                if shunter.have_value {
                    return Err(AsmError::new(
                        ErrorKind::Syntax,
                        &t,
                        "expected an operator",
                    ));
                }
                shunter.values.push(Expr::Leaf(t));
                shunter.have_value = true;
                tokens.advance(1);
            }
            TokenKind::Sym(Sym::LParen) => {
                if shunter.have_value {
                    return Err(AsmError::new(
                        ErrorKind::Syntax,
                        &t,
                        "expected an operator",
                    ));
                }
                shunter.ops.push(StackOp::Paren(t));
                shunter.depth += 1;
                tokens.advance(1);
            }
            TokenKind::Sym(Sym::RParen) => {
                if shunter.depth == 0 {
                    break;
                }
                if !shunter.have_value {
                    return Err(AsmError::new(
                        ErrorKind::Syntax,
                        &t,
                        "expected a value before ')'",
                    ));
                }
                shunter.close_paren(&t)?;
                tokens.advance(1);
            }
            TokenKind::Sym(sym) => match op_info(sym, shunter.have_value) {
                Some(info) => {
                    shunter.shunt(info, sym, t)?;
                    tokens.advance(1);
                }
                None if shunter.have_value => break,
                None => {
                    return Err(AsmError::new(
                        ErrorKind::Syntax,
                        &t,
                        format!("expected a value, found '{}'", t.text),
                    ));
                }
            },
            // Reserved words, illegal tokens and EOF all end the expression.
            _ => break,
        }
    }
    let expr = shunter.finish(&first)?;
    trace!("parsed expression {:?}", expr);
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_test_logging;
    use crate::token::{standard_symbols, Vocabulary};

    struct MapScope(Vec<(&'static str, i64)>);

    impl LabelScope for MapScope {
        fn lookup(&self, name: &str) -> Option<i64> {
            self.0
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| *v)
        }
    }

    // The Tokenizer borrows its vocabulary for as long as the tokens it
    // yields, so a shared static keeps the returned Expr tied to `src` only.
    fn symbols() -> &'static Vocabulary {
        static VOCAB: std::sync::OnceLock<Vocabulary> = std::sync::OnceLock::new();
        VOCAB.get_or_init(|| Vocabulary::new(vec![], standard_symbols()))
    }

    fn parse(src: &str) -> AsmResult<(Expr, usize)> {
        init_test_logging();
        let mut sink = DiagSink::new();
        let mut tokens = Tokenizer::new(src, "t.mucc", symbols(), false);
        let expr = parse_expression(&mut tokens, &mut sink)?;
        // Count the tokens left over, so tests can check where parsing
        // stopped.
        let mut remaining = 0;
        while tokens.peek(0, &mut sink).kind != TokenKind::Eof {
            tokens.advance(1);
            remaining += 1;
        }
        Ok((expr, remaining))
    }

    fn eval(src: &str) -> i64 {
        let (expr, remaining) = parse(src).unwrap();
        assert_eq!(remaining, 0, "expression did not consume all of {src:?}");
        expr.eval(&NoLabels).unwrap()
    }

    #[test]
    fn precedence() {
        assert_eq!(eval("2+3*4\n"), 14);
        assert_eq!(eval("(2+3)*4\n"), 20);
        assert_eq!(eval("1|2^3&4\n"), 3);
        assert_eq!(eval("1+2<<3\n"), 24);
        assert_eq!(eval("5<6==1\n"), 1);
    }

    #[test]
    fn unary_operators() {
        assert_eq!(eval("-5+3\n"), -2);
        assert_eq!(eval("~0\n"), -1);
        assert_eq!(eval("!5\n"), 0);
        assert_eq!(eval("!!5\n"), 1);
        assert_eq!(eval("--3\n"), 3);
        assert_eq!(eval("2*-3\n"), -6);
    }

    #[test]
    fn ternary_is_right_associative() {
        assert_eq!(eval("1?2:3?4:5\n"), 2);
        assert_eq!(eval("0?2:3?4:5\n"), 4);
        assert_eq!(eval("0?2:0?4:5\n"), 5);
    }

    #[test]
    fn lone_colon_chain_is_an_error() {
        assert!(parse("1:2:3\n").is_err());
    }

    #[test]
    fn question_without_colon_is_an_error() {
        assert!(parse("1?2\n").is_err());
    }

    #[test]
    fn unmatched_parens_are_errors() {
        assert!(parse("(1+2\n").is_err());
        assert!(parse("*5\n").is_err());
        assert!(parse("1+\n").is_err());
    }

    #[test]
    fn whitespace_splits_arguments_outside_parens() {
        let (expr, remaining) = parse("+5 +10\n").unwrap();
        assert_eq!(expr.eval(&NoLabels).unwrap(), 5);
        assert_eq!(remaining, 2); // `+` and `10` left unconsumed

        let (expr, remaining) = parse("(+5 +10)\n").unwrap();
        assert_eq!(expr.eval(&NoLabels).unwrap(), 15);
        assert_eq!(remaining, 0);
    }

    #[test]
    fn division_by_zero() {
        let (expr, _) = parse("1/0\n").unwrap();
        assert!(expr.eval(&NoLabels).is_err());
        let (expr, _) = parse("1%0\n").unwrap();
        assert!(expr.eval(&NoLabels).is_err());
        // Only the taken ternary branch evaluates.
        assert_eq!(eval("1?7:1/0\n"), 7);
    }

    #[test]
    fn negative_shifts_reverse() {
        assert_eq!(eval("16>>(0-2)\n"), 64);
        assert_eq!(eval("16<<(0-2)\n"), 4);
        assert_eq!(eval("1<<100\n"), 0);
    }

    #[test]
    fn labels_resolve_through_scope() {
        let (expr, _) = parse("target*2+1\n").unwrap();
        let scope = MapScope(vec![("target", 21)]);
        assert_eq!(expr.eval(&scope).unwrap(), 43);
        assert!(expr.eval(&NoLabels).is_err());
    }

    #[test]
    fn limits_take_the_union_of_signed_and_unsigned() {
        let t = Token {
            kind: TokenKind::Int(0),
            text: "0",
            file: "t.mucc",
            line_text: "",
            line: 1,
            col: 1,
            padded: false,
        };
        assert!(check_limits(&t, 15, 4).is_ok());
        assert!(check_limits(&t, -8, 4).is_ok());
        assert!(check_limits(&t, 16, 4).is_err());
        assert!(check_limits(&t, -9, 4).is_err());
        assert!(check_limits(&t, i64::MAX, 64).is_ok());
        assert!(check_limits(&t, i64::MIN, 64).is_ok());
    }
}
