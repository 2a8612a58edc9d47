//! Lexical analysis. Token recognition is built from nom parsers over a
//! [LocatedSpan] so line/column bookkeeping comes for free; literal scanning
//! keeps its own error recovery (report, consume to the next boundary,
//! continue) so one bad literal does not end the compilation.
//!
//! The [Lexer] exposes the token stream with unbounded lookahead: an
//! explicit peek buffer backs `peek_nth`, and tokens can be returned to the
//! stream at either end.

use crate::{
    error::{CompileError, Diagnostics},
    token::{keyword_kind, Token, TokenKind},
    util::SourceLoc,
};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    combinator::{map, recognize},
    sequence::pair,
    IResult, InputTake,
};
use nom_locate::LocatedSpan;
use std::collections::VecDeque;

type RawSpan<'a> = LocatedSpan<&'a str>;

fn loc_of(span: &RawSpan<'_>) -> SourceLoc {
    SourceLoc::new(span.location_line(), span.get_column() as u32)
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c == '$' || c.is_ascii_alphabetic()
}

fn is_ident_cont(c: char) -> bool {
    c == '_' || c == '$' || c.is_ascii_alphanumeric()
}

/// `[_$A-Za-z][_$A-Za-z0-9]*`
fn identifier(input: RawSpan<'_>) -> IResult<RawSpan<'_>, RawSpan<'_>> {
    recognize(pair(take_while1(is_ident_start), take_while(is_ident_cont)))(
        input,
    )
}

/// One run of literal characters: digits, radix prefixes, stray letters (so
/// that `123abc` is consumed whole and rejected whole), and the float dot.
fn number_body(input: RawSpan<'_>) -> IResult<RawSpan<'_>, RawSpan<'_>> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '.')(input)
}

/// Maximal munch over the closed multi-character operator set. Longer
/// spellings come first so `<<=` wins over `<<` wins over `<`.
fn multi_char_operator(input: RawSpan<'_>) -> IResult<RawSpan<'_>, TokenKind> {
    alt((
        map(tag("<<="), |_| TokenKind::ShlAssign),
        map(tag(">>="), |_| TokenKind::ShrAssign),
        map(tag("++"), |_| TokenKind::Inc),
        map(tag("--"), |_| TokenKind::Dec),
        map(tag("->"), |_| TokenKind::Arrow),
        map(tag("+="), |_| TokenKind::AddAssign),
        map(tag("-="), |_| TokenKind::SubAssign),
        map(tag("*="), |_| TokenKind::MulAssign),
        map(tag("/="), |_| TokenKind::DivAssign),
        map(tag("%="), |_| TokenKind::ModAssign),
        map(tag("&="), |_| TokenKind::AndAssign),
        map(tag("|="), |_| TokenKind::OrAssign),
        map(tag("^="), |_| TokenKind::XorAssign),
        map(tag("=="), |_| TokenKind::EqEq),
        map(tag("!="), |_| TokenKind::NotEq),
        map(tag("<="), |_| TokenKind::Le),
        map(tag(">="), |_| TokenKind::Ge),
        map(tag("&&"), |_| TokenKind::AndAnd),
        map(tag("||"), |_| TokenKind::OrOr),
        map(tag("<<"), |_| TokenKind::Shl),
        map(tag(">>"), |_| TokenKind::Shr),
    ))(input)
}

fn single_char_kind(c: char) -> Option<TokenKind> {
    use TokenKind::*;
    Some(match c {
        '+' => Plus,
        '-' => Minus,
        '*' => Star,
        '/' => Slash,
        '%' => Percent,
        '&' => Amp,
        '|' => Pipe,
        '^' => Caret,
        '~' => Tilde,
        '!' => Not,
        '<' => Lt,
        '>' => Gt,
        '=' => Assign,
        '.' => Dot,
        ',' => Comma,
        ':' => Colon,
        ';' => Semicolon,
        '{' => LBrace,
        '}' => RBrace,
        '(' => LParen,
        ')' => RParen,
        '[' => LBracket,
        ']' => RBracket,
        _ => return None,
    })
}

/// Classifies a consumed literal run into a token kind (`0x` alone is
/// normalized to `0x0`). Returns the diagnostic to report when the digits
/// are illegal for the radix.
fn classify_number(lexeme: &str) -> (TokenKind, String, Option<CompileError>) {
    let invalid = |radix: &'static str| CompileError::InvalidLiteral {
        radix,
        lexeme: lexeme.to_string(),
    };

    if lexeme.len() >= 2
        && (lexeme.starts_with("0x") || lexeme.starts_with("0X"))
    {
        let digits = &lexeme[2..];
        if digits.is_empty() {
            return (TokenKind::HexLit, format!("{}0", lexeme), None);
        }
        if digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return (TokenKind::HexLit, lexeme.to_string(), None);
        }
        return (TokenKind::HexLit, lexeme.to_string(), Some(invalid("hexadecimal")));
    }

    if lexeme.len() >= 2
        && (lexeme.starts_with("0b") || lexeme.starts_with("0B"))
    {
        let digits = &lexeme[2..];
        if !digits.is_empty() && digits.chars().all(|c| c == '0' || c == '1') {
            return (TokenKind::BinLit, lexeme.to_string(), None);
        }
        return (TokenKind::BinLit, lexeme.to_string(), Some(invalid("binary")));
    }

    if lexeme.contains('.') {
        let mut parts = lexeme.splitn(2, '.');
        let whole = parts.next().unwrap_or("");
        let frac = parts.next().unwrap_or("");
        let digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
        if digits(whole) && digits(frac) {
            return (TokenKind::FloatLit, lexeme.to_string(), None);
        }
        return (TokenKind::FloatLit, lexeme.to_string(), Some(invalid("float")));
    }

    if lexeme.starts_with('0') && lexeme.len() > 1 {
        if lexeme.chars().all(|c| ('0'..='7').contains(&c)) {
            return (TokenKind::OctLit, lexeme.to_string(), None);
        }
        return (TokenKind::OctLit, lexeme.to_string(), Some(invalid("octal")));
    }

    if lexeme == "0" {
        // a lone zero reads as an octal literal
        return (TokenKind::OctLit, lexeme.to_string(), None);
    }

    if lexeme.chars().all(|c| c.is_ascii_digit()) {
        return (TokenKind::DecLit, lexeme.to_string(), None);
    }
    (TokenKind::DecLit, lexeme.to_string(), Some(invalid("decimal")))
}

/// The token stream over one source file.
pub struct Lexer<'a> {
    rest: RawSpan<'a>,
    buffer: VecDeque<Token>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            rest: RawSpan::new(source),
            buffer: VecDeque::new(),
        }
    }

    /// Returns the next token, draining the peek buffer first. At end of
    /// input this returns `Eof` tokens forever.
    pub fn next(&mut self, diags: &mut Diagnostics) -> Token {
        if let Some(tok) = self.buffer.pop_front() {
            return tok;
        }
        self.scan_token(diags)
    }

    /// Peek at the token `n` positions ahead without consuming anything.
    pub fn peek_nth(&mut self, n: usize, diags: &mut Diagnostics) -> &Token {
        while self.buffer.len() <= n {
            let tok = self.scan_token(diags);
            self.buffer.push_back(tok);
        }
        &self.buffer[n]
    }

    pub fn peek(&mut self, diags: &mut Diagnostics) -> &Token {
        self.peek_nth(0, diags)
    }

    /// Returns a token to the back of the peek buffer.
    pub fn put_back(&mut self, tok: Token) {
        self.buffer.push_back(tok);
    }

    /// Returns a token to the head of the peek buffer, so it is the very
    /// next token seen. Undoing multi-token lookahead pushes the tokens back
    /// in reverse read order to preserve their relative order.
    pub fn put_back_front(&mut self, tok: Token) {
        self.buffer.push_front(tok);
    }

    fn advance(&mut self, bytes: usize) {
        let (rest, _) = self.rest.take_split(bytes);
        self.rest = rest;
    }

    fn fragment(&self) -> &'a str {
        *self.rest.fragment()
    }

    /// Skips whitespace and both comment forms. Reports `incomplete comment`
    /// for an unterminated block comment and consumes to end of input.
    fn skip_trivia(&mut self, diags: &mut Diagnostics) {
        loop {
            let ws = self
                .fragment()
                .find(|c: char| !c.is_ascii_whitespace())
                .unwrap_or_else(|| self.fragment().len());
            if ws > 0 {
                self.advance(ws);
            }
            let frag = self.fragment();
            if frag.starts_with("//") {
                let end = frag.find('\n').unwrap_or_else(|| frag.len());
                self.advance(end);
            } else if frag.starts_with("/*") {
                let open_loc = loc_of(&self.rest);
                match frag[2..].find("*/") {
                    Some(i) => self.advance(i + 4),
                    None => {
                        diags.report(open_loc, CompileError::IncompleteComment);
                        self.advance(frag.len());
                    }
                }
            } else {
                return;
            }
        }
    }

    /// Scans one quote-delimited literal (string or char). The returned
    /// lexeme is the raw body without quotes, escape sequences preserved.
    fn scan_quoted(
        &mut self,
        quote: char,
        loc: SourceLoc,
        diags: &mut Diagnostics,
    ) -> Token {
        let lit_kind = if quote == '"' {
            TokenKind::StrLit
        } else {
            TokenKind::CharLit
        };
        self.advance(1); // opening quote

        let frag = self.fragment();
        let mut chars = frag.char_indices().peekable();
        let mut body = String::new();
        let mut consumed = frag.len();
        let mut error: Option<CompileError> = None;
        let mut closed = false;

        while let Some((i, ch)) = chars.next() {
            if ch == quote {
                consumed = i + ch.len_utf8();
                closed = true;
                break;
            }
            if ch == '\n' {
                // leave the newline for trivia handling
                consumed = i;
                error = Some(if quote == '"' {
                    CompileError::MissingTerminatingString(body.clone())
                } else {
                    CompileError::MissingTerminatingChar(body.clone())
                });
                break;
            }
            if ch == '\\' {
                match chars.next() {
                    Some((j, esc)) if esc != '\n' => {
                        body.push('\\');
                        body.push(esc);
                        consumed = j + esc.len_utf8();
                    }
                    Some((j, _)) => {
                        consumed = j;
                        error = Some(if quote == '"' {
                            CompileError::InvalidStringEscape(body.clone())
                        } else {
                            CompileError::InvalidCharEscape(body.clone())
                        });
                        break;
                    }
                    None => {
                        error = Some(if quote == '"' {
                            CompileError::MissingTerminatingString(body.clone())
                        } else {
                            CompileError::MissingTerminatingChar(body.clone())
                        });
                        break;
                    }
                }
            } else {
                body.push(ch);
                consumed = i + ch.len_utf8();
            }
        }

        if !closed && error.is_none() {
            error = Some(if quote == '"' {
                CompileError::MissingTerminatingString(body.clone())
            } else {
                CompileError::MissingTerminatingChar(body.clone())
            });
        }
        self.advance(consumed.min(self.fragment().len()));
        if let Some(err) = error {
            diags.report(loc, err);
        }
        Token::new(lit_kind, body, loc)
    }

    fn scan_token(&mut self, diags: &mut Diagnostics) -> Token {
        loop {
            self.skip_trivia(diags);
            let loc = loc_of(&self.rest);
            let frag = self.fragment();
            let first = match frag.chars().next() {
                None => return Token::eof(loc),
                Some(c) => c,
            };

            if is_ident_start(first) {
                if let Ok((rest, name)) = identifier(self.rest) {
                    let text = *name.fragment();
                    let kind =
                        keyword_kind(text).unwrap_or(TokenKind::Ident);
                    self.rest = rest;
                    return Token::new(kind, text, loc);
                }
            }

            if first.is_ascii_digit() {
                if let Ok((rest, body)) = number_body(self.rest) {
                    let (kind, lexeme, err) = classify_number(body.fragment());
                    self.rest = rest;
                    if let Some(err) = err {
                        diags.report(loc, err);
                    }
                    return Token::new(kind, lexeme, loc);
                }
            }

            if first == '"' || first == '\'' {
                return self.scan_quoted(first, loc, diags);
            }

            if let Ok((rest, kind)) = multi_char_operator(self.rest) {
                self.rest = rest;
                return Token::new(kind, kind.describe(), loc);
            }

            if let Some(kind) = single_char_kind(first) {
                self.advance(first.len_utf8());
                return Token::new(kind, kind.describe(), loc);
            }

            diags.report(loc, CompileError::InvalidCharacter(first));
            self.advance(first.len_utf8());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(src: &str) -> (Vec<Token>, Diagnostics) {
        let mut diags = Diagnostics::new();
        let mut lexer = Lexer::new(src);
        let mut toks = Vec::new();
        loop {
            let tok = lexer.next(&mut diags);
            if tok.kind == TokenKind::Eof {
                break;
            }
            toks.push(tok);
        }
        (toks, diags)
    }

    fn kinds(src: &str) -> Vec<TokenKind> {
        lex_all(src).0.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_keywords_and_idents() {
        use TokenKind::*;
        assert_eq!(
            kinds("int main_1 $x while whiles"),
            vec![Int, Ident, Ident, While, Ident]
        );
    }

    #[test]
    fn test_punctuation_and_operators() {
        use TokenKind::*;
        assert_eq!(
            kinds("a <<= b >> c <= d < e"),
            vec![Ident, ShlAssign, Ident, Shr, Ident, Le, Ident, Lt, Ident]
        );
        assert_eq!(
            kinds("p->q++ - --r"),
            vec![Ident, Arrow, Ident, Inc, Minus, Dec, Ident]
        );
    }

    #[test]
    fn test_line_and_column() {
        let (toks, diags) = lex_all("int a;\n  a = 5;");
        assert!(!diags.has_errors());
        assert_eq!(toks[0].loc, SourceLoc::new(1, 1));
        assert_eq!(toks[1].loc, SourceLoc::new(1, 5));
        assert_eq!(toks[2].loc, SourceLoc::new(1, 6));
        // `a` on the second line, after two spaces
        assert_eq!(toks[3].loc, SourceLoc::new(2, 3));
        assert_eq!(toks[4].loc, SourceLoc::new(2, 5));
    }

    #[test]
    fn test_number_radixes() {
        use TokenKind::*;
        let (toks, diags) = lex_all("10 0 017 0x1F 0b101 1.25");
        assert!(!diags.has_errors());
        assert_eq!(
            toks.iter().map(|t| t.kind).collect::<Vec<_>>(),
            vec![DecLit, OctLit, OctLit, HexLit, BinLit, FloatLit]
        );
        assert_eq!(toks[3].lexeme, "0x1F");
        assert_eq!(toks[5].lexeme, "1.25");
    }

    #[test]
    fn test_invalid_octal() {
        let (toks, diags) = lex_all("09 ;");
        assert_eq!(diags.error_count(), 1);
        assert_eq!(
            format!("{}", diags.errors()[0].error),
            "invalid octal '09'"
        );
        // best-effort: the bad literal still becomes a token
        assert_eq!(toks[0].kind, TokenKind::OctLit);
        assert_eq!(toks[1].kind, TokenKind::Semicolon);
    }

    #[test]
    fn test_comments() {
        let (toks, diags) = lex_all("a // trailing\n/* multi\nline */ b");
        assert!(!diags.has_errors());
        assert_eq!(
            toks.iter().map(|t| t.lexeme.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(toks[1].loc.line, 3);
    }

    #[test]
    fn test_incomplete_comment() {
        let (_, diags) = lex_all("a /* never closed");
        assert_eq!(diags.error_count(), 1);
        assert_eq!(
            format!("{}", diags.errors()[0].error),
            "incomplete comment"
        );
    }

    #[test]
    fn test_string_literals() {
        let (toks, diags) = lex_all(r#""hello" "a\tb\n" 'c' '\n'"#);
        assert!(!diags.has_errors());
        assert_eq!(toks[0].kind, TokenKind::StrLit);
        assert_eq!(toks[0].lexeme, "hello");
        assert_eq!(toks[1].lexeme, "a\\tb\\n");
        assert_eq!(toks[2].kind, TokenKind::CharLit);
        assert_eq!(toks[2].lexeme, "c");
        assert_eq!(toks[3].lexeme, "\\n");
    }

    #[test]
    fn test_unterminated_string() {
        let (_, diags) = lex_all("\"abc\nx;");
        assert_eq!(diags.error_count(), 1);
        assert!(format!("{}", diags.errors()[0].error)
            .starts_with("missing terminating string"));
    }

    #[test]
    fn test_putback_order() {
        let mut diags = Diagnostics::new();
        let mut lexer = Lexer::new("a b c");
        let t1 = lexer.next(&mut diags);
        let t2 = lexer.next(&mut diags);
        // undo two-token lookahead: push back in reverse read order
        lexer.put_back_front(t2);
        lexer.put_back_front(t1);
        assert_eq!(lexer.next(&mut diags).lexeme, "a");
        assert_eq!(lexer.next(&mut diags).lexeme, "b");
        assert_eq!(lexer.next(&mut diags).lexeme, "c");
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut diags = Diagnostics::new();
        let mut lexer = Lexer::new("x y");
        assert_eq!(lexer.peek_nth(1, &mut diags).lexeme, "y");
        assert_eq!(lexer.peek(&mut diags).lexeme, "x");
        assert_eq!(lexer.next(&mut diags).lexeme, "x");
    }
}
