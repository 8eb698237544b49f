//! Regex-driven token source (C5).

use fancy_regex::Regex;
use std::sync::OnceLock;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Identifier,
    QuotedIdentifier,
    IntegerLiteral,
    RealLiteral,
    StringLiteral,
    DateLiteral,
    TimeLiteral,
    TimestampLiteral,
    BooleanLiteral,
    Keyword(Keyword),
    Punct(Punct),
    Eoi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Punct {
    LParen,
    RParen,
    Comma,
    Dot,
    Semicolon,
    Star,
    Plus,
    Minus,
    Slash,
    Percent,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Concat,
}

macro_rules! keywords {
    ($($variant:ident => $text:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Keyword {
            $($variant),*
        }

        impl Keyword {
            pub fn from_text(s: &str) -> Option<Keyword> {
                match s {
                    $($text => Some(Keyword::$variant),)*
                    _ => None,
                }
            }

            pub fn text(self) -> &'static str {
                match self {
                    $(Keyword::$variant => $text),*
                }
            }
        }
    };
}

keywords! {
    Select => "SELECT", From => "FROM", Where => "WHERE", Group => "GROUP", By => "BY",
    Having => "HAVING", Order => "ORDER", Asc => "ASC", Desc => "DESC", Limit => "LIMIT",
    Offset => "OFFSET", As => "AS", Distinct => "DISTINCT", All => "ALL",
    Union => "UNION", Intersect => "INTERSECT", Except => "EXCEPT",
    Join => "JOIN", Inner => "INNER", Outer => "OUTER", Left => "LEFT", Right => "RIGHT",
    Full => "FULL", Cross => "CROSS", Natural => "NATURAL", On => "ON", Using => "USING",
    And => "AND", Or => "OR", Not => "NOT", Is => "IS", Null => "NULL",
    True => "TRUE", False => "FALSE", Between => "BETWEEN", In => "IN", Like => "LIKE",
    Case => "CASE", When => "WHEN", Then => "THEN", Else => "ELSE", End => "END",
    Cast => "CAST", Create => "CREATE", Drop => "DROP", Alter => "ALTER", Table => "TABLE",
    Add => "ADD", Column => "COLUMN", Mapping => "MAPPING", Primary => "PRIMARY", Key => "KEY",
    Unique => "UNIQUE", Default => "DEFAULT", Check => "CHECK", Explain => "EXPLAIN",
    Ast => "AST", Exec => "EXEC", Date => "DATE", Time => "TIME", Timestamp => "TIMESTAMP",
    Boolean => "BOOLEAN", Integer => "INTEGER", Real => "REAL", Varchar => "VARCHAR",
    NotNull => "NOTNULL",
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
    pub column: usize,
}

struct Rule {
    regex: Regex,
    make: fn(&str) -> TokenKind,
}

fn rules() -> &'static Vec<Rule> {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        vec![
            Rule {
                regex: Regex::new(r"^TIMESTAMP'[^']*'").unwrap(),
                make: |_| TokenKind::TimestampLiteral,
            },
            Rule {
                regex: Regex::new(r"^DATE'[^']*'").unwrap(),
                make: |_| TokenKind::DateLiteral,
            },
            Rule {
                regex: Regex::new(r"^TIME'[^']*'").unwrap(),
                make: |_| TokenKind::TimeLiteral,
            },
            Rule {
                regex: Regex::new(r"^'(?:[^'\\]|\\.)*'").unwrap(),
                make: |_| TokenKind::StringLiteral,
            },
            Rule {
                regex: Regex::new(r#"^"(?:[^"\\]|\\.)*""#).unwrap(),
                make: |_| TokenKind::QuotedIdentifier,
            },
            Rule {
                regex: Regex::new(r"^\d+\.\d+([eE][+-]?\d+)?").unwrap(),
                make: |_| TokenKind::RealLiteral,
            },
            Rule {
                regex: Regex::new(r"^\d+").unwrap(),
                make: |_| TokenKind::IntegerLiteral,
            },
            Rule {
                regex: Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*").unwrap(),
                make: |text| {
                    let upper = text.to_ascii_uppercase();
                    if upper == "TRUE" || upper == "FALSE" {
                        TokenKind::BooleanLiteral
                    } else if let Some(kw) = Keyword::from_text(&upper) {
                        TokenKind::Keyword(kw)
                    } else {
                        TokenKind::Identifier
                    }
                },
            },
            Rule {
                regex: Regex::new(r"^<>|^!=").unwrap(),
                make: |_| TokenKind::Punct(Punct::Neq),
            },
            Rule {
                regex: Regex::new(r"^<=").unwrap(),
                make: |_| TokenKind::Punct(Punct::Le),
            },
            Rule {
                regex: Regex::new(r"^>=").unwrap(),
                make: |_| TokenKind::Punct(Punct::Ge),
            },
            Rule {
                regex: Regex::new(r"^\|\|").unwrap(),
                make: |_| TokenKind::Punct(Punct::Concat),
            },
            Rule {
                regex: Regex::new(r"^[(),.;*+\-/%=<>]").unwrap(),
                make: |text| {
                    TokenKind::Punct(match text {
                        "(" => Punct::LParen,
                        ")" => Punct::RParen,
                        "," => Punct::Comma,
                        "." => Punct::Dot,
                        ";" => Punct::Semicolon,
                        "*" => Punct::Star,
                        "+" => Punct::Plus,
                        "-" => Punct::Minus,
                        "/" => Punct::Slash,
                        "%" => Punct::Percent,
                        "=" => Punct::Eq,
                        "<" => Punct::Lt,
                        ">" => Punct::Gt,
                        _ => Punct::Eq, // unreachable for valid single-char punctuation
                    })
                },
            },
        ]
    })
}

/// A regex-driven token stream over SQL text. `next()` skips whitespace and
/// returns the next token; an unmatched character raises
/// `LexicalAnalysisException`. End of input yields a single `Eoi` token,
/// then keeps returning it.
#[derive(Clone)]
pub struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Lexer<'a> {
        Lexer {
            input,
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    pub fn set_input(&mut self, input: &'a str) {
        self.input = input;
        self.pos = 0;
        self.line = 1;
        self.column = 1;
    }

    fn advance(&mut self, n: usize) {
        for ch in self.input[self.pos..self.pos + n].chars() {
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        self.pos += n;
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.input[self.pos..].chars().next() {
            if ch.is_whitespace() {
                self.advance(ch.len_utf8());
            } else if self.input[self.pos..].starts_with("--") {
                let rest = &self.input[self.pos..];
                let len = rest.find('\n').unwrap_or(rest.len());
                self.advance(len);
            } else {
                break;
            }
        }
    }

    pub fn next(&mut self) -> Result<Token> {
        self.skip_whitespace();
        let (line, column) = (self.line, self.column);
        if self.pos >= self.input.len() {
            return Ok(Token {
                kind: TokenKind::Eoi,
                text: String::new(),
                line,
                column,
            });
        }
        let rest = &self.input[self.pos..];
        for rule in rules() {
            if let Ok(Some(m)) = rule.regex.find(rest) {
                if m.start() == 0 && m.end() > 0 {
                    let raw = m.as_str();
                    let kind = (rule.make)(raw);
                    let text = render_text(kind, raw);
                    self.advance(raw.len());
                    return Ok(Token {
                        kind,
                        text,
                        line,
                        column,
                    });
                }
            }
        }
        Err(Error::LexicalAnalysis { line, column })
    }
}

/// Identifiers are upper-cased on read; quoted identifiers retain case but
/// strip surrounding quotes; string literals strip surrounding quotes
/// without case change.
fn render_text(kind: TokenKind, raw: &str) -> String {
    match kind {
        TokenKind::Identifier => raw.to_ascii_uppercase(),
        TokenKind::QuotedIdentifier => raw[1..raw.len() - 1].to_string(),
        TokenKind::StringLiteral => raw[1..raw.len() - 1].to_string(),
        TokenKind::DateLiteral | TokenKind::TimeLiteral | TokenKind::TimestampLiteral => {
            let quote = raw.find('\'').unwrap();
            raw[quote + 1..raw.len() - 1].to_string()
        }
        _ => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(input);
        let mut out = Vec::new();
        loop {
            let tok = lexer.next().unwrap();
            if matches!(tok.kind, TokenKind::Eoi) {
                break;
            }
            out.push(tok.kind);
        }
        out
    }

    #[test]
    fn lexes_simple_select() {
        let kinds = kinds("SELECT 1 FROM SYSTEM_DUAL");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Keyword(Keyword::Select),
                TokenKind::IntegerLiteral,
                TokenKind::Keyword(Keyword::From),
                TokenKind::Identifier,
            ]
        );
    }

    #[test]
    fn identifiers_are_upper_cased() {
        let mut lexer = Lexer::new("emp_no");
        let tok = lexer.next().unwrap();
        assert_eq!(tok.text, "EMP_NO");
    }

    #[test]
    fn quoted_identifiers_keep_case() {
        let mut lexer = Lexer::new("\"Emp_No\"");
        let tok = lexer.next().unwrap();
        assert_eq!(tok.text, "Emp_No");
    }

    #[test]
    fn unmatched_character_raises() {
        let mut lexer = Lexer::new("\u{7}");
        let err = lexer.next();
        assert!(err.is_err());
    }

    #[test]
    fn eoi_at_end() {
        let mut lexer = Lexer::new("");
        assert!(matches!(lexer.next().unwrap().kind, TokenKind::Eoi));
    }
}
