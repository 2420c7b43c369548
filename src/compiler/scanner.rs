use radix_trie::Trie;
use thiserror::Error;

use super::token::{Token, TokenKind};
use super::util::StrCursor;

#[derive(Debug, Clone, Error)]
pub enum ScannerError {
    #[error("[line {line}] Error: Unterminated string.")]
    UnterminatedString { line: u64 },

    #[error("[line {line}] Error: Unexpected character '{ch}'.")]
    UnexpectedCharacter { ch: char, line: u64 },
}

pub struct Scanner<'a> {
    source: &'a str,
    cursor: StrCursor<'a>,
    start: usize,
    keywords: Trie<&'static str, TokenKind>,
    line: u64,
}

const KEYWORDS: [(&str, TokenKind); 16] = [
    ("and", TokenKind::And),
    ("class", TokenKind::Class),
    ("else", TokenKind::Else),
    ("false", TokenKind::False),
    ("for", TokenKind::For),
    ("fun", TokenKind::Fun),
    ("if", TokenKind::If),
    ("nil", TokenKind::Nil),
    ("or", TokenKind::Or),
    ("print", TokenKind::Print),
    ("return", TokenKind::Return),
    ("super", TokenKind::Super),
    ("this", TokenKind::This),
    ("true", TokenKind::True),
    ("var", TokenKind::Var),
    ("while", TokenKind::While),
];

fn is_identifier_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_identifier_part(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Self {
        let mut keywords = Trie::new();
        for (keyword, kind) in KEYWORDS.iter() {
            keywords.insert(*keyword, *kind);
        }

        Self {
            source,
            cursor: StrCursor::new(source),
            start: 0,
            keywords,
            line: 1,
        }
    }

    pub fn scan_token(&mut self) -> Result<Token<'a>, ScannerError> {
        self.skip_whitespace();
        self.start = self.cursor.index;

        let ch = match self.cursor.advance() {
            Some(ch) => ch,
            None => return Ok(self.make_token(TokenKind::EOF)),
        };

        let token = match ch {
            '(' => self.make_token(TokenKind::ParenLeft),
            ')' => self.make_token(TokenKind::ParenRight),
            '{' => self.make_token(TokenKind::BraceLeft),
            '}' => self.make_token(TokenKind::BraceRight),
            ';' => self.make_token(TokenKind::Semicolon),
            ',' => self.make_token(TokenKind::Comma),
            '.' => self.make_token(TokenKind::Dot),
            '-' => self.make_token(TokenKind::Minus),
            '+' => self.make_token(TokenKind::Plus),
            '/' => self.make_token(TokenKind::Slash),
            '*' => self.make_token(TokenKind::Star),
            '!' => self.make_token_match('=', TokenKind::BangEqual, TokenKind::Bang),
            '=' => self.make_token_match('=', TokenKind::EqualEqual, TokenKind::Equal),
            '<' => self.make_token_match('=', TokenKind::LessEqual, TokenKind::Less),
            '>' => self.make_token_match('=', TokenKind::GreaterEqual, TokenKind::Greater),
            '"' => self.string_token()?,
            ch if ch.is_ascii_digit() => self.number_token(),
            ch if is_identifier_start(ch) => self.identifier_token(),
            ch => {
                return Err(ScannerError::UnexpectedCharacter {
                    ch,
                    line: self.line,
                })
            }
        };
        Ok(token)
    }

    fn matches(&mut self, expected: char) -> bool {
        if let Some(ch) = self.cursor.peek() {
            if ch == expected {
                self.cursor.advance();
                return true;
            }
        }
        false
    }

    fn make_token(&self, kind: TokenKind) -> Token<'a> {
        let lexeme = &self.source[self.start..self.cursor.index];
        Token::new(kind, lexeme, self.line)
    }

    fn make_token_match(
        &mut self,
        expected: char,
        if_matches: TokenKind,
        otherwise: TokenKind,
    ) -> Token<'a> {
        if self.matches(expected) {
            self.make_token(if_matches)
        } else {
            self.make_token(otherwise)
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.cursor.peek() {
            match ch {
                '\n' => {
                    self.line += 1;
                    self.cursor.advance();
                }
                '/' => {
                    if self.cursor.peek_next() == Some('/') {
                        // A comment runs to the end of the line; the newline
                        // itself is handled by the next loop iteration.
                        self.cursor.advance_while(|ch| ch != '\n');
                    } else {
                        return;
                    }
                }
                ch if ch.is_whitespace() => {
                    self.cursor.advance();
                }
                _ => return,
            }
        }
    }

    fn identifier_token(&mut self) -> Token<'a> {
        self.cursor.advance_while(is_identifier_part);

        let identifier = &self.source[self.start..self.cursor.index];
        if let Some(kind) = self.keywords.get(identifier) {
            self.make_token(*kind)
        } else {
            self.make_token(TokenKind::Identifier)
        }
    }

    fn number_token(&mut self) -> Token<'a> {
        self.cursor.advance_while(|ch| ch.is_ascii_digit());

        // A fractional part requires a digit after the dot, otherwise the
        // dot is left alone as a property access.
        if self.cursor.peek() == Some('.') {
            if let Some(ch) = self.cursor.peek_next() {
                if ch.is_ascii_digit() {
                    self.cursor.advance();
                    self.cursor.advance_while(|ch| ch.is_ascii_digit());
                }
            }
        }

        self.make_token(TokenKind::Number)
    }

    fn string_token(&mut self) -> Result<Token<'a>, ScannerError> {
        while let Some(ch) = self.cursor.peek() {
            if ch == '\n' {
                self.line += 1;
            }
            self.cursor.advance();
            if ch == '"' {
                return Ok(self.make_token(TokenKind::String));
            }
        }
        Err(ScannerError::UnterminatedString { line: self.line })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_kinds(source: &str) -> Vec<TokenKind> {
        let mut scanner = Scanner::new(source);
        let mut kinds = Vec::new();
        loop {
            let token = scanner.scan_token().unwrap();
            let kind = token.kind;
            kinds.push(kind);
            if kind == TokenKind::EOF {
                return kinds;
            }
        }
    }

    #[test]
    fn scan_operators() {
        assert_eq!(
            scan_kinds("( ) { } , . ; + - * / ! != = == > >= < <="),
            vec![
                TokenKind::ParenLeft,
                TokenKind::ParenRight,
                TokenKind::BraceLeft,
                TokenKind::BraceRight,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Semicolon,
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Bang,
                TokenKind::BangEqual,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn scan_keywords_and_identifiers() {
        assert_eq!(
            scan_kinds("class classy _under var x1"),
            vec![
                TokenKind::Class,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn scan_numbers() {
        let mut scanner = Scanner::new("12 3.25 4.");
        assert_eq!(scanner.scan_token().unwrap().lexeme, "12");
        assert_eq!(scanner.scan_token().unwrap().lexeme, "3.25");
        // No trailing dot: `4.` scans as a number followed by a dot.
        assert_eq!(scanner.scan_token().unwrap().lexeme, "4");
        assert_eq!(scanner.scan_token().unwrap().kind, TokenKind::Dot);
    }

    #[test]
    fn scan_string_spans_lines() {
        let mut scanner = Scanner::new("\"one\ntwo\" x");
        let token = scanner.scan_token().unwrap();
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(token.lexeme, "\"one\ntwo\"");
        assert_eq!(scanner.scan_token().unwrap().line, 2);
    }

    #[test]
    fn scan_unterminated_string() {
        let mut scanner = Scanner::new("\"oops");
        assert!(matches!(
            scanner.scan_token(),
            Err(ScannerError::UnterminatedString { .. })
        ));
    }

    #[test]
    fn scan_comments_and_lines() {
        let mut scanner = Scanner::new("// nothing here\nprint");
        let token = scanner.scan_token().unwrap();
        assert_eq!(token.kind, TokenKind::Print);
        assert_eq!(token.line, 2);
    }

    #[test]
    fn scan_rejects_non_ascii() {
        let mut scanner = Scanner::new("å");
        assert!(matches!(
            scanner.scan_token(),
            Err(ScannerError::UnexpectedCharacter { .. })
        ));
    }
}
