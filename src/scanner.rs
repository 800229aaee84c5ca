use std::num::IntErrorKind;

use thiserror::Error;

use crate::token::{Token, TokenKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("line {line}: integer out of bounds")]
    IntegerOutOfBounds { line: usize },
}

/// Longest recognized delimiter is two characters (`==`, `<=`, `&&`, ...).
const MAX_DELIM_LEN: usize = 2;

/// Scan source lines into a token list.
///
/// Lines are expected without their trailing newline (`str::lines` output);
/// the element at index `i` is reported as 1-based line `i + 1`.
pub fn scan(lines: &[&str]) -> Result<Vec<Token>, ScanError> {
    let mut tokens = Vec::new();
    for (index, line) in lines.iter().enumerate() {
        scan_line(index + 1, line, &mut tokens)?;
    }
    Ok(tokens)
}

fn scan_line(line_num: usize, line: &str, tokens: &mut Vec<Token>) -> Result<(), ScanError> {
    let mut start = 0;
    let mut i = 0;
    while i < line.len() {
        let mut matched = false;
        // Longest-match: try delimiter candidates from longest to shortest.
        for len in (1..=MAX_DELIM_LEN.min(line.len() - i)).rev() {
            let Some(candidate) = line.get(i..i + len) else {
                continue;
            };
            let Some(delim) = delimiter(candidate) else {
                continue;
            };
            if start != i {
                tokens.push(classify_span(&line[start..i], line_num));
            }
            if let Some(kind) = delim {
                tokens.push(Token::new(kind, candidate, line_num));
            }
            start = i + len;
            i += len;
            matched = true;
            break;
        }
        if !matched {
            i += 1;
        }
    }
    if start != line.len() {
        tokens.push(classify_span(&line[start..], line_num));
    }

    // Numeric reclassification: retype any token whose text fully parses as a
    // base-10 integer. Runs over the whole list (idempotent for earlier lines).
    for token in tokens.iter_mut() {
        match token.text.parse::<i32>() {
            Ok(value) => {
                token.kind = TokenKind::Number;
                token.literal = Some(value);
            }
            Err(err) => match err.kind() {
                IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => {
                    return Err(ScanError::IntegerOutOfBounds { line: token.line });
                }
                _ => {}
            },
        }
    }

    Ok(())
}

fn classify_span(text: &str, line: usize) -> Token {
    let kind = keyword(text).unwrap_or(TokenKind::Identifier);
    Token::new(kind, text, line)
}

fn keyword(text: &str) -> Option<TokenKind> {
    let kind = match text {
        "else" => TokenKind::Else,
        "false" => TokenKind::False,
        "for" => TokenKind::For,
        "if" => TokenKind::If,
        "return" => TokenKind::Return,
        "true" => TokenKind::True,
        "while" => TokenKind::While,
        "continue" => TokenKind::Continue,
        "break" => TokenKind::Break,
        "int" => TokenKind::Int,
        "char" => TokenKind::Char,
        _ => return None,
    };
    Some(kind)
}

/// `Some(None)` is a whitespace delimiter: it splits spans but emits nothing.
fn delimiter(text: &str) -> Option<Option<TokenKind>> {
    let kind = match text {
        " " | "\t" | "\n" => return Some(None),
        "(" => TokenKind::LParen,
        ")" => TokenKind::RParen,
        "{" => TokenKind::LBrace,
        "}" => TokenKind::RBrace,
        "," => TokenKind::Comma,
        "." => TokenKind::Dot,
        "-" => TokenKind::Minus,
        "+" => TokenKind::Plus,
        ";" => TokenKind::Semicolon,
        "/" => TokenKind::Slash,
        "*" => TokenKind::Star,
        "%" => TokenKind::Percent,
        "!" => TokenKind::Bang,
        "!=" => TokenKind::BangEqual,
        "=" => TokenKind::Equal,
        "==" => TokenKind::EqualEqual,
        ">" => TokenKind::Greater,
        ">=" => TokenKind::GreaterEqual,
        "<" => TokenKind::Less,
        "<=" => TokenKind::LessEqual,
        "&&" => TokenKind::And,
        "||" => TokenKind::Or,
        _ => return None,
    };
    Some(Some(kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(tokens: &[Token]) -> Vec<TokenKind> {
        tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn scans_assignment() {
        let tokens = scan(&["a = 1;"]).expect("scan failed");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Identifier,
                TokenKind::Equal,
                TokenKind::Number,
                TokenKind::Semicolon,
            ]
        );
        assert_eq!(tokens[0].text, "a");
        assert_eq!(tokens[2].literal, Some(1));
    }

    #[test]
    fn prefers_longest_delimiter() {
        let tokens = scan(&["a<=b == c"]).expect("scan failed");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Identifier,
                TokenKind::LessEqual,
                TokenKind::Identifier,
                TokenKind::EqualEqual,
                TokenKind::Identifier,
            ]
        );
    }

    #[test]
    fn splits_adjacent_single_char_operators() {
        let tokens = scan(&["a = = b"]).expect("scan failed");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Identifier,
                TokenKind::Equal,
                TokenKind::Equal,
                TokenKind::Identifier,
            ]
        );
    }

    #[test]
    fn classifies_keywords_exactly() {
        let tokens = scan(&["for iffy if"]).expect("scan failed");
        assert_eq!(
            kinds(&tokens),
            vec![TokenKind::For, TokenKind::Identifier, TokenKind::If]
        );
    }

    #[test]
    fn records_one_based_lines() {
        let tokens = scan(&["a", "", "b"]).expect("scan failed");
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 3);
    }

    #[test]
    fn whitespace_emits_nothing() {
        let tokens = scan(&["  \t  "]).expect("scan failed");
        assert!(tokens.is_empty());
    }

    #[test]
    fn rejects_out_of_range_integer() {
        let err = scan(&["x = 0;", "y = 2147483648;"]).unwrap_err();
        assert_eq!(err, ScanError::IntegerOutOfBounds { line: 2 });
    }

    #[test]
    fn accepts_extreme_in_range_integer() {
        let tokens = scan(&["2147483647"]).expect("scan failed");
        assert_eq!(tokens[0].literal, Some(i32::MAX));
    }

    #[test]
    fn rescan_of_reconstructed_text_is_stable() {
        let tokens = scan(&["for (i = 0; i <= 10; i = i + 1) { put(i); }"]).expect("scan failed");
        let reconstructed: Vec<String> = tokens.iter().map(|t| t.text.clone()).collect();
        let joined = reconstructed.join(" ");
        let rescanned = scan(&[joined.as_str()]).expect("rescan failed");
        assert_eq!(kinds(&rescanned), kinds(&tokens));
        let texts: Vec<&str> = rescanned.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, reconstructed);
    }
}
