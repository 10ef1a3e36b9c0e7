//! Indentation-aware lexer for the configuration dialect.

use crate::error::{Result, ScriptError};
use crate::token::{Token, TokenKind};

/// Language constructs the dialect deliberately leaves out. Met as bare
/// words they produce a targeted syntax error instead of a confusing parse
/// failure further down.
const FORBIDDEN: &[(&str, &str)] = &[
    ("while", "while loops are not supported; use a for loop over range()"),
    ("try", "try/except is not supported; errors terminate the script"),
    ("except", "try/except is not supported; errors terminate the script"),
    ("finally", "try/except is not supported; errors terminate the script"),
    ("import", "imports are not supported; the sandbox has no modules"),
    ("from", "imports are not supported; the sandbox has no modules"),
    ("class", "class definitions are not supported; use functions and dicts"),
    ("lambda", "lambda is not supported; define a named function"),
    ("isinstance", "isinstance is not supported; compare type() results instead"),
    ("raise", "raise is not supported; call fail(message) instead"),
    ("with", "with blocks are not supported"),
    ("yield", "generators are not supported"),
    ("global", "global declarations are not supported"),
    ("assert", "assert is not supported; call fail(message) instead"),
];

pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut indents: Vec<usize> = vec![0];
    // Depth of open (), [], {} — newlines inside brackets are insignificant.
    let mut bracket_depth = 0usize;

    for (line_idx, raw_line) in source.lines().enumerate() {
        let line_no = line_idx + 1;

        // Strip comments outside strings.
        let line = strip_comment(raw_line);
        if bracket_depth == 0 {
            if line.trim().is_empty() {
                continue;
            }

            let indent = leading_spaces(&line, line_no)?;
            let current = *indents.last().unwrap();
            if indent > current {
                indents.push(indent);
                tokens.push(Token {
                    kind: TokenKind::Indent,
                    line: line_no,
                    col: 1,
                });
            } else if indent < current {
                while *indents.last().unwrap() > indent {
                    indents.pop();
                    tokens.push(Token {
                        kind: TokenKind::Dedent,
                        line: line_no,
                        col: 1,
                    });
                }
                if *indents.last().unwrap() != indent {
                    return Err(ScriptError::Syntax {
                        line: line_no,
                        col: 1,
                        message: "unindent does not match any outer level".into(),
                    });
                }
            }
        }

        lex_line(&line, line_no, &mut tokens, &mut bracket_depth)?;

        if bracket_depth == 0 {
            tokens.push(Token {
                kind: TokenKind::Newline,
                line: line_no,
                col: line.len() + 1,
            });
        }
    }

    if bracket_depth > 0 {
        return Err(ScriptError::Syntax {
            line: source.lines().count(),
            col: 1,
            message: "unclosed bracket at end of script".into(),
        });
    }

    let last_line = source.lines().count().max(1);
    while indents.len() > 1 {
        indents.pop();
        tokens.push(Token {
            kind: TokenKind::Dedent,
            line: last_line,
            col: 1,
        });
    }
    tokens.push(Token {
        kind: TokenKind::Eof,
        line: last_line,
        col: 1,
    });
    Ok(tokens)
}

fn leading_spaces(line: &str, line_no: usize) -> Result<usize> {
    let mut count = 0usize;
    for ch in line.chars() {
        match ch {
            ' ' => count += 1,
            '\t' => {
                return Err(ScriptError::Syntax {
                    line: line_no,
                    col: count + 1,
                    message: "tabs are not allowed for indentation; use spaces".into(),
                })
            }
            _ => break,
        }
    }
    Ok(count)
}

/// Remove a trailing `# comment`, respecting string literals.
fn strip_comment(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_str: Option<char> = None;
    let mut escaped = false;
    for ch in line.chars() {
        match in_str {
            Some(quote) => {
                out.push(ch);
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == quote {
                    in_str = None;
                }
            }
            None => {
                if ch == '#' {
                    break;
                }
                if ch == '"' || ch == '\'' {
                    in_str = Some(ch);
                }
                out.push(ch);
            }
        }
    }
    out
}

fn lex_line(
    line: &str,
    line_no: usize,
    tokens: &mut Vec<Token>,
    bracket_depth: &mut usize,
) -> Result<()> {
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;

    while i < chars.len() {
        let ch = chars[i];
        let col = i + 1;

        if ch == ' ' {
            i += 1;
            continue;
        }
        if ch == '\t' {
            return Err(ScriptError::Syntax {
                line: line_no,
                col,
                message: "tab characters are not allowed".into(),
            });
        }

        // Numbers
        if ch.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let mut is_float = false;
            if i < chars.len() && chars[i] == '.' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit()
            {
                is_float = true;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let kind = if is_float {
                TokenKind::Float(text.parse().map_err(|_| ScriptError::Syntax {
                    line: line_no,
                    col,
                    message: format!("bad float literal: {text}"),
                })?)
            } else {
                TokenKind::Int(text.parse().map_err(|_| ScriptError::Syntax {
                    line: line_no,
                    col,
                    message: format!("integer literal out of range: {text}"),
                })?)
            };
            tokens.push(Token {
                kind,
                line: line_no,
                col,
            });
            continue;
        }

        // Identifiers and keywords
        if ch.is_ascii_alphabetic() || ch == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            if let Some((_, reason)) = FORBIDDEN.iter().find(|(w, _)| *w == word) {
                return Err(ScriptError::Syntax {
                    line: line_no,
                    col,
                    message: (*reason).to_string(),
                });
            }
            let kind = match word.as_str() {
                "def" => TokenKind::Def,
                "return" => TokenKind::Return,
                "if" => TokenKind::If,
                "elif" => TokenKind::Elif,
                "else" => TokenKind::Else,
                "for" => TokenKind::For,
                "in" => TokenKind::In,
                "not" => TokenKind::Not,
                "and" => TokenKind::And,
                "or" => TokenKind::Or,
                "True" => TokenKind::True,
                "False" => TokenKind::False,
                "None" => TokenKind::NoneLit,
                "break" => TokenKind::Break,
                "continue" => TokenKind::Continue,
                "pass" => TokenKind::Pass,
                _ => TokenKind::Ident(word),
            };
            tokens.push(Token {
                kind,
                line: line_no,
                col,
            });
            continue;
        }

        // Strings
        if ch == '"' || ch == '\'' {
            let quote = ch;
            let mut value = String::new();
            i += 1;
            let mut closed = false;
            while i < chars.len() {
                let c = chars[i];
                if c == '\\' {
                    i += 1;
                    let esc = chars.get(i).copied().ok_or(ScriptError::Syntax {
                        line: line_no,
                        col,
                        message: "unterminated escape sequence".into(),
                    })?;
                    value.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '\\' => '\\',
                        '\'' => '\'',
                        '"' => '"',
                        '0' => '\0',
                        other => {
                            return Err(ScriptError::Syntax {
                                line: line_no,
                                col: i + 1,
                                message: format!("unknown escape sequence: \\{other}"),
                            })
                        }
                    });
                    i += 1;
                } else if c == quote {
                    closed = true;
                    i += 1;
                    break;
                } else {
                    value.push(c);
                    i += 1;
                }
            }
            if !closed {
                return Err(ScriptError::Syntax {
                    line: line_no,
                    col,
                    message: "unterminated string literal".into(),
                });
            }
            tokens.push(Token {
                kind: TokenKind::Str(value),
                line: line_no,
                col,
            });
            continue;
        }

        // Operators & punctuation
        let two: Option<TokenKind> = if i + 1 < chars.len() {
            match (ch, chars[i + 1]) {
                ('/', '/') => Some(TokenKind::DoubleSlash),
                ('*', '*') => Some(TokenKind::DoubleStar),
                ('=', '=') => Some(TokenKind::Eq),
                ('!', '=') => Some(TokenKind::NotEq),
                ('<', '=') => Some(TokenKind::LtEq),
                ('>', '=') => Some(TokenKind::GtEq),
                ('+', '=') => Some(TokenKind::PlusAssign),
                _ => None,
            }
        } else {
            None
        };
        if let Some(kind) = two {
            tokens.push(Token {
                kind,
                line: line_no,
                col,
            });
            i += 2;
            continue;
        }

        let kind = match ch {
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '=' => TokenKind::Assign,
            '<' => TokenKind::Lt,
            '>' => TokenKind::Gt,
            '(' => {
                *bracket_depth += 1;
                TokenKind::LParen
            }
            ')' => {
                *bracket_depth = bracket_depth.saturating_sub(1);
                TokenKind::RParen
            }
            '[' => {
                *bracket_depth += 1;
                TokenKind::LBracket
            }
            ']' => {
                *bracket_depth = bracket_depth.saturating_sub(1);
                TokenKind::RBracket
            }
            '{' => {
                *bracket_depth += 1;
                TokenKind::LBrace
            }
            '}' => {
                *bracket_depth = bracket_depth.saturating_sub(1);
                TokenKind::RBrace
            }
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            '.' => {
                return Err(ScriptError::Syntax {
                    line: line_no,
                    col,
                    message: "attribute access is not supported; use the builtin functions".into(),
                })
            }
            other => {
                return Err(ScriptError::Syntax {
                    line: line_no,
                    col,
                    message: format!("unexpected character: {other:?}"),
                })
            }
        };
        tokens.push(Token {
            kind,
            line: line_no,
            col,
        });
        i += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn basic_line() {
        let toks = kinds("x = 1 + 2");
        assert_eq!(
            toks,
            vec![
                TokenKind::Ident("x".into()),
                TokenKind::Assign,
                TokenKind::Int(1),
                TokenKind::Plus,
                TokenKind::Int(2),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn indentation_produces_indent_dedent() {
        let toks = kinds("def f():\n    return 1\nx = 2");
        assert!(toks.contains(&TokenKind::Indent));
        assert!(toks.contains(&TokenKind::Dedent));
    }

    #[test]
    fn forbidden_keywords_error_with_hint() {
        let err = tokenize("while True:\n    pass").unwrap_err();
        match err {
            ScriptError::Syntax { line, message, .. } => {
                assert_eq!(line, 1);
                assert!(message.contains("while loops are not supported"));
            }
            other => panic!("expected syntax error, got {other:?}"),
        }
        assert!(tokenize("import os").is_err());
        assert!(tokenize("isinstance(x, int)").is_err());
        assert!(tokenize("try:\n    pass").is_err());
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let toks = kinds("# leading comment\n\nx = 1  # trailing\n");
        assert_eq!(toks.len(), 5); // x = 1 NEWLINE EOF
    }

    #[test]
    fn hash_inside_string_is_not_a_comment() {
        let toks = kinds("x = \"a # b\"");
        assert!(toks.contains(&TokenKind::Str("a # b".into())));
    }

    #[test]
    fn newlines_inside_brackets_are_insignificant() {
        let toks = kinds("x = [1,\n     2,\n     3]");
        let newlines = toks.iter().filter(|k| **k == TokenKind::Newline).count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn string_escapes() {
        let toks = kinds(r#"s = "line\nnext""#);
        assert!(toks.contains(&TokenKind::Str("line\nnext".into())));
    }

    #[test]
    fn floats_and_ints() {
        let toks = kinds("a = 3.14\nb = 42");
        assert!(toks.contains(&TokenKind::Float(3.14)));
        assert!(toks.contains(&TokenKind::Int(42)));
    }

    #[test]
    fn attribute_access_rejected() {
        let err = tokenize("x.append(1)").unwrap_err();
        assert!(err.to_string().contains("attribute access"));
    }
}
