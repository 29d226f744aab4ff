use logos::Logos;

use crate::ast::Span;

/// Tokens of value-type specs and tensor literals.
#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n]+")]
pub enum Token {
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,
    #[token(":")]
    Colon,
    #[token(",")]
    Comma,

    #[regex(r"-?[0-9]+(\.[0-9]+)?([eE][-+]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),

    #[regex(r#""[^"]*""#, |lex| {
        let s = lex.slice();
        Some(s[1..s.len()-1].to_string())
    })]
    Text(String),

    // Dimension names, cell types and bare labels.
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_.\-]*", |lex| lex.slice().to_string())]
    Ident(String),
}

/// Lex spec or literal text into tokens with their spans.
pub fn lex(source: &str) -> Result<Vec<(Token, Span)>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        let range = lexer.span();
        match result {
            Ok(token) => tokens.push((token, Span { start: range.start, end: range.end })),
            Err(()) => {
                return Err(LexError {
                    position: range.start,
                    snippet: source[range.clone()].to_string(),
                    suggestion: suggest_fix(&source[range]),
                });
            }
        }
    }

    Ok(tokens)
}

fn suggest_fix(bad_token: &str) -> String {
    if bad_token.starts_with('"') {
        "Close the quoted label with '\"'".to_string()
    } else if bad_token.starts_with('\'') {
        "Quote labels with double quotes".to_string()
    } else {
        format!("Unexpected character(s): '{}'", bad_token)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Lex error at position {position}: '{snippet}'. {suggestion}")]
pub struct LexError {
    pub position: usize,
    pub snippet: String,
    pub suggestion: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        lex(source).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn lex_type_spec() {
        assert_eq!(
            kinds("tensor<float>(x{},y[3])"),
            vec![
                Token::Ident("tensor".into()),
                Token::Less,
                Token::Ident("float".into()),
                Token::Greater,
                Token::LParen,
                Token::Ident("x".into()),
                Token::LBrace,
                Token::RBrace,
                Token::Comma,
                Token::Ident("y".into()),
                Token::LBracket,
                Token::Number(3.0),
                Token::RBracket,
                Token::RParen,
            ]
        );
    }

    #[test]
    fn lex_numbers_and_labels() {
        assert_eq!(
            kinds(r#"-1.5e2 "a b" foo-bar"#),
            vec![Token::Number(-150.0), Token::Text("a b".into()), Token::Ident("foo-bar".into())]
        );
    }

    #[test]
    fn lex_error_reports_position() {
        let err = lex("tensor(x[2]) @").unwrap_err();
        assert_eq!(err.position, 13);
        assert_eq!(err.snippet, "@");
    }
}
