use std::{env, fmt, path::PathBuf};

#[derive(Debug, Clone)]
enum Token {
    Flag(String),
    Path(PathBuf),
}

fn lex(iter: &mut env::Args) -> Vec<Token> {
    iter.next();
    iter.map(|string| {
        if string.starts_with('-') {
            Token::Flag(string)
        } else {
            Token::Path(PathBuf::from(string))
        }
    })
    .collect()
}

#[derive(Debug, Clone)]
pub enum EvalMode {
    File(PathBuf),
    Repl,
}

#[derive(Debug, Clone)]
pub enum ParseError {
    UnknownFlag(String),
    TooManyArguments,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFlag(flag) => write!(f, "unknown flag '{flag}'"),
            Self::TooManyArguments => write!(f, "usage: lox [path]"),
        }
    }
}

/// A single optional path argument; anything else is a usage error.
/// Grounded on the teacher's own hand-rolled `env::args()` lexer/parser
/// rather than a `clap` dependency.
pub fn eval_mode() -> Result<EvalMode, ParseError> {
    let tokens = lex(&mut env::args());
    let mut path = None;
    for token in tokens {
        match token {
            Token::Flag(flag) => return Err(ParseError::UnknownFlag(flag)),
            Token::Path(p) if path.is_none() => path = Some(p),
            Token::Path(_) => return Err(ParseError::TooManyArguments),
        }
    }
    Ok(match path {
        Some(path) => EvalMode::File(path),
        None => EvalMode::Repl,
    })
}
