//! Lightweight SQL inspection.
//!
//! Transaction control is owned by the engine, so statement text must not
//! open, close or checkpoint transactions on its own. Detection is a keyword
//! check at the start of every statement in the text; no full parse is done.

use sqlparser::dialect::SQLiteDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer};
use tracing::debug;

use crate::error::ServerError;

const CONTROL_KEYWORDS: [(Keyword, &str); 6] = [
    (Keyword::BEGIN, "BEGIN"),
    (Keyword::COMMIT, "COMMIT"),
    (Keyword::END, "END"),
    (Keyword::ROLLBACK, "ROLLBACK"),
    (Keyword::SAVEPOINT, "SAVEPOINT"),
    (Keyword::RELEASE, "RELEASE"),
];

/// Returns the transaction-control keyword that starts any statement in
/// `sql`, if there is one.
pub fn transaction_control_keyword(sql: &str) -> Option<&'static str> {
    match Tokenizer::new(&SQLiteDialect {}, sql).tokenize() {
        Ok(tokens) => keyword_from_tokens(&tokens),
        Err(err) => {
            debug!(error = %err, "tokenizer failed, falling back to prefix check");
            keyword_from_prefix(sql)
        }
    }
}

/// Rejects statement text that would take over transaction control.
pub fn reject_transaction_control(sql: &str) -> Result<(), ServerError> {
    match transaction_control_keyword(sql) {
        Some(keyword) => Err(ServerError::ProtocolViolation(format!(
            "{keyword} is not allowed in statement text; use the transaction commands"
        ))),
        None => Ok(()),
    }
}

fn keyword_from_tokens(tokens: &[Token]) -> Option<&'static str> {
    let mut at_statement_start = true;
    let mut starts_with_create = false;
    let mut creates_trigger = false;
    // inside `CREATE TRIGGER ... BEGIN ... END`, `;` separates body statements
    let mut in_trigger_body = false;
    let mut case_depth = 0usize;
    for token in tokens {
        match token {
            // comments are whitespace tokens
            Token::Whitespace(_) => continue,
            Token::SemiColon if in_trigger_body => {}
            Token::SemiColon => {
                at_statement_start = true;
                starts_with_create = false;
                creates_trigger = false;
            }
            Token::Word(word) if at_statement_start => {
                if word.quote_style.is_none() {
                    if let Some((_, name)) =
                        CONTROL_KEYWORDS.iter().find(|(kw, _)| *kw == word.keyword)
                    {
                        return Some(*name);
                    }
                }
                starts_with_create = word.quote_style.is_none() && word.keyword == Keyword::CREATE;
                at_statement_start = false;
            }
            Token::Word(word) if word.quote_style.is_none() => match word.keyword {
                Keyword::TRIGGER if starts_with_create => creates_trigger = true,
                Keyword::BEGIN if creates_trigger && !in_trigger_body => in_trigger_body = true,
                Keyword::CASE if in_trigger_body => case_depth += 1,
                Keyword::END if in_trigger_body => {
                    if case_depth > 0 {
                        case_depth -= 1;
                    } else {
                        in_trigger_body = false;
                    }
                }
                _ => {}
            },
            _ => at_statement_start = false,
        }
    }
    None
}

fn keyword_from_prefix(sql: &str) -> Option<&'static str> {
    sql.split(';').find_map(|segment| {
        let first: String = strip_leading_comments(segment)
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect();
        CONTROL_KEYWORDS
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(&first))
            .map(|(_, name)| *name)
    })
}

fn strip_leading_comments(mut text: &str) -> &str {
    loop {
        text = text.trim_start();
        if let Some(rest) = text.strip_prefix("--") {
            text = rest.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(rest) = text.strip_prefix("/*") {
            text = rest.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            return text;
        }
    }
}
