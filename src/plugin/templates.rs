//! User-facing template expansion.
//!
//! A template mixes literal text with substitutions:
//!
//! - `#{key}` keyword lookup from a caller-provided map,
//! - `${NAME}` environment variable,
//! - `@{fg[,bg[,attr...]]}` IRC colour/attribute escape, `@{}` to reset,
//! - `%<c>` strftime-style date conversion on the current local time.
//!
//! Doubling an introducer (`##`, `$$`, `@@`, `%%`) produces the literal
//! character. Unknown keywords expand to the empty string; an unterminated
//! construct is an error.

use std::collections::HashMap;

use chrono::Local;
use thiserror::Error;

use crate::parsing::lexer::Lexer;

pub type TemplateResult<T> = core::result::Result<T, TemplateError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated '{0}{{' construct")]
    Unterminated(char),
}

/// Which substitution families are active. Every flag defaults to on;
/// plugins can switch subsets off when expanding untrusted templates.
#[derive(Debug, Clone, Copy)]
pub struct TemplateFlags {
    pub keywords: bool,
    pub env: bool,
    pub attrs: bool,
    pub date: bool,
}

impl Default for TemplateFlags {
    fn default() -> Self {
        Self {
            keywords: true,
            env: true,
            attrs: true,
            date: true,
        }
    }
}

const RESET: char = '\u{f}';
const COLOR: char = '\u{3}';

fn color_code(name: &str) -> Option<&'static str> {
    Some(match name {
        "white" => "0",
        "black" => "1",
        "blue" => "2",
        "green" => "3",
        "red" => "4",
        "brown" => "5",
        "purple" => "6",
        "orange" => "7",
        "yellow" => "8",
        "lightgreen" => "9",
        "cyan" => "10",
        "lightcyan" => "11",
        "lightblue" => "12",
        "pink" => "13",
        "grey" => "14",
        "lightgrey" => "15",
        _ => return None,
    })
}

fn attr_code(name: &str) -> Option<char> {
    Some(match name {
        "bold" => '\u{2}',
        "italic" => '\u{1d}',
        "underline" => '\u{1f}',
        "reverse" => '\u{16}',
        "strike" => '\u{1e}',
        _ => return None,
    })
}

// strftime conversions chrono understands; anything else stays literal.
const DATE_SPECIFIERS: &str = "aAbBcCdDeFgGhHIjmMnpPrRsSTuUVwWxXyYzZ";

/// Expands `input` with every substitution family enabled.
pub fn expand(input: &str, keywords: &HashMap<String, String>) -> TemplateResult<String> {
    expand_with(input, keywords, TemplateFlags::default())
}

pub fn expand_with(
    input: &str,
    keywords: &HashMap<String, String>,
    flags: TemplateFlags,
) -> TemplateResult<String> {
    let mut lexer = Lexer::new(input);
    let mut out = String::with_capacity(input.len());

    while let Some(ch) = lexer.next() {
        match ch {
            '#' | '$' | '@' if lexer.peek_char() == Some(ch) => {
                lexer.next();
                out.push(ch);
            }
            '%' if lexer.peek_char() == Some('%') => {
                lexer.next();
                out.push('%');
            }
            '#' | '$' | '@' if lexer.peek_char() == Some('{') => {
                lexer.next();
                let body = lexer.next_until(&['}']).unwrap_or("");
                if lexer.next() != Some('}') {
                    return Err(TemplateError::Unterminated(ch));
                }

                match ch {
                    '#' if flags.keywords => {
                        if let Some(value) = keywords.get(body) {
                            out.push_str(value);
                        }
                    }
                    '$' if flags.env => {
                        if let Ok(value) = std::env::var(body) {
                            out.push_str(&value);
                        }
                    }
                    '@' if flags.attrs => out.push_str(&expand_attrs(body)),
                    _ => {}
                }
            }
            '%' if flags.date => match lexer.peek_char() {
                Some(spec) if DATE_SPECIFIERS.contains(spec) => {
                    lexer.next();
                    let fmt = format!("%{}", spec);
                    out.push_str(&Local::now().format(&fmt).to_string());
                }
                _ => out.push('%'),
            },
            _ => out.push(ch),
        }
    }

    Ok(out)
}

fn expand_attrs(body: &str) -> String {
    if body.is_empty() {
        return RESET.to_string();
    }

    let mut parts = body.split(',').map(str::trim);
    let mut out = String::new();

    out.push(COLOR);
    if let Some(fg) = parts.next().and_then(color_code) {
        out.push_str(fg);
        if let Some(bg) = parts.next().and_then(color_code) {
            out.push(',');
            out.push_str(bg);
        }
    }

    for attr in parts {
        if let Some(code) = attr_code(attr) {
            out.push(code);
        }
    }

    out
}
