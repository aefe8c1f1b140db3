//! Restricted regular expressions for extra-data filters.
//!
//! Patterns come from untrusted clients, so they are inspected before
//! compilation and refused when they use syntax outside a small safe grammar:
//! named groups, back-references, lazy or possessive quantifiers, the `U`
//! flag that swaps greediness, stacked or dangling quantifiers, and an escape
//! with nothing after it. Accepted
//! patterns are compiled with `regex-lite`, which matches without
//! backtracking, under a program size limit.

use regex_lite::{Regex, RegexBuilder};
use thiserror::Error;

/// Compiled program size ceiling.
pub const PATTERN_SIZE_LIMIT: usize = 256 * 1024;

/// Maximum group nesting depth.
pub const PATTERN_NEST_LIMIT: u32 = 32;

/// Why a pattern was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("named groups are not allowed")]
    NamedGroup,
    #[error("back-references are not allowed")]
    BackReference,
    #[error("lazy or possessive quantifiers are not allowed")]
    QuantifierModifier,
    #[error("the swap-greed flag is not allowed")]
    SwapGreedFlag,
    #[error("quantifier has nothing to repeat")]
    DanglingQuantifier,
    #[error("pattern ends inside an escape sequence")]
    UnterminatedEscape,
    #[error("pattern does not compile: {0}")]
    Compile(String),
}

/// A validated, compiled extra-data pattern.
#[derive(Debug, Clone)]
pub struct ExtraDataPattern {
    regex: Regex,
}

impl ExtraDataPattern {
    /// Validate and compile `pattern`.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        validate(pattern)?;
        let regex = RegexBuilder::new(pattern)
            .size_limit(PATTERN_SIZE_LIMIT)
            .nest_limit(PATTERN_NEST_LIMIT)
            .build()
            .map_err(|e| PatternError::Compile(e.to_string()))?;
        Ok(Self { regex })
    }

    /// Whether the pattern matches anywhere in `extra_data`.
    pub fn is_match(&self, extra_data: &str) -> bool {
        self.regex.is_match(extra_data)
    }
}

/// What the previous token leaves for a following quantifier.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Prev {
    /// Start of pattern, after `(` or `|`: nothing to repeat.
    Nothing,
    /// A literal, class, group or escape that may be repeated.
    Atom,
    /// A quantifier was just applied.
    Quantifier,
}

/// Statically check `pattern` against the safe grammar.
pub fn validate(pattern: &str) -> Result<(), PatternError> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut prev = Prev::Nothing;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' => {
                i = check_escape(&chars, i)?;
                prev = Prev::Atom;
            }
            '[' => {
                i = skip_class(&chars, i)?;
                prev = Prev::Atom;
            }
            '(' => {
                i = check_group_open(&chars, i)?;
                prev = Prev::Nothing;
            }
            ')' => {
                i += 1;
                prev = Prev::Atom;
            }
            '|' => {
                i += 1;
                prev = Prev::Nothing;
            }
            '*' | '+' | '?' => {
                i = apply_quantifier(prev, i + 1)?;
                prev = Prev::Quantifier;
            }
            '{' => match counted_repetition_len(&chars, i) {
                Some(len) => {
                    i = apply_quantifier(prev, i + len)?;
                    prev = Prev::Quantifier;
                }
                None => {
                    i += 1;
                    prev = Prev::Atom;
                }
            },
            _ => {
                i += 1;
                prev = Prev::Atom;
            }
        }
    }
    Ok(())
}

/// Check a quantifier ending just before `next` and return `next`.
fn apply_quantifier(prev: Prev, next: usize) -> Result<usize, PatternError> {
    match prev {
        Prev::Atom => Ok(next),
        Prev::Nothing => Err(PatternError::DanglingQuantifier),
        // `a*?`, `a++`, `a{2}?` and `a**` all land here.
        Prev::Quantifier => Err(PatternError::QuantifierModifier),
    }
}

/// Check the escape starting at `start` (a `\`) and return the index after it.
fn check_escape(chars: &[char], start: usize) -> Result<usize, PatternError> {
    let Some(&next) = chars.get(start + 1) else {
        return Err(PatternError::UnterminatedEscape);
    };
    match next {
        '1'..='9' | 'k' | 'g' => Err(PatternError::BackReference),
        _ => Ok(start + 2),
    }
}

/// Check the group opening at `start` (a `(`) and return the index after it.
fn check_group_open(chars: &[char], start: usize) -> Result<usize, PatternError> {
    if chars.get(start + 1) != Some(&'?') {
        return Ok(start + 1);
    }
    match chars.get(start + 2) {
        Some('<') | Some('\'') => Err(PatternError::NamedGroup),
        Some('P') if matches!(chars.get(start + 3), Some('<') | Some('=') | Some('>')) => {
            Err(PatternError::NamedGroup)
        }
        _ => {
            // `U` would turn every later quantifier lazy.
            let flags = chars[start + 2..]
                .iter()
                .take_while(|c| c.is_ascii_alphabetic() || **c == '-');
            for flag in flags {
                if *flag == 'U' {
                    return Err(PatternError::SwapGreedFlag);
                }
            }
            Ok(start + 2)
        }
    }
}

/// Skip a bracket class starting at `start` (a `[`) and return the index after it.
///
/// Escapes inside the class are checked like escapes outside it. An
/// unterminated class is left for the compiler to reject.
fn skip_class(chars: &[char], start: usize) -> Result<usize, PatternError> {
    let mut i = start + 1;
    if chars.get(i) == Some(&'^') {
        i += 1;
    }
    // A leading `]` is a literal member.
    if chars.get(i) == Some(&']') {
        i += 1;
    }
    let mut depth = 1usize;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                if i + 1 >= chars.len() {
                    return Err(PatternError::UnterminatedEscape);
                }
                i += 2;
            }
            '[' => {
                depth += 1;
                i += 1;
            }
            ']' => {
                depth -= 1;
                i += 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => i += 1,
        }
    }
    Ok(i)
}

/// Length of a `{n}`, `{n,}` or `{n,m}` repetition at `start`, if there is one.
fn counted_repetition_len(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start + 1;
    let digits_from = i;
    while chars.get(i).is_some_and(char::is_ascii_digit) {
        i += 1;
    }
    if i == digits_from {
        return None;
    }
    if chars.get(i) == Some(&',') {
        i += 1;
        while chars.get(i).is_some_and(char::is_ascii_digit) {
            i += 1;
        }
    }
    (chars.get(i) == Some(&'}')).then(|| i + 1 - start)
}
