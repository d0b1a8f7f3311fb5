//! Schema text parser.
//!
//! ```text
//! -- comment to end of line
//! step: Step;
//! expver: Expver;
//!
//! [ class, expver, stream=oper/dcda, date, time
//!    [ type, levtype
//!       [ step, levelist?, param ]]]
//! ```

use super::predicate::{Matcher, Predicate};
use super::rule::Rule;
use super::types::{KeywordType, TypeRegistry};
use crate::error::{FdbError, FdbResult};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::{char, multispace1, not_line_ending};
use nom::combinator::{cut, opt, success, value};
use nom::error::{Error, ErrorKind};
use nom::multi::{many0, many0_count, separated_list1};
use nom::sequence::{delimited, preceded};
use nom::{IResult, Parser};

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '-' | '+' | '@')
}

/// 1-based line of `at`, a suffix of `text`.
fn line_of(text: &str, at: &str) -> usize {
    let offset = text.len().saturating_sub(at.len());
    text[..offset].matches('\n').count() + 1
}

fn describe(at: &str) -> String {
    match at.chars().next() {
        None => "end of input".to_string(),
        Some(c) if is_word_char(c) => {
            format!("'{}'", at.split(|c| !is_word_char(c)).next().unwrap_or_default())
        }
        Some(c) => format!("'{c}'"),
    }
}

fn parse_error(text: &str, err: nom::Err<Error<&str>>) -> FdbError {
    let (at, code) = match err {
        nom::Err::Error(e) | nom::Err::Failure(e) => (e.input, e.code),
        nom::Err::Incomplete(_) => ("", ErrorKind::Eof),
    };
    FdbError::SchemaParse {
        line: line_of(text, at),
        message: format!("unexpected {} ({})", describe(at), code.description()),
    }
}

// ════════════════════════════════════════════
// Lexical layer
// ════════════════════════════════════════════

/// Whitespace and `--` comments.
fn blank(i: &str) -> IResult<&str, ()> {
    value((), many0_count(alt((multispace1, preceded(tag("--"), not_line_ending))))).parse(i)
}

fn sym<'a>(c: char) -> impl FnMut(&'a str) -> IResult<&'a str, char> {
    move |i| preceded(blank, char(c)).parse(i)
}

/// A bare word or a double-quoted string.
fn word(i: &str) -> IResult<&str, String> {
    preceded(
        blank,
        alt((
            delimited(char('"'), take_while(|c: char| c != '"' && c != '\n'), cut(char('"'))),
            take_while1(is_word_char),
        )),
    )
    .map(str::to_string)
    .parse(i)
}

// ════════════════════════════════════════════
// Grammar
// ════════════════════════════════════════════

/// `keyword`, `keyword=a/b`, `keyword?default` or `-keyword`.
fn predicate(i: &str) -> IResult<&str, Predicate> {
    let (i, name) = word(i)?;
    if let Some(hidden) = name.strip_prefix('-') {
        if hidden.is_empty() {
            return Err(nom::Err::Failure(Error::new(i, ErrorKind::Verify)));
        }
        return Ok((i, Predicate::new(hidden, Matcher::Hidden)));
    }

    let (i, matcher) = alt((
        preceded(sym('='), cut(separated_list1(sym('/'), word))).map(Matcher::Values),
        preceded(sym('?'), opt(word)).map(|default| Matcher::Optional(default.unwrap_or_default())),
        success(Matcher::Any),
    ))
    .parse(i)?;
    Ok((i, Predicate::new(name, matcher)))
}

/// `[ predicates [ sub-rule ] ... ]`, remembering the line of its bracket.
fn rule<'a>(text: &'a str, i: &'a str) -> IResult<&'a str, Rule> {
    let (i, ()) = blank(i)?;
    let line = line_of(text, i);
    let (i, _) = char('[').parse(i)?;
    let (i, predicates) = cut(separated_list1(sym(','), predicate)).parse(i)?;
    let (i, rules) = many0(|i: &'a str| rule(text, i)).parse(i)?;
    let (i, _) = cut(sym(']')).parse(i)?;
    Ok((i, Rule::new(predicates, rules, line)))
}

/// `keyword: TypeName;` with an optional semicolon.
fn declaration(i: &str) -> IResult<&str, (String, String)> {
    let (i, keyword) = word(i)?;
    let (i, _) = sym(':').parse(i)?;
    let (i, type_name) = cut(word).parse(i)?;
    let (i, _) = opt(sym(';')).parse(i)?;
    Ok((i, (keyword, type_name)))
}

/// Parses schema text into top-level rules and keyword types.
pub fn parse(text: &str) -> FdbResult<(Vec<Rule>, TypeRegistry)> {
    let mut rules = Vec::new();
    let mut types = TypeRegistry::new();
    let mut input = text;

    loop {
        let (rest, ()) = blank(input).map_err(|e| parse_error(text, e))?;
        if rest.is_empty() {
            break;
        }
        if rest.starts_with('[') {
            let (next, parsed) = rule(text, rest).map_err(|e| parse_error(text, e))?;
            rules.push(parsed);
            input = next;
        } else {
            let (next, (keyword, type_name)) = declaration(rest).map_err(|e| parse_error(text, e))?;
            let ty = KeywordType::from_name(&type_name).ok_or_else(|| FdbError::SchemaParse {
                line: line_of(text, rest),
                message: format!("unknown type '{type_name}'"),
            })?;
            types.insert(keyword, ty);
            input = next;
        }
    }
    Ok((rules, types))
}
