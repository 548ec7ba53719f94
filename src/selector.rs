//! Label matchers and the `{name="value", other=~"re.*"}` selector syntax.
//!
//! ```text
//! selector := [metric_name] ['{' [matcher (',' matcher)* [',']] '}']
//! matcher  := label_name ('=' | '!=' | '=~' | '!~') "quoted value"
//! ```
//!
//! A bare metric name is shorthand for `{__name__="metric_name"}`. Regular expressions are
//! fully anchored.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, multispace0},
    combinator::{opt, recognize, value},
    multi::separated_list0,
    sequence::{delimited, pair, terminated},
    IResult,
};
use regex::Regex;

use crate::error::DbError;
use crate::labels::{Labels, ProfileType, LABEL_NAME_METRIC, LABEL_NAME_PROFILE_TYPE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchOp {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

impl MatchOp {
    fn as_str(&self) -> &'static str {
        match self {
            MatchOp::Equal => "=",
            MatchOp::NotEqual => "!=",
            MatchOp::Regex => "=~",
            MatchOp::NotRegex => "!~",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Matcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
    re: Option<Regex>,
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.op == other.op && self.value == other.value
    }
}

impl Matcher {
    pub fn new(op: MatchOp, name: impl Into<String>, value: impl Into<String>) -> Result<Self, DbError> {
        let name = name.into();
        let value = value.into();
        let re = match op {
            MatchOp::Regex | MatchOp::NotRegex => Some(
                Regex::new(&format!("^(?:{})$", value))
                    .map_err(|e| DbError::InvalidSelector(format!("{}: {}", name, e)))?,
            ),
            MatchOp::Equal | MatchOp::NotEqual => None,
        };
        Ok(Self { name, op, value, re })
    }

    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::Equal,
            value: value.into(),
            re: None,
        }
    }

    pub fn matches(&self, v: &str) -> bool {
        match (self.op, &self.re) {
            (MatchOp::Equal, _) => v == self.value,
            (MatchOp::NotEqual, _) => v != self.value,
            (MatchOp::Regex, Some(re)) => re.is_match(v),
            (MatchOp::NotRegex, Some(re)) => !re.is_match(v),
            (_, None) => false,
        }
    }

    /// Tests a label set; an absent label is treated as the empty value.
    pub fn matches_labels(&self, labels: &Labels) -> bool {
        self.matches(labels.get(&self.name).unwrap_or(""))
    }

    /// For `=~"a|b|c"` with plain literal alternatives, the literal set.
    pub fn literal_set(&self) -> Option<Vec<&str>> {
        if self.op != MatchOp::Regex {
            return None;
        }
        const META: &[char] = &['.', '+', '*', '?', '(', ')', '[', ']', '{', '}', '^', '$', '\\'];
        if self.value.contains(META) {
            return None;
        }
        Some(self.value.split('|').collect())
    }
}

impl std::fmt::Display for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op.as_str(), self.value)
    }
}

/// Parses a selector string into matchers.
pub fn parse_selector(input: &str) -> Result<Vec<Matcher>, DbError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(Vec::new());
    }
    let (remaining, (metric, raw)) = match selector(input) {
        Ok(res) => res,
        Err(e) => return Err(DbError::InvalidSelector(format!("{:?}: {}", input, e))),
    };
    if !remaining.trim().is_empty() {
        return Err(DbError::InvalidSelector(format!(
            "unexpected input after selector: {:?}",
            remaining.trim()
        )));
    }

    let mut out = Vec::with_capacity(raw.len() + 1);
    if let Some(name) = metric {
        out.push(Matcher::equal(LABEL_NAME_METRIC, name));
    }
    for (name, op, value) in raw {
        out.push(Matcher::new(op, name, value)?);
    }
    Ok(out)
}

/// Matcher selecting exactly one profile type.
pub fn profile_type_matcher(pt: &ProfileType) -> Matcher {
    Matcher::equal(LABEL_NAME_PROFILE_TYPE, pt.id())
}

/// Splits matchers into index matchers and post-filters. A matcher that matches the empty
/// string cannot be answered from postings alone, so it is applied as a filter.
pub fn split_filters_and_matchers(matchers: &[Matcher]) -> (Vec<Matcher>, Vec<Matcher>) {
    let (filters, index): (Vec<Matcher>, Vec<Matcher>) =
        matchers.iter().cloned().partition(|m| m.matches(""));
    (filters, index)
}

pub fn matches_all(matchers: &[Matcher], labels: &Labels) -> bool {
    matchers.iter().all(|m| m.matches_labels(labels))
}

type RawMatcher<'a> = (&'a str, MatchOp, String);

fn selector(input: &str) -> IResult<&str, (Option<&str>, Vec<RawMatcher<'_>>)> {
    let (input, metric) = opt(metric_name)(input)?;
    let (input, _) = multispace0(input)?;
    let (input, matchers) = if metric.is_some() {
        opt(braces)(input).map(|(i, m)| (i, m.unwrap_or_default()))?
    } else {
        braces(input)?
    };
    Ok((input, (metric, matchers)))
}

fn braces(input: &str) -> IResult<&str, Vec<RawMatcher<'_>>> {
    delimited(
        pair(char('{'), multispace0),
        terminated(
            separated_list0(delimited(multispace0, char(','), multispace0), matcher),
            pair(multispace0, opt(pair(char(','), multispace0))),
        ),
        char('}'),
    )(input)
}

fn matcher(input: &str) -> IResult<&str, RawMatcher<'_>> {
    let (input, name) = label_name(input)?;
    let (input, _) = multispace0(input)?;
    let (input, op) = match_op(input)?;
    let (input, _) = multispace0(input)?;
    let (input, value) = quoted_string(input)?;
    Ok((input, (name, op, value)))
}

fn match_op(input: &str) -> IResult<&str, MatchOp> {
    alt((
        value(MatchOp::Regex, tag("=~")),
        value(MatchOp::NotRegex, tag("!~")),
        value(MatchOp::NotEqual, tag("!=")),
        value(MatchOp::Equal, tag("=")),
    ))(input)
}

fn label_name(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

fn metric_name(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_' || c == ':'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == ':' || c == '.'),
    ))(input)
}

/// Double-quoted string supporting `\"`, `\\`, `\n` and `\t` escapes.
fn quoted_string(input: &str) -> IResult<&str, String> {
    let (rest, _) = char('"')(input)?;
    let mut out = String::new();
    let mut chars = rest.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((&rest[i + 1..], out)),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, e)) => out.push(e),
                None => break,
            },
            c => out.push(c),
        }
    }
    Err(nom::Err::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Char,
    )))
}
