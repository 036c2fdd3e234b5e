//! Line grammar of the config files.
//!
//! ```text
//! [group]
//! [group "sub group"]
//! key = value
//! # comment
//! ; comment
//! ```
//!
//! Each rule either matches the whole line or fails without consuming input.

use nom::{
    character::complete::{char, one_of},
    combinator::{all_consuming, opt, rest},
    sequence::{delimited, terminated, tuple},
};

use vmbkp_tools::nom::{multispace0, IResult};

use crate::format::{any_string, basic_string, quoted_string};
use crate::Group;

/// Value assigned to a key without a value (`key =`).
pub const DEFAULT_ENTRY_VALUE: &str = "false";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LineContext {
    Group(Group),
    Entry(String, String),
    Comment(String),
    Empty,
}

fn group_header(i: &str) -> IResult<&str, Group> {
    let (i, _) = tuple((multispace0, char('['), multispace0))(i)?;
    let (i, name) = terminated(basic_string, multispace0)(i)?;
    let (i, sub) = opt(terminated(quoted_string, multispace0))(i)?;
    let (i, _) = tuple((char(']'), multispace0))(i)?;

    let group = match sub {
        Some(sub) => Group::with_sub(name, sub),
        None => Group::new(name),
    };
    Ok((i, group))
}

fn entry(i: &str) -> IResult<&str, (String, String)> {
    let (i, key) = delimited(multispace0, any_string, multispace0)(i)?;
    let (i, _) = tuple((char('='), multispace0))(i)?;
    let (i, value) = terminated(opt(any_string), multispace0)(i)?;

    let value = value.unwrap_or_else(|| String::from(DEFAULT_ENTRY_VALUE));
    Ok((i, (key, value)))
}

fn comment(i: &str) -> IResult<&str, String> {
    let (i, _) = multispace0(i)?;
    let (i, marker) = one_of("#;")(i)?;
    let (i, text) = rest(i)?;
    Ok((i, format!("{}{}", marker, text)))
}

/// Classify a single line, `None` if it matches no rule.
pub fn parse_line(line: &str) -> Option<LineContext> {
    if let Ok((_, group)) = all_consuming(group_header)(line) {
        return Some(LineContext::Group(group));
    }
    if let Ok((_, (key, value))) = all_consuming(entry)(line) {
        return Some(LineContext::Entry(key, value));
    }
    if let Ok((_, text)) = comment(line) {
        return Some(LineContext::Comment(text));
    }
    if all_consuming(multispace0)(line).is_ok() {
        return Some(LineContext::Empty);
    }
    None
}
