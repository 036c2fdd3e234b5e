//! String, integer and boolean value formats of the config files.
//!
//! Values are classified as basic strings (`[A-Za-z0-9_-]+`), normal strings
//! (basic characters plus a fixed punctuation set, with interior spaces) or
//! quoted strings. Anything that is neither basic nor normal is written
//! quoted.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, none_of, one_of},
    combinator::{map, opt, recognize, value},
    multi::{many0, many0_count},
    sequence::{delimited, pair},
};

use vmbkp_tools::nom::{matches_complete, multispace1, signed_digits, IResult};

/// Punctuation allowed inside normal strings.
pub const CODE_CHARS: &str = "+-!@$%^&*()_|~[]{}:,.<>/?";

/// Integer unit suffixes, each one a factor of 1024.
pub const INT_UNITS: &str = "KMGTP";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StringClass {
    Null,
    Basic,
    Normal,
    Quoted,
}

pub(crate) fn is_basic_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

pub(crate) fn is_normal_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || CODE_CHARS.contains(c)
}

pub fn basic_string(i: &str) -> IResult<&str, &str> {
    take_while1(is_basic_char)(i)
}

fn normal_word(i: &str) -> IResult<&str, &str> {
    take_while1(is_normal_char)(i)
}

/// Normal characters with interior (never leading or trailing) spaces.
pub fn normal_string(i: &str) -> IResult<&str, &str> {
    recognize(pair(normal_word, many0_count(pair(multispace1, normal_word))))(i)
}

/// `"..."` with `\"` as the only escape sequence.
pub fn quoted_string(i: &str) -> IResult<&str, String> {
    let quoted_char = alt((value('"', tag("\\\"")), none_of("\"")));
    delimited(
        char('"'),
        map(many0(quoted_char), |chars: Vec<char>| chars.into_iter().collect()),
        char('"'),
    )(i)
}

/// A value in either quoted or unquoted form.
pub fn any_string(i: &str) -> IResult<&str, String> {
    alt((quoted_string, map(normal_string, String::from)))(i)
}

pub fn classify(s: &str) -> StringClass {
    if s.is_empty() {
        StringClass::Null
    } else if matches_complete(s, basic_string) {
        StringClass::Basic
    } else if matches_complete(s, normal_string) {
        StringClass::Normal
    } else {
        StringClass::Quoted
    }
}

pub fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\\\""))
}

/// Strip the quotes of a quoted string, returns `None` if not quoted.
pub fn unquote(s: &str) -> Option<String> {
    vmbkp_tools::nom::parse_complete_line("quoted string", s, quoted_string).ok()
}

/// Representation used when writing `s` to a config file.
pub fn to_auto_string(s: &str) -> String {
    match classify(s) {
        StringClass::Basic | StringClass::Normal => s.to_string(),
        StringClass::Null | StringClass::Quoted => quote(s),
    }
}

fn integer_with_unit(i: &str) -> IResult<&str, (&str, Option<char>)> {
    let (i, digits) = signed_digits(i)?;
    let (i, unit) = opt(one_of("kmgtpKMGTP"))(i)?;
    Ok((i, (digits, unit)))
}

pub fn is_integer(s: &str) -> bool {
    matches_complete(s, integer_with_unit)
}

/// True only for the literal `-1`, which `to_i64`/`to_i32` cannot
/// distinguish from a conversion failure.
pub fn is_minus_one(s: &str) -> bool {
    s == "-1"
}

/// Convert an integer literal, `-1` on parse failure or overflow.
pub fn to_i64(s: &str) -> i64 {
    let parsed = vmbkp_tools::nom::parse_complete_line("integer", s, integer_with_unit);
    let (digits, unit) = match parsed {
        Ok(res) => res,
        Err(_) => return -1,
    };
    let mut ret: i64 = match digits.parse() {
        Ok(v) => v,
        Err(_) => return -1,
    };
    if let Some(unit) = unit {
        let exp = INT_UNITS
            .find(unit.to_ascii_uppercase())
            .map(|pos| pos as u32 + 1)
            .unwrap_or(0);
        for _ in 0..exp {
            ret = match ret.checked_mul(1024) {
                Some(v) => v,
                None => return -1,
            };
        }
    }
    ret
}

/// Like `to_i64`, but also `-1` if the value does not fit into 32 bit.
pub fn to_i32(s: &str) -> i32 {
    i32::try_from(to_i64(s)).unwrap_or(-1)
}

pub fn can_be_i64(s: &str) -> bool {
    is_integer(s) && (is_minus_one(s) || to_i64(s) != -1)
}

pub fn can_be_i32(s: &str) -> bool {
    is_integer(s) && (is_minus_one(s) || to_i32(s) != -1)
}

pub fn parse_i64(s: &str) -> Option<i64> {
    if can_be_i64(s) {
        Some(to_i64(s))
    } else {
        None
    }
}

pub fn parse_i32(s: &str) -> Option<i32> {
    if can_be_i32(s) {
        Some(to_i32(s))
    } else {
        None
    }
}

/// Format an integer, using the largest unit that divides it evenly.
pub fn format_i64(mut value: i64) -> String {
    if value == 0 {
        return String::from("0");
    }
    let mut unit = None;
    for u in INT_UNITS.chars() {
        if value % 1024 != 0 {
            break;
        }
        value /= 1024;
        unit = Some(u);
    }
    match unit {
        Some(u) => format!("{}{}", value, u),
        None => value.to_string(),
    }
}

pub fn is_bool(s: &str) -> bool {
    parse_bool(s).is_some()
}

pub fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "true" | "1" | "on" => Some(true),
        "false" | "0" | "off" => Some(false),
        _ => None,
    }
}

pub fn format_bool(v: bool) -> &'static str {
    if v {
        "true"
    } else {
        "false"
    }
}
