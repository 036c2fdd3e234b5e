use anyhow::{bail, Error};

use nom::{
    bytes::complete::{take_while, take_while1},
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res, opt, recognize},
    error::VerboseError,
    sequence::pair,
};

pub type IResult<I, O, E = VerboseError<I>> = Result<(I, O), nom::Err<E>>;

/// Recognizes zero or more spaces and tabs (but not carage returns or line feeds)
pub fn multispace0(i: &str) -> IResult<&str, &str> {
    take_while(|c| c == ' ' || c == '\t')(i)
}

/// Recognizes one or more spaces and tabs (but not carage returns or line feeds)
pub fn multispace1(i: &str) -> IResult<&str, &str> {
    take_while1(|c| c == ' ' || c == '\t')(i)
}

/// Recognizes an optionally signed decimal number (`-12`, `+3`, `42`)
pub fn signed_digits(i: &str) -> IResult<&str, &str> {
    recognize(pair(opt(nom::branch::alt((char('-'), char('+')))), digit1))(i)
}

/// Parse a 64 bit signed integer
pub fn parse_i64(i: &str) -> IResult<&str, i64> {
    map_res(signed_digits, str::parse)(i)
}

/// Returns true if `parser` consumes all of `i`.
pub fn matches_complete<'a, F, O>(i: &'a str, parser: F) -> bool
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    all_consuming(parser)(i).is_ok()
}

/// Parse complete input, generate simple error message (use this for single line input).
pub fn parse_complete_line<'a, F, O>(what: &str, i: &'a str, parser: F) -> Result<O, Error>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    match all_consuming(parser)(i) {
        Err(nom::Err::Error(VerboseError { errors }))
        | Err(nom::Err::Failure(VerboseError { errors })) => {
            if errors.is_empty() {
                bail!("unable to parse {}", what);
            } else {
                bail!(
                    "unable to parse {} at '{}' - {:?}",
                    what,
                    errors[0].0,
                    errors[0].1
                );
            }
        }
        Err(err) => {
            bail!("unable to parse {} - {}", what, err);
        }
        Ok((_, data)) => Ok(data),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_signed_digits() {
        assert_eq!(signed_digits("-12K").unwrap(), ("K", "-12"));
        assert_eq!(signed_digits("+3").unwrap(), ("", "+3"));
        assert!(signed_digits("-").is_err());
        assert_eq!(parse_i64("42 ").unwrap(), (" ", 42));
        assert!(matches_complete("  \t", multispace0));
        assert!(!matches_complete(" x", multispace0));
        assert!(parse_complete_line("number", "12x", parse_i64).is_err());
    }
}
