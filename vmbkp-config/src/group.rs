use std::fmt;

use anyhow::{bail, Error};

use crate::format::{basic_string, quote};

/// Identifies a section of a config file: `[name]` or `[name "sub"]`.
///
/// The derived ordering sorts by name first; for equal names the
/// one-string group comes before any two-string group.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Group {
    name: String,
    sub: Option<String>,
}

impl Group {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            sub: None,
        }
    }

    pub fn with_sub<N: Into<String>, S: Into<String>>(name: N, sub: S) -> Self {
        Self {
            name: name.into(),
            sub: Some(sub.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sub(&self) -> Option<&str> {
        self.sub.as_deref()
    }

    /// The group name must be a basic string to be readable again.
    pub fn check(&self) -> Result<(), Error> {
        if !vmbkp_tools::nom::matches_complete(&self.name, basic_string) {
            bail!("invalid group name {:?}", self.name);
        }
        Ok(())
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sub {
            Some(sub) => write!(f, "[{} {}]", self.name, quote(sub)),
            None => write!(f, "[{}]", self.name),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_group_order() {
        let mut list = vec![
            Group::with_sub("index", "timestamp"),
            Group::with_sub("generation", "10"),
            Group::new("meta"),
            Group::with_sub("generation", "2"),
            Group::new("generation"),
            Group::new("index"),
        ];
        list.sort();
        let expected = vec![
            Group::new("generation"),
            Group::with_sub("generation", "10"),
            Group::with_sub("generation", "2"),
            Group::new("index"),
            Group::with_sub("index", "timestamp"),
            Group::new("meta"),
        ];
        assert_eq!(list, expected);

        let mut again = list.clone();
        again.sort();
        assert_eq!(again, list);

        for a in list.iter() {
            for b in list.iter() {
                for c in list.iter() {
                    if a < b && b < c {
                        assert!(a < c);
                    }
                }
                assert_eq!(a == b, a.cmp(b) == std::cmp::Ordering::Equal);
            }
        }
    }

    #[test]
    fn test_group_display() {
        assert_eq!(Group::new("meta").to_string(), "[meta]");
        assert_eq!(Group::with_sub("disk", "0").to_string(), "[disk \"0\"]");
        assert_eq!(
            Group::with_sub("index", "a \"b\"").to_string(),
            "[index \"a \\\"b\\\"\"]"
        );
        assert!(Group::new("vm-12").check().is_ok());
        assert!(Group::new("vm 12").check().is_err());
        assert!(Group::new("").check().is_err());
    }
}
