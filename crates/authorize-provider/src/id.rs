//! Identifiers handed out by the remote service.

use std::{fmt::Display, ops::Deref, str::FromStr, sync::LazyLock};

use regex::Regex;
use snafu::{Snafu, ensure};

/// A resource id is a lowercase hyphenated UUID.
pub const RESOURCE_ID_FMT: &str =
    "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}";

static RESOURCE_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{RESOURCE_ID_FMT}$")).expect("failed to compile resource id regex")
});

#[derive(Debug, PartialEq, Snafu)]
pub enum ResourceIdParseError {
    #[snafu(display("resource id cannot be empty"))]
    EmptyInput,

    #[snafu(display(
        "resource id {id:?} is invalid, must be a lowercase hyphenated UUID"
    ))]
    InvalidFormat { id: String },
}

/// The server-assigned identifier of a remote resource.
///
/// Construction validates the UUID shape, so holding a [`ResourceId`] is
/// proof the string can be spliced into request paths as-is.
#[derive(
    Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId(String);

impl FromStr for ResourceId {
    type Err = ResourceIdParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        ensure!(!input.is_empty(), EmptyInputSnafu);
        ensure!(
            RESOURCE_ID_REGEX.is_match(input),
            InvalidFormatSnafu { id: input }
        );

        Ok(Self(input.to_owned()))
    }
}

impl TryFrom<String> for ResourceId {
    type Error = ResourceIdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.0
    }
}

impl Deref for ResourceId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<T> PartialEq<T> for ResourceId
where
    T: AsRef<str>,
{
    fn eq(&self, other: &T) -> bool {
        self.0 == other.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("9c052a8a-14be-44e4-8f07-2662569994ce")]
    #[case("00000000-0000-0000-0000-000000000000")]
    fn parses_valid_ids(#[case] input: &str) {
        let id: ResourceId = input.parse().unwrap();
        assert_eq!(id, input);
    }

    #[rstest]
    #[case("9C052A8A-14BE-44E4-8F07-2662569994CE")]
    #[case("9c052a8a14be44e48f072662569994ce")]
    #[case("not-a-uuid")]
    #[case("9c052a8a-14be-44e4-8f07-2662569994ce ")]
    fn rejects_malformed_ids(#[case] input: &str) {
        assert_eq!(
            input.parse::<ResourceId>(),
            Err(ResourceIdParseError::InvalidFormat {
                id: input.to_owned()
            })
        );
    }

    #[test]
    fn rejects_empty_input() {
        assert_eq!(
            "".parse::<ResourceId>(),
            Err(ResourceIdParseError::EmptyInput)
        );
    }

    #[test]
    fn deserializing_validates() {
        let ok: Result<ResourceId, _> =
            serde_json::from_str("\"9c052a8a-14be-44e4-8f07-2662569994ce\"");
        let err: Result<ResourceId, _> = serde_json::from_str("\"bogus\"");

        assert!(ok.is_ok());
        assert!(err.is_err());
    }
}
