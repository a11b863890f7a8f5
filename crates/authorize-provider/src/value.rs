//! The tri-state attribute value.
//!
//! Every attribute in a plan or a recorded state is in exactly one of three
//! states: it has a concrete value ([`Value::Known`]), it is deliberately
//! absent ([`Value::Null`]), or it references something that has not been
//! created yet and will only settle during apply ([`Value::Unknown`]).
//!
//! Codecs must never guess: converting an unknown value into a wire request
//! is reported as an error on the offending attribute instead of being
//! silently treated as absent.

use crate::{diagnostic::Diagnostic, path::AttributePath};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Value<T> {
    Known(T),
    Null,
    Unknown,
}

// Null regardless of whether T itself has a default, so model structs over
// arbitrary payload types can derive Default.
impl<T> Default for Value<T> {
    fn default() -> Self {
        Self::Null
    }
}

impl<T> Value<T> {
    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    pub fn as_known(&self) -> Option<&T> {
        match self {
            Self::Known(value) => Some(value),
            Self::Null | Self::Unknown => None,
        }
    }

    pub fn as_ref(&self) -> Value<&T> {
        match self {
            Self::Known(value) => Value::Known(value),
            Self::Null => Value::Null,
            Self::Unknown => Value::Unknown,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Value<U> {
        match self {
            Self::Known(value) => Value::Known(f(value)),
            Self::Null => Value::Null,
            Self::Unknown => Value::Unknown,
        }
    }

    /// Known becomes `Some`, null and unknown become `None`.
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Known(value) => Some(value),
            Self::Null | Self::Unknown => None,
        }
    }

    /// The value a required attribute must carry when a request is built.
    ///
    /// Null and unknown both fail: null means the configuration is
    /// incomplete, unknown means a referenced value has not settled yet.
    pub fn expand_required(&self, path: &AttributePath) -> Result<&T, Diagnostic> {
        match self {
            Self::Known(value) => Ok(value),
            Self::Null => Err(Diagnostic::attribute_error(
                path.clone(),
                "Missing required attribute",
                format!("{path} must be configured"),
            )),
            Self::Unknown => Err(unresolved(path)),
        }
    }

    /// Like [`Value::expand_required`], but null is a valid answer.
    pub fn expand_optional(&self, path: &AttributePath) -> Result<Option<&T>, Diagnostic> {
        match self {
            Self::Known(value) => Ok(Some(value)),
            Self::Null => Ok(None),
            Self::Unknown => Err(unresolved(path)),
        }
    }

    /// Whether this planned value can still turn out equal to `state` once
    /// applied. Unknown plans cannot, by definition.
    pub fn settles_to(&self, state: &Self) -> bool
    where
        T: PartialEq,
    {
        match self {
            Self::Unknown => false,
            settled => settled == state,
        }
    }
}

fn unresolved(path: &AttributePath) -> Diagnostic {
    Diagnostic::attribute_error(
        path.clone(),
        "Unresolved attribute value",
        format!("{path} was still unknown while a concrete value was required"),
    )
}

impl<T> From<Option<T>> for Value<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Self::Known(value),
            None => Self::Null,
        }
    }
}

impl<T> From<T> for Value<T> {
    fn from(value: T) -> Self {
        Self::Known(value)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn required_rejects_null_with_attribute_error() {
        let value: Value<String> = Value::Null;
        let path = AttributePath::root("name");

        let diagnostic = value.expand_required(&path).unwrap_err();
        assert!(diagnostic.is_error());
        assert_eq!(diagnostic.attribute(), Some(&path));
        assert_eq!(diagnostic.summary(), "Missing required attribute");
    }

    #[test]
    fn required_rejects_unknown() {
        let value: Value<String> = Value::Unknown;
        let path = AttributePath::root("policy").attribute("id");

        let diagnostic = value.expand_required(&path).unwrap_err();
        assert_eq!(diagnostic.summary(), "Unresolved attribute value");
    }

    #[test]
    fn optional_flattens_null_to_none() {
        let value: Value<u32> = Value::Null;
        let path = AttributePath::root("resource_id");

        assert_eq!(value.expand_optional(&path).unwrap(), None);
    }

    #[test]
    fn optional_still_rejects_unknown() {
        let value: Value<u32> = Value::Unknown;
        let path = AttributePath::root("resource_id");

        assert!(value.expand_optional(&path).is_err());
    }

    #[rstest]
    #[case(Value::Known("a"), Value::Known("a"), true)]
    #[case(Value::Known("a"), Value::Known("b"), false)]
    #[case(Value::Null, Value::Null, true)]
    #[case(Value::Null, Value::Known("a"), false)]
    #[case(Value::Unknown, Value::Known("a"), false)]
    #[case(Value::Unknown, Value::Unknown, false)]
    fn settles_to_matches_plan_semantics(
        #[case] plan: Value<&str>,
        #[case] state: Value<&str>,
        #[case] expected: bool,
    ) {
        assert_eq!(plan.settles_to(&state), expected);
    }

    #[test]
    fn option_round_trip() {
        assert_eq!(Value::from(Some(1)), Value::Known(1));
        assert_eq!(Value::<i32>::from(None), Value::Null);
        assert_eq!(Value::Known(1).into_option(), Some(1));
        assert_eq!(Value::<i32>::Unknown.into_option(), None);
    }
}
