//! Declarative per-kind schemas.
//!
//! Each resource kind declares its attributes as consts: dotted name,
//! presence class, whether a change forces replacement, and value
//! constraints. Validation helpers run against tri-state values and collect
//! into [`Diagnostics`]; constraints only apply once a value is known, and
//! unknown values pass every check because they settle during apply.

use itertools::Itertools;

use crate::{
    diagnostic::{Diagnostic, Diagnostics},
    path::AttributePath,
    value::Value,
};

/// Who supplies an attribute value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    /// The user must configure it.
    Required,
    /// The user may configure it, the server never does.
    Optional,
    /// Only the server assigns it.
    Computed,
    /// The user may configure it, the server fills it otherwise.
    OptionalComputed,
}

/// A value constraint, checked once the value is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Constraint {
    /// Minimum string length in characters.
    LengthAtLeast(usize),
    /// Maximum string length in characters.
    LengthAtMost(usize),
    /// Minimum collection size.
    SizeAtLeast(usize),
    /// Maximum collection size.
    SizeAtMost(usize),
    /// The value must be one of a closed set of tokens.
    OneOf(&'static [&'static str]),
}

impl Constraint {
    pub fn check_str(&self, path: &AttributePath, value: &str, diagnostics: &mut Diagnostics) {
        match self {
            Self::LengthAtLeast(min) => {
                if value.chars().count() < *min {
                    diagnostics.push(Diagnostic::attribute_error(
                        path.clone(),
                        "Invalid attribute value length",
                        format!("{path} must be at least {min} characters, got {value:?}"),
                    ));
                }
            }
            Self::LengthAtMost(max) => {
                if value.chars().count() > *max {
                    diagnostics.push(Diagnostic::attribute_error(
                        path.clone(),
                        "Invalid attribute value length",
                        format!("{path} must be at most {max} characters"),
                    ));
                }
            }
            Self::OneOf(allowed) => {
                if !allowed.contains(&value) {
                    diagnostics.push(Diagnostic::attribute_error(
                        path.clone(),
                        "Invalid attribute value",
                        format!(
                            "{path} must be one of [{}], got {value:?}",
                            allowed.iter().map(|token| format!("{token:?}")).join(", ")
                        ),
                    ));
                }
            }
            Self::SizeAtLeast(_) | Self::SizeAtMost(_) => {}
        }
    }

    pub fn check_size(&self, path: &AttributePath, size: usize, diagnostics: &mut Diagnostics) {
        match self {
            Self::SizeAtLeast(min) => {
                if size < *min {
                    diagnostics.push(Diagnostic::attribute_error(
                        path.clone(),
                        "Invalid attribute size",
                        format!("{path} must contain at least {min} elements, got {size}"),
                    ));
                }
            }
            Self::SizeAtMost(max) => {
                if size > *max {
                    diagnostics.push(Diagnostic::attribute_error(
                        path.clone(),
                        "Invalid attribute size",
                        format!("{path} must contain at most {max} elements, got {size}"),
                    ));
                }
            }
            Self::LengthAtLeast(_) | Self::LengthAtMost(_) | Self::OneOf(_) => {}
        }
    }
}

/// One attribute of a resource kind.
#[derive(Debug)]
pub struct AttributeSchema {
    name: &'static str,
    presence: Presence,
    requires_replace: bool,
    constraints: &'static [Constraint],
}

impl AttributeSchema {
    pub const fn required(name: &'static str) -> Self {
        Self {
            name,
            presence: Presence::Required,
            requires_replace: false,
            constraints: &[],
        }
    }

    pub const fn optional(name: &'static str) -> Self {
        Self {
            presence: Presence::Optional,
            ..Self::required(name)
        }
    }

    pub const fn computed(name: &'static str) -> Self {
        Self {
            presence: Presence::Computed,
            ..Self::required(name)
        }
    }

    pub const fn optional_computed(name: &'static str) -> Self {
        Self {
            presence: Presence::OptionalComputed,
            ..Self::required(name)
        }
    }

    /// Marks a change of this attribute as destroy-then-create.
    pub const fn requires_replace(self) -> Self {
        Self {
            requires_replace: true,
            ..self
        }
    }

    pub const fn constrained(self, constraints: &'static [Constraint]) -> Self {
        Self {
            constraints,
            ..self
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn presence(&self) -> Presence {
        self.presence
    }

    pub fn forces_replacement(&self) -> bool {
        self.requires_replace
    }

    pub fn path(&self) -> AttributePath {
        AttributePath::dotted(self.name)
    }

    /// Required attributes must not be null. Unknown passes.
    pub fn check_presence<T>(&self, value: &Value<T>, diagnostics: &mut Diagnostics) {
        if self.presence == Presence::Required && value.is_null() {
            diagnostics.push(Diagnostic::attribute_error(
                self.path(),
                "Missing required attribute",
                format!("{} must be configured", self.path()),
            ));
        }
    }

    pub fn check_string(&self, value: &Value<String>, diagnostics: &mut Diagnostics) {
        self.check_presence(value, diagnostics);
        if let Value::Known(value) = value {
            let path = self.path();
            for constraint in self.constraints {
                constraint.check_str(&path, value, diagnostics);
            }
        }
    }

    pub fn check_set_size<T>(&self, value: &Value<Vec<T>>, diagnostics: &mut Diagnostics) {
        self.check_presence(value, diagnostics);
        if let Value::Known(elements) = value {
            let path = self.path();
            for constraint in self.constraints {
                constraint.check_size(&path, elements.len(), diagnostics);
            }
        }
    }
}

/// The full attribute set of one resource kind.
#[derive(Debug)]
pub struct KindSchema {
    pub kind: &'static str,
    pub attributes: &'static [AttributeSchema],
}

impl KindSchema {
    pub fn attribute(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes
            .iter()
            .find(|attribute| attribute.name == name)
    }

    /// Dotted names of attributes whose change forces replacement.
    pub fn replacement_paths(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.attributes
            .iter()
            .filter(|attribute| attribute.requires_replace)
            .map(|attribute| attribute.name)
    }
}

/// `attribute` must be set whenever `other` is configured as `expected`.
///
/// Skipped while `other` is unknown; the check reruns once it settles.
pub fn require_when(
    attribute: &AttributeSchema,
    is_set: bool,
    other: &AttributeSchema,
    expected: &str,
    actual: Option<&str>,
    diagnostics: &mut Diagnostics,
) {
    if actual == Some(expected) && !is_set {
        diagnostics.push(Diagnostic::attribute_error(
            attribute.path(),
            "Missing required attribute",
            format!(
                "{} must be configured when {} is {expected:?}",
                attribute.path(),
                other.path()
            ),
        ));
    }
}

/// `attribute` must be absent whenever `other` is configured as `expected`.
pub fn conflict_when(
    attribute: &AttributeSchema,
    is_set: bool,
    other: &AttributeSchema,
    expected: &str,
    actual: Option<&str>,
    diagnostics: &mut Diagnostics,
) {
    if actual == Some(expected) && is_set {
        diagnostics.push(Diagnostic::attribute_error(
            attribute.path(),
            "Invalid combination of arguments",
            format!(
                "{} must not be configured when {} is {expected:?}",
                attribute.path(),
                other.path()
            ),
        ));
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const NAME: AttributeSchema =
        AttributeSchema::required("name").constrained(&[Constraint::LengthAtLeast(1)]);
    const KIND: AttributeSchema = AttributeSchema::optional("kind")
        .constrained(&[Constraint::OneOf(&["EXACT", "PARAMETER"])]);
    const METHODS: AttributeSchema = AttributeSchema::optional("methods")
        .constrained(&[Constraint::SizeAtLeast(1), Constraint::SizeAtMost(10)]);
    const LOCKED: AttributeSchema = AttributeSchema::optional("locked").requires_replace();

    const SCHEMA: KindSchema = KindSchema {
        kind: "example",
        attributes: &[NAME, KIND, METHODS, LOCKED],
    };

    #[test]
    fn required_null_is_an_error() {
        let mut diagnostics = Diagnostics::new();
        NAME.check_string(&Value::Null, &mut diagnostics);

        assert!(diagnostics.has_errors());
        assert_eq!(
            diagnostics.iter().next().unwrap().summary(),
            "Missing required attribute"
        );
    }

    #[rstest]
    #[case::unknown_passes(Value::Unknown, false)]
    #[case::known_passes(Value::Known("svc".to_owned()), false)]
    #[case::empty_fails(Value::Known(String::new()), true)]
    fn length_constraint_only_applies_to_known(
        #[case] value: Value<String>,
        #[case] expect_error: bool,
    ) {
        let mut diagnostics = Diagnostics::new();
        NAME.check_string(&value, &mut diagnostics);

        assert_eq!(diagnostics.has_errors(), expect_error);
    }

    #[test]
    fn one_of_lists_allowed_tokens() {
        let mut diagnostics = Diagnostics::new();
        KIND.check_string(&Value::Known("REGEX".to_owned()), &mut diagnostics);

        let diagnostic = diagnostics.iter().next().unwrap();
        assert_eq!(
            diagnostic.detail(),
            "kind must be one of [\"EXACT\", \"PARAMETER\"], got \"REGEX\""
        );
    }

    #[rstest]
    #[case(0, true)]
    #[case(1, false)]
    #[case(10, false)]
    #[case(11, true)]
    fn size_constraints_bound_collections(#[case] size: usize, #[case] expect_error: bool) {
        let mut diagnostics = Diagnostics::new();
        let value = Value::Known(vec!["GET".to_owned(); size]);
        METHODS.check_set_size(&value, &mut diagnostics);

        assert_eq!(diagnostics.has_errors(), expect_error);
    }

    #[test]
    fn replacement_paths_reflect_flags() {
        assert_eq!(SCHEMA.replacement_paths().collect::<Vec<_>>(), ["locked"]);
        assert!(SCHEMA.attribute("locked").unwrap().forces_replacement());
        assert!(!SCHEMA.attribute("name").unwrap().forces_replacement());
    }

    #[test]
    fn require_when_fires_only_on_match() {
        let mut diagnostics = Diagnostics::new();
        require_when(&NAME, false, &KIND, "EXACT", Some("EXACT"), &mut diagnostics);
        require_when(&NAME, false, &KIND, "EXACT", Some("PARAMETER"), &mut diagnostics);
        require_when(&NAME, false, &KIND, "EXACT", None, &mut diagnostics);

        assert_eq!(diagnostics.len(), 1);
        assert_eq!(
            diagnostics.iter().next().unwrap().detail(),
            "name must be configured when kind is \"EXACT\""
        );
    }

    #[test]
    fn conflict_when_fires_only_when_set() {
        let mut diagnostics = Diagnostics::new();
        conflict_when(&NAME, true, &KIND, "EXACT", Some("EXACT"), &mut diagnostics);
        conflict_when(&NAME, false, &KIND, "EXACT", Some("EXACT"), &mut diagnostics);

        assert_eq!(diagnostics.len(), 1);
    }
}
