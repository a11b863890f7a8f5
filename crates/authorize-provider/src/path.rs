//! Attribute paths locate a single value inside a resource's configuration
//! tree. They are attached to [`Diagnostic`](crate::diagnostic::Diagnostic)s
//! so users see which attribute a message refers to, and they let cross-field
//! validators name the sibling attribute they depend on.

use std::fmt::Display;

/// A single step while descending into a configuration tree.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathStep {
    /// A named attribute of a nested object.
    Attribute(String),
    /// An element of an ordered list.
    Index(usize),
    /// A value of a string-keyed map.
    Key(String),
}

/// The location of an attribute, built root-first.
///
/// Rendered in the dotted form users see in diagnostics, for example
/// `authorization_server.type` or `paths[2].pattern`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttributePath {
    steps: Vec<PathStep>,
}

impl AttributePath {
    /// Starts a path at a top-level attribute.
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            steps: vec![PathStep::Attribute(name.into())],
        }
    }

    /// Parses a dotted attribute name (e.g. `access_control.custom.enabled`)
    /// into a path of attribute steps.
    pub fn dotted(name: &str) -> Self {
        Self {
            steps: name
                .split('.')
                .map(|segment| PathStep::Attribute(segment.to_string()))
                .collect(),
        }
    }

    /// Descends into a named attribute.
    #[must_use]
    pub fn attribute(mut self, name: impl Into<String>) -> Self {
        self.steps.push(PathStep::Attribute(name.into()));
        self
    }

    /// Descends into a list element.
    #[must_use]
    pub fn index(mut self, index: usize) -> Self {
        self.steps.push(PathStep::Index(index));
        self
    }

    /// Descends into a map value.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.steps.push(PathStep::Key(key.into()));
        self
    }

    pub fn steps(&self) -> &[PathStep] {
        &self.steps
    }
}

impl Display for AttributePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            match step {
                PathStep::Attribute(name) if i == 0 => write!(f, "{name}")?,
                PathStep::Attribute(name) => write!(f, ".{name}")?,
                PathStep::Index(index) => write!(f, "[{index}]")?,
                PathStep::Key(key) => write!(f, "[{key:?}]")?,
            }
        }
        Ok(())
    }
}

impl From<&str> for AttributePath {
    fn from(name: &str) -> Self {
        Self::dotted(name)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn renders_nested_steps() {
        let path = AttributePath::root("paths").index(2).attribute("pattern");
        assert_eq!(path.to_string(), "paths[2].pattern");
    }

    #[test]
    fn renders_map_keys_quoted() {
        let path = AttributePath::root("redeployment_trigger_values").key("triggerA");
        assert_eq!(path.to_string(), "redeployment_trigger_values[\"triggerA\"]");
    }

    #[rstest]
    #[case("name", 1)]
    #[case("authorization_server.type", 2)]
    #[case("access_control.custom.enabled", 3)]
    fn dotted_round_trips(#[case] input: &str, #[case] steps: usize) {
        let path = AttributePath::dotted(input);
        assert_eq!(path.steps().len(), steps);
        assert_eq!(path.to_string(), input);
    }
}
