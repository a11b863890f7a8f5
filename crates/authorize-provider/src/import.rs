//! Parsing of composite import identifiers.
//!
//! An import identifier carries every id needed to locate a remote resource,
//! joined with `/`, for example `<environment>/<api service>/<operation>`.
//! Each kind declares its expected components as an ordered list; the value
//! of the component marked primary is additionally exposed under the
//! conventional `id` label.

use std::collections::BTreeMap;

use regex::Regex;
use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::id::{ResourceId, ResourceIdParseError};

#[derive(Debug, Snafu)]
pub enum ImportIdParseError {
    #[snafu(display("cannot compile import ID regex"))]
    CompileRegex { source: regex::Error },

    #[snafu(display(
        "invalid import ID {id:?}, expected the format {format:?} matching regex {regex}"
    ))]
    Mismatch {
        id: String,
        format: String,
        regex: String,
    },

    #[snafu(display("no import component labelled {label:?}"))]
    MissingComponent { label: String },

    #[snafu(display("import component {label:?} is not a resource id"))]
    InvalidResourceId {
        label: String,
        source: ResourceIdParseError,
    },
}

/// One segment of a composite import identifier.
#[derive(Debug)]
pub struct ImportComponent {
    label: &'static str,
    pattern: &'static str,
    primary: bool,
}

impl ImportComponent {
    pub const fn new(label: &'static str, pattern: &'static str) -> Self {
        Self {
            label,
            pattern,
            primary: false,
        }
    }

    /// Marks the component whose value doubles as the resource's own `id`.
    pub const fn primary(self) -> Self {
        Self {
            primary: true,
            ..self
        }
    }
}

/// Values captured from a well-formed import identifier, keyed by label.
#[derive(Debug)]
pub struct ParsedImportId {
    values: BTreeMap<&'static str, String>,
}

impl ParsedImportId {
    pub fn get(&self, label: &str) -> Option<&str> {
        self.values.get(label).map(String::as_str)
    }

    pub fn require(&self, label: &'static str) -> Result<&str, ImportIdParseError> {
        self.get(label).context(MissingComponentSnafu { label })
    }

    pub fn require_resource_id(
        &self,
        label: &'static str,
    ) -> Result<ResourceId, ImportIdParseError> {
        self.require(label)?
            .parse()
            .context(InvalidResourceIdSnafu { label })
    }
}

/// Splits `id` on `/` and matches every segment against its component.
///
/// The whole identifier is matched against a single anchored regex joined
/// from the component patterns, so segment count and segment shape fail
/// with the same diagnostic text.
pub fn parse(
    id: &str,
    components: &'static [ImportComponent],
) -> Result<ParsedImportId, ImportIdParseError> {
    let format = components
        .iter()
        .map(|component| component.label)
        .collect::<Vec<_>>()
        .join("/");
    let joined = format!(
        "^{}$",
        components
            .iter()
            .map(|component| component.pattern)
            .collect::<Vec<_>>()
            .join("/")
    );

    let regex = Regex::new(&joined).context(CompileRegexSnafu)?;
    ensure!(
        regex.is_match(id),
        MismatchSnafu {
            id,
            format,
            regex: joined,
        }
    );

    let mut values = BTreeMap::new();
    for (component, value) in components.iter().zip(id.splitn(components.len(), '/')) {
        values.insert(component.label, value.to_owned());
        if component.primary {
            values.insert("id", value.to_owned());
        }
    }

    Ok(ParsedImportId { values })
}
