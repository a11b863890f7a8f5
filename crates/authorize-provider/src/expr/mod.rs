//! Recursive expression trees of the trust framework editor.
//!
//! Conditions, comparands, processors and resolvers are mutually recursive
//! discriminated unions. Each gets two representations: a model type whose
//! payloads carry tri-state [`Value`]s, used in plans and recorded state,
//! and a `*Dto` type that serializes to the wire shape, dispatching on the
//! `type` tag.
//!
//! Three operations connect them. `validate` walks a model tree during
//! configuration load and collects every violation, `expand` converts a
//! model tree into a DTO and stops at the first unresolved or missing
//! value, and `flatten` converts a server response back, rejecting enum
//! tokens this version does not know so API drift surfaces instead of
//! silently ending up in recorded state.

mod condition;
mod processor;
mod resolver;

pub use condition::{Comparand, ComparandDto, Condition, ConditionDto};
pub use processor::{Processor, ProcessorDto, ProcessorKind};
pub use resolver::{Resolver, ResolverDto, ResolverKind, UserQuery, UserQueryDto};

use strum::VariantNames;

use crate::{
    diagnostic::{Diagnostic, Diagnostics},
    id::ResourceId,
    path::AttributePath,
    value::Value,
};

/// Comparison operators accepted by `COMPARISON` conditions.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum::AsRefStr,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Comparator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    StartsWith,
    EndsWith,
    In,
}

/// Output types a processor or constant can declare.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum::AsRefStr,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueTypeKind {
    String,
    Boolean,
    Number,
    Collection,
    Json,
    Date,
    Duration,
    Xml,
}

/// An `{id}` object pointing at another editor entity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntityRef {
    pub id: Value<ResourceId>,
}

impl EntityRef {
    pub fn to(id: ResourceId) -> Self {
        Self {
            id: Value::Known(id),
        }
    }

    pub fn validate(&self, path: &AttributePath, diagnostics: &mut Diagnostics) {
        if self.id.is_null() {
            diagnostics.push(missing(&path.clone().attribute("id")));
        }
    }

    pub fn expand(&self, path: &AttributePath) -> Result<EntityRefDto, Diagnostic> {
        let id_path = path.clone().attribute("id");
        Ok(EntityRefDto {
            id: self.id.expand_required(&id_path)?.clone(),
        })
    }

    pub fn flatten(dto: EntityRefDto) -> Self {
        Self {
            id: Value::Known(dto.id),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EntityRefDto {
    pub id: ResourceId,
}

/// The `{type}` object declaring a value's output type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValueType {
    pub kind: Value<String>,
}

impl ValueType {
    pub fn of(kind: ValueTypeKind) -> Self {
        Self {
            kind: Value::Known(kind.to_string()),
        }
    }

    pub fn validate(&self, path: &AttributePath, diagnostics: &mut Diagnostics) {
        let kind_path = path.clone().attribute("type");
        if self.kind.is_null() {
            diagnostics.push(missing(&kind_path));
        }
        if let Value::Known(kind) = &self.kind {
            if !ValueTypeKind::VARIANTS.contains(&kind.as_str()) {
                diagnostics.push(one_of_error(&kind_path, kind, ValueTypeKind::VARIANTS));
            }
        }
    }

    pub fn expand(&self, path: &AttributePath) -> Result<ValueTypeDto, Diagnostic> {
        let kind_path = path.clone().attribute("type");
        Ok(ValueTypeDto {
            kind: self.kind.expand_required(&kind_path)?.clone(),
        })
    }

    pub fn flatten(dto: ValueTypeDto, path: &AttributePath) -> Result<Self, Diagnostic> {
        check_known_token(&dto.kind, ValueTypeKind::VARIANTS, &path.clone().attribute("type"))?;
        Ok(Self {
            kind: Value::Known(dto.kind),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ValueTypeDto {
    #[serde(rename = "type")]
    pub kind: String,
}

pub(crate) fn missing(path: &AttributePath) -> Diagnostic {
    Diagnostic::attribute_error(
        path.clone(),
        "Missing required attribute",
        format!("{path} must be configured"),
    )
}

pub(crate) fn one_of_error(
    path: &AttributePath,
    got: &str,
    allowed: &'static [&'static str],
) -> Diagnostic {
    use itertools::Itertools;

    Diagnostic::attribute_error(
        path.clone(),
        "Invalid attribute value",
        format!(
            "{path} must be one of [{}], got {got:?}",
            allowed.iter().map(|token| format!("{token:?}")).join(", ")
        ),
    )
}

/// Rejects enum tokens the service sent that this version does not know.
pub(crate) fn check_known_token(
    token: &str,
    allowed: &'static [&'static str],
    path: &AttributePath,
) -> Result<(), Diagnostic> {
    if allowed.contains(&token) {
        Ok(())
    } else {
        Err(Diagnostic::attribute_error(
            path.clone(),
            "Unrecognized value from service",
            format!(
                "the service sent {token:?} for {path}, which this provider version does not \
                 recognize"
            ),
        ))
    }
}
