//! Resolvers, which produce an attribute's value at decision time.
//!
//! An attribute may carry several resolvers; they are tried in declared
//! order, so that order is preserved through both codec directions.

use serde::{Deserialize, Serialize};
use strum::VariantNames;

use super::{
    Condition, ConditionDto, EntityRef, EntityRefDto, Processor, ProcessorDto, ValueType,
    ValueTypeDto, ValueTypeKind, check_known_token, missing, one_of_error,
};
use crate::{
    diagnostic::{Diagnostic, Diagnostics},
    path::AttributePath,
    value::Value,
};

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
pub enum SystemValue {
    CurrentDateTime,
    Null,
}

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
pub enum UserQueryKind {
    UserId,
}

/// A single source an attribute value can be resolved from.
///
/// `name`, `condition` and `processor` are accepted on every variant;
/// the remaining fields depend on the resolver type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolver {
    pub name: Value<String>,
    pub condition: Value<Condition>,
    pub processor: Value<Box<Processor>>,
    pub kind: ResolverKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolverKind {
    Attribute { value_ref: Value<EntityRef> },
    Constant {
        value: Value<String>,
        value_type: Value<ValueType>,
    },
    CurrentRepetitionValue,
    CurrentUserId,
    Request,
    Service { value_ref: Value<EntityRef> },
    System { value: Value<String> },
    User { query: Value<UserQuery> },
}

/// A directory lookup used by `USER` resolvers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserQuery {
    pub kind: Value<String>,
    pub user_id: Value<String>,
}

impl Resolver {
    fn bare(kind: ResolverKind) -> Self {
        Self {
            name: Value::Null,
            condition: Value::Null,
            processor: Value::Null,
            kind,
        }
    }

    pub fn constant(value: impl Into<String>, value_type: ValueTypeKind) -> Self {
        Self::bare(ResolverKind::Constant {
            value: Value::Known(value.into()),
            value_type: Value::Known(ValueType::of(value_type)),
        })
    }

    pub fn system(value: SystemValue) -> Self {
        Self::bare(ResolverKind::System {
            value: Value::Known(value.to_string()),
        })
    }

    pub fn attribute(value_ref: EntityRef) -> Self {
        Self::bare(ResolverKind::Attribute {
            value_ref: Value::Known(value_ref),
        })
    }

    pub fn validate(&self, path: &AttributePath, diagnostics: &mut Diagnostics) {
        if let Value::Known(condition) = &self.condition {
            condition.validate(&path.clone().attribute("condition"), diagnostics);
        }
        if let Value::Known(processor) = &self.processor {
            processor.validate(&path.clone().attribute("processor"), diagnostics);
        }

        match &self.kind {
            ResolverKind::Attribute { value_ref } | ResolverKind::Service { value_ref } => {
                let ref_path = path.clone().attribute("value_ref");
                if value_ref.is_null() {
                    diagnostics.push(missing(&ref_path));
                }
                if let Value::Known(value_ref) = value_ref {
                    value_ref.validate(&ref_path, diagnostics);
                }
            }
            ResolverKind::Constant { value, value_type } => {
                if value.is_null() {
                    diagnostics.push(missing(&path.clone().attribute("value")));
                }
                let value_type_path = path.clone().attribute("value_type");
                if value_type.is_null() {
                    diagnostics.push(missing(&value_type_path));
                }
                if let Value::Known(value_type) = value_type {
                    value_type.validate(&value_type_path, diagnostics);
                }
            }
            ResolverKind::System { value } => {
                let value_path = path.clone().attribute("value");
                if value.is_null() {
                    diagnostics.push(missing(&value_path));
                }
                if let Value::Known(value) = value {
                    if !SystemValue::VARIANTS.contains(&value.as_str()) {
                        diagnostics.push(one_of_error(&value_path, value, SystemValue::VARIANTS));
                    }
                }
            }
            ResolverKind::User { query } => {
                let query_path = path.clone().attribute("query");
                if query.is_null() {
                    diagnostics.push(missing(&query_path));
                }
                if let Value::Known(query) = query {
                    query.validate(&query_path, diagnostics);
                }
            }
            ResolverKind::CurrentRepetitionValue
            | ResolverKind::CurrentUserId
            | ResolverKind::Request => {}
        }
    }

    pub fn expand(&self, path: &AttributePath) -> Result<ResolverDto, Diagnostic> {
        let name = self
            .name
            .expand_optional(&path.clone().attribute("name"))?
            .cloned();
        let condition_path = path.clone().attribute("condition");
        let condition = self
            .condition
            .expand_optional(&condition_path)?
            .map(|condition| condition.expand(&condition_path))
            .transpose()?;
        let processor_path = path.clone().attribute("processor");
        let processor = self
            .processor
            .expand_optional(&processor_path)?
            .map(|processor| processor.expand(&processor_path))
            .transpose()?
            .map(Box::new);

        let kind = match &self.kind {
            ResolverKind::Attribute { value_ref } => ResolverKindDto::Attribute {
                value_ref: expand_ref(value_ref, path)?,
            },
            ResolverKind::Constant { value, value_type } => {
                let value_type_path = path.clone().attribute("value_type");
                ResolverKindDto::Constant {
                    value: value
                        .expand_required(&path.clone().attribute("value"))?
                        .clone(),
                    value_type: value_type
                        .expand_required(&value_type_path)?
                        .expand(&value_type_path)?,
                }
            }
            ResolverKind::CurrentRepetitionValue => ResolverKindDto::CurrentRepetitionValue,
            ResolverKind::CurrentUserId => ResolverKindDto::CurrentUserId,
            ResolverKind::Request => ResolverKindDto::Request,
            ResolverKind::Service { value_ref } => ResolverKindDto::Service {
                value_ref: expand_ref(value_ref, path)?,
            },
            ResolverKind::System { value } => ResolverKindDto::System {
                value: value
                    .expand_required(&path.clone().attribute("value"))?
                    .clone(),
            },
            ResolverKind::User { query } => {
                let query_path = path.clone().attribute("query");
                ResolverKindDto::User {
                    query: query.expand_required(&query_path)?.expand(&query_path)?,
                }
            }
        };

        Ok(ResolverDto {
            name,
            condition,
            processor,
            kind,
        })
    }

    pub fn flatten(dto: ResolverDto, path: &AttributePath) -> Result<Self, Diagnostic> {
        let condition = dto
            .condition
            .map(|condition| Condition::flatten(condition, &path.clone().attribute("condition")))
            .transpose()?;
        let processor = dto
            .processor
            .map(|processor| Processor::flatten(*processor, &path.clone().attribute("processor")))
            .transpose()?
            .map(Box::new);

        let kind = match dto.kind {
            ResolverKindDto::Attribute { value_ref } => ResolverKind::Attribute {
                value_ref: Value::Known(EntityRef::flatten(value_ref)),
            },
            ResolverKindDto::Constant { value, value_type } => ResolverKind::Constant {
                value: Value::Known(value),
                value_type: Value::Known(ValueType::flatten(
                    value_type,
                    &path.clone().attribute("value_type"),
                )?),
            },
            ResolverKindDto::CurrentRepetitionValue => ResolverKind::CurrentRepetitionValue,
            ResolverKindDto::CurrentUserId => ResolverKind::CurrentUserId,
            ResolverKindDto::Request => ResolverKind::Request,
            ResolverKindDto::Service { value_ref } => ResolverKind::Service {
                value_ref: Value::Known(EntityRef::flatten(value_ref)),
            },
            ResolverKindDto::System { value } => {
                check_known_token(
                    &value,
                    SystemValue::VARIANTS,
                    &path.clone().attribute("value"),
                )?;
                ResolverKind::System {
                    value: Value::Known(value),
                }
            }
            ResolverKindDto::User { query } => ResolverKind::User {
                query: Value::Known(UserQuery::flatten(
                    query,
                    &path.clone().attribute("query"),
                )?),
            },
        };

        Ok(Self {
            name: dto.name.into(),
            condition: condition.into(),
            processor: processor.into(),
            kind,
        })
    }
}

fn expand_ref(value_ref: &Value<EntityRef>, path: &AttributePath) -> Result<EntityRefDto, Diagnostic> {
    let ref_path = path.clone().attribute("value_ref");
    value_ref.expand_required(&ref_path)?.expand(&ref_path)
}

impl UserQuery {
    pub fn user_id(id: impl Into<String>) -> Self {
        Self {
            kind: Value::Known(UserQueryKind::UserId.to_string()),
            user_id: Value::Known(id.into()),
        }
    }

    pub fn validate(&self, path: &AttributePath, diagnostics: &mut Diagnostics) {
        let kind_path = path.clone().attribute("type");
        if self.kind.is_null() {
            diagnostics.push(missing(&kind_path));
        }
        if let Value::Known(kind) = &self.kind {
            if !UserQueryKind::VARIANTS.contains(&kind.as_str()) {
                diagnostics.push(one_of_error(&kind_path, kind, UserQueryKind::VARIANTS));
            } else if kind == UserQueryKind::UserId.as_ref() && self.user_id.is_null() {
                let user_id_path = path.clone().attribute("user_id");
                diagnostics.push(Diagnostic::attribute_error(
                    user_id_path.clone(),
                    "Missing required attribute",
                    format!(
                        "{user_id_path} must be configured when {kind_path} is {:?}",
                        UserQueryKind::UserId.as_ref()
                    ),
                ));
            }
        }
    }

    pub fn expand(&self, path: &AttributePath) -> Result<UserQueryDto, Diagnostic> {
        Ok(UserQueryDto {
            kind: self
                .kind
                .expand_required(&path.clone().attribute("type"))?
                .clone(),
            user_id: self
                .user_id
                .expand_optional(&path.clone().attribute("user_id"))?
                .cloned(),
        })
    }

    pub fn flatten(dto: UserQueryDto, path: &AttributePath) -> Result<Self, Diagnostic> {
        check_known_token(
            &dto.kind,
            UserQueryKind::VARIANTS,
            &path.clone().attribute("type"),
        )?;
        Ok(Self {
            kind: Value::Known(dto.kind),
            user_id: dto.user_id.into(),
        })
    }
}

/// Wire shape of a resolver: the shared optional fields plus the tagged
/// variant fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor: Option<Box<ProcessorDto>>,
    #[serde(flatten)]
    pub kind: ResolverKindDto,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResolverKindDto {
    #[serde(rename = "ATTRIBUTE")]
    Attribute {
        #[serde(rename = "valueRef")]
        value_ref: EntityRefDto,
    },

    #[serde(rename = "CONSTANT")]
    Constant {
        value: String,
        #[serde(rename = "valueType")]
        value_type: ValueTypeDto,
    },

    #[serde(rename = "CURRENT_REPETITION_VALUE")]
    CurrentRepetitionValue,

    #[serde(rename = "CURRENT_USER_ID")]
    CurrentUserId,

    #[serde(rename = "REQUEST")]
    Request,

    #[serde(rename = "SERVICE")]
    Service {
        #[serde(rename = "valueRef")]
        value_ref: EntityRefDto,
    },

    #[serde(rename = "SYSTEM")]
    System { value: String },

    #[serde(rename = "USER")]
    User { query: UserQueryDto },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQueryDto {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}
