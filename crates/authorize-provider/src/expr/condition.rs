//! Condition trees and their comparands.

use serde::{Deserialize, Serialize};
use strum::VariantNames;

use super::{
    Comparator, EntityRef, EntityRefDto, ValueType, ValueTypeDto, check_known_token, missing,
    one_of_error,
};
use crate::{
    diagnostic::{Diagnostic, Diagnostics},
    id::ResourceId,
    path::AttributePath,
    value::Value,
};

/// A boolean expression over trust framework attributes.
///
/// `And`, `Or` and `Not` combine sub-conditions to arbitrary depth,
/// `Comparison` compares two comparands, `Empty` tests an attribute for
/// absence and `Reference` points at a condition stored in the trust
/// framework.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Condition {
    And {
        conditions: Value<Vec<Condition>>,
    },
    Or {
        conditions: Value<Vec<Condition>>,
    },
    Not {
        condition: Value<Box<Condition>>,
    },
    Comparison {
        comparator: Value<String>,
        left: Value<Comparand>,
        right: Value<Comparand>,
    },
    Empty,
    Reference {
        reference: Value<EntityRef>,
    },
}

impl Condition {
    pub fn comparison(comparator: Comparator, left: Comparand, right: Comparand) -> Self {
        Self::Comparison {
            comparator: Value::Known(comparator.to_string()),
            left: Value::Known(left),
            right: Value::Known(right),
        }
    }

    pub fn validate(&self, path: &AttributePath, diagnostics: &mut Diagnostics) {
        match self {
            Self::And { conditions } | Self::Or { conditions } => {
                let list_path = path.clone().attribute("conditions");
                if conditions.is_null() {
                    diagnostics.push(missing(&list_path));
                }
                if let Value::Known(conditions) = conditions {
                    for (index, condition) in conditions.iter().enumerate() {
                        condition.validate(&list_path.clone().index(index), diagnostics);
                    }
                }
            }
            Self::Not { condition } => {
                let child_path = path.clone().attribute("condition");
                if condition.is_null() {
                    diagnostics.push(missing(&child_path));
                }
                if let Value::Known(condition) = condition {
                    condition.validate(&child_path, diagnostics);
                }
            }
            Self::Comparison {
                comparator,
                left,
                right,
            } => {
                let comparator_path = path.clone().attribute("comparator");
                if comparator.is_null() {
                    diagnostics.push(missing(&comparator_path));
                }
                if let Value::Known(comparator) = comparator {
                    if !Comparator::VARIANTS.contains(&comparator.as_str()) {
                        diagnostics.push(one_of_error(
                            &comparator_path,
                            comparator,
                            Comparator::VARIANTS,
                        ));
                    }
                }
                for (side, comparand) in [("left", left), ("right", right)] {
                    let side_path = path.clone().attribute(side);
                    if comparand.is_null() {
                        diagnostics.push(missing(&side_path));
                    }
                    if let Value::Known(comparand) = comparand {
                        comparand.validate(&side_path, diagnostics);
                    }
                }
            }
            Self::Empty => {}
            Self::Reference { reference } => {
                let reference_path = path.clone().attribute("reference");
                if reference.is_null() {
                    diagnostics.push(missing(&reference_path));
                }
                if let Value::Known(reference) = reference {
                    reference.validate(&reference_path, diagnostics);
                }
            }
        }
    }

    pub fn expand(&self, path: &AttributePath) -> Result<ConditionDto, Diagnostic> {
        match self {
            Self::And { conditions } => Ok(ConditionDto::And {
                conditions: expand_children(conditions, &path.clone().attribute("conditions"))?,
            }),
            Self::Or { conditions } => Ok(ConditionDto::Or {
                conditions: expand_children(conditions, &path.clone().attribute("conditions"))?,
            }),
            Self::Not { condition } => {
                let child_path = path.clone().attribute("condition");
                let condition = condition.expand_required(&child_path)?;
                Ok(ConditionDto::Not {
                    condition: Box::new(condition.expand(&child_path)?),
                })
            }
            Self::Comparison {
                comparator,
                left,
                right,
            } => {
                let comparator = comparator
                    .expand_required(&path.clone().attribute("comparator"))?
                    .clone();
                let left_path = path.clone().attribute("left");
                let right_path = path.clone().attribute("right");
                Ok(ConditionDto::Comparison {
                    comparator,
                    left: left.expand_required(&left_path)?.expand(&left_path)?,
                    right: right.expand_required(&right_path)?.expand(&right_path)?,
                })
            }
            Self::Empty => Ok(ConditionDto::Empty),
            Self::Reference { reference } => {
                let reference_path = path.clone().attribute("reference");
                Ok(ConditionDto::Reference {
                    reference: reference
                        .expand_required(&reference_path)?
                        .expand(&reference_path)?,
                })
            }
        }
    }

    pub fn flatten(dto: ConditionDto, path: &AttributePath) -> Result<Self, Diagnostic> {
        match dto {
            ConditionDto::And { conditions } => Ok(Self::And {
                conditions: flatten_children(conditions, &path.clone().attribute("conditions"))?,
            }),
            ConditionDto::Or { conditions } => Ok(Self::Or {
                conditions: flatten_children(conditions, &path.clone().attribute("conditions"))?,
            }),
            ConditionDto::Not { condition } => Ok(Self::Not {
                condition: Value::Known(Box::new(Self::flatten(
                    *condition,
                    &path.clone().attribute("condition"),
                )?)),
            }),
            ConditionDto::Comparison {
                comparator,
                left,
                right,
            } => {
                check_known_token(
                    &comparator,
                    Comparator::VARIANTS,
                    &path.clone().attribute("comparator"),
                )?;
                Ok(Self::Comparison {
                    comparator: Value::Known(comparator),
                    left: Value::Known(Comparand::flatten(left, &path.clone().attribute("left"))?),
                    right: Value::Known(Comparand::flatten(
                        right,
                        &path.clone().attribute("right"),
                    )?),
                })
            }
            ConditionDto::Empty => Ok(Self::Empty),
            ConditionDto::Reference { reference } => Ok(Self::Reference {
                reference: Value::Known(EntityRef::flatten(reference)),
            }),
        }
    }
}

fn expand_children(
    conditions: &Value<Vec<Condition>>,
    path: &AttributePath,
) -> Result<Vec<ConditionDto>, Diagnostic> {
    conditions
        .expand_required(path)?
        .iter()
        .enumerate()
        .map(|(index, condition)| condition.expand(&path.clone().index(index)))
        .collect()
}

fn flatten_children(
    conditions: Vec<ConditionDto>,
    path: &AttributePath,
) -> Result<Value<Vec<Condition>>, Diagnostic> {
    let conditions = conditions
        .into_iter()
        .enumerate()
        .map(|(index, condition)| Condition::flatten(condition, &path.clone().index(index)))
        .collect::<Result<_, _>>()?;
    Ok(Value::Known(conditions))
}

/// One side of a comparison.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Comparand {
    Constant {
        value: Value<String>,
        value_type: Value<ValueType>,
    },
    Attribute {
        id: Value<ResourceId>,
    },
    CurrentUserId,
    CurrentRepetitionValue,
}

impl Comparand {
    pub fn attribute(id: ResourceId) -> Self {
        Self::Attribute {
            id: Value::Known(id),
        }
    }

    pub fn constant(value: impl Into<String>) -> Self {
        Self::Constant {
            value: Value::Known(value.into()),
            value_type: Value::Null,
        }
    }

    pub fn validate(&self, path: &AttributePath, diagnostics: &mut Diagnostics) {
        match self {
            Self::Constant { value, value_type } => {
                if value.is_null() {
                    diagnostics.push(missing(&path.clone().attribute("value")));
                }
                if let Value::Known(value_type) = value_type {
                    value_type.validate(&path.clone().attribute("value_type"), diagnostics);
                }
            }
            Self::Attribute { id } => {
                if id.is_null() {
                    diagnostics.push(missing(&path.clone().attribute("id")));
                }
            }
            Self::CurrentUserId | Self::CurrentRepetitionValue => {}
        }
    }

    pub fn expand(&self, path: &AttributePath) -> Result<ComparandDto, Diagnostic> {
        match self {
            Self::Constant { value, value_type } => {
                let value = value
                    .expand_required(&path.clone().attribute("value"))?
                    .clone();
                let value_type_path = path.clone().attribute("value_type");
                let value_type = value_type
                    .expand_optional(&value_type_path)?
                    .map(|value_type| value_type.expand(&value_type_path))
                    .transpose()?;
                Ok(ComparandDto::Constant { value, value_type })
            }
            Self::Attribute { id } => Ok(ComparandDto::Attribute {
                id: id.expand_required(&path.clone().attribute("id"))?.clone(),
            }),
            Self::CurrentUserId => Ok(ComparandDto::CurrentUserId),
            Self::CurrentRepetitionValue => Ok(ComparandDto::CurrentRepetitionValue),
        }
    }

    pub fn flatten(dto: ComparandDto, path: &AttributePath) -> Result<Self, Diagnostic> {
        match dto {
            ComparandDto::Constant { value, value_type } => Ok(Self::Constant {
                value: Value::Known(value),
                value_type: match value_type {
                    Some(value_type) => Value::Known(ValueType::flatten(
                        value_type,
                        &path.clone().attribute("value_type"),
                    )?),
                    None => Value::Null,
                },
            }),
            ComparandDto::Attribute { id } => Ok(Self::Attribute {
                id: Value::Known(id),
            }),
            ComparandDto::CurrentUserId => Ok(Self::CurrentUserId),
            ComparandDto::CurrentRepetitionValue => Ok(Self::CurrentRepetitionValue),
        }
    }
}

/// Wire shape of a condition node, dispatching on the `type` tag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConditionDto {
    #[serde(rename = "AND")]
    And { conditions: Vec<ConditionDto> },

    #[serde(rename = "OR")]
    Or { conditions: Vec<ConditionDto> },

    #[serde(rename = "NOT")]
    Not { condition: Box<ConditionDto> },

    #[serde(rename = "COMPARISON")]
    Comparison {
        comparator: String,
        left: ComparandDto,
        right: ComparandDto,
    },

    #[serde(rename = "EMPTY")]
    Empty,

    #[serde(rename = "REFERENCE")]
    Reference { reference: EntityRefDto },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ComparandDto {
    #[serde(rename = "CONSTANT")]
    Constant {
        value: String,
        #[serde(
            rename = "valueType",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        value_type: Option<ValueTypeDto>,
    },

    #[serde(rename = "ATTRIBUTE")]
    Attribute { id: ResourceId },

    #[serde(rename = "CURRENT_USER_ID")]
    CurrentUserId,

    #[serde(rename = "CURRENT_REPETITION_VALUE")]
    CurrentRepetitionValue,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn attribute_id() -> ResourceId {
        "11111111-2222-3333-4444-555555555555".parse().unwrap()
    }

    fn root() -> AttributePath {
        AttributePath::root("condition")
    }

    #[test]
    fn server_response_round_trips_byte_equal() {
        let response = json!({
            "type": "AND",
            "conditions": [
                {
                    "type": "COMPARISON",
                    "comparator": "EQUALS",
                    "left": { "type": "ATTRIBUTE", "id": "11111111-2222-3333-4444-555555555555" },
                    "right": { "type": "CONSTANT", "value": "employee" },
                },
                { "type": "NOT", "condition": { "type": "EMPTY" } },
                {
                    "type": "REFERENCE",
                    "reference": { "id": "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee" },
                },
            ],
        });

        let dto: ConditionDto = serde_json::from_value(response.clone()).unwrap();
        let model = Condition::flatten(dto, &root()).unwrap();
        let re_expanded = model.expand(&root()).unwrap();

        assert_eq!(serde_json::to_value(&re_expanded).unwrap(), response);
    }

    #[test]
    fn or_children_round_trip_recursively() {
        let response = json!({
            "type": "OR",
            "conditions": [
                {
                    "type": "OR",
                    "conditions": [
                        {
                            "type": "COMPARISON",
                            "comparator": "CONTAINS",
                            "left": { "type": "ATTRIBUTE", "id": "11111111-2222-3333-4444-555555555555" },
                            "right": { "type": "CURRENT_USER_ID" },
                        },
                    ],
                },
            ],
        });

        let dto: ConditionDto = serde_json::from_value(response.clone()).unwrap();
        let model = Condition::flatten(dto, &root()).unwrap();

        assert_eq!(
            serde_json::to_value(model.expand(&root()).unwrap()).unwrap(),
            response
        );
    }

    #[test]
    fn nesting_depth_is_unbounded() {
        let mut condition = Condition::Empty;
        for _ in 0..16 {
            condition = Condition::Not {
                condition: Value::Known(Box::new(condition)),
            };
        }

        let mut diagnostics = Diagnostics::new();
        condition.validate(&root(), &mut diagnostics);
        assert!(diagnostics.is_empty());

        let dto = condition.expand(&root()).unwrap();
        assert_eq!(Condition::flatten(dto, &root()).unwrap(), condition);
    }

    #[test]
    fn comparison_requires_comparator_left_and_right() {
        let condition = Condition::Comparison {
            comparator: Value::Null,
            left: Value::Null,
            right: Value::Null,
        };

        let mut diagnostics = Diagnostics::new();
        condition.validate(&root(), &mut diagnostics);

        assert_eq!(diagnostics.errors().count(), 3);
    }

    #[test]
    fn unknown_comparator_token_fails_validation() {
        let condition = Condition::Comparison {
            comparator: Value::Known("ALMOST_EQUALS".to_owned()),
            left: Value::Known(Comparand::attribute(attribute_id())),
            right: Value::Known(Comparand::constant("x")),
        };

        let mut diagnostics = Diagnostics::new();
        condition.validate(&root(), &mut diagnostics);

        let diagnostic = diagnostics.iter().next().unwrap();
        assert_eq!(diagnostic.summary(), "Invalid attribute value");
        assert_eq!(
            diagnostic.attribute().unwrap().to_string(),
            "condition.comparator"
        );
    }

    #[test]
    fn unresolved_nested_value_aborts_expansion_with_its_path() {
        let condition = Condition::And {
            conditions: Value::Known(vec![Condition::Comparison {
                comparator: Value::Known("EQUALS".to_owned()),
                left: Value::Known(Comparand::Attribute { id: Value::Unknown }),
                right: Value::Known(Comparand::constant("x")),
            }]),
        };

        let diagnostic = condition.expand(&root()).unwrap_err();
        assert_eq!(diagnostic.summary(), "Unresolved attribute value");
        assert_eq!(
            diagnostic.attribute().unwrap().to_string(),
            "condition.conditions[0].left.id"
        );
    }

    #[test]
    fn drifted_comparator_from_server_is_rejected() {
        let dto = ConditionDto::Comparison {
            comparator: "FUZZY_MATCH".to_owned(),
            left: ComparandDto::CurrentUserId,
            right: ComparandDto::CurrentRepetitionValue,
        };

        let diagnostic = Condition::flatten(dto, &root()).unwrap_err();
        assert_eq!(diagnostic.summary(), "Unrecognized value from service");
    }
}
