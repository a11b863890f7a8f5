//! Processor trees, which reshape a resolved value before it is used.

use serde::{Deserialize, Serialize};

use super::{
    Condition, ConditionDto, EntityRef, EntityRefDto, ValueType, ValueTypeDto, ValueTypeKind,
    missing,
};
use crate::{
    diagnostic::{Diagnostic, Diagnostics},
    path::AttributePath,
    value::Value,
};

/// A named transformation applied to a data value.
///
/// Chains apply their children in declared order; that order is
/// significant and preserved through both codec directions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Processor {
    pub name: Value<String>,
    pub kind: ProcessorKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessorKind {
    Chain {
        processors: Value<Vec<Processor>>,
    },
    CollectionFilter {
        predicate: Value<Box<Condition>>,
    },
    CollectionTransform {
        processor: Value<Box<Processor>>,
    },
    JsonPath {
        expression: Value<String>,
        value_type: Value<ValueType>,
    },
    Spel {
        expression: Value<String>,
        value_type: Value<ValueType>,
    },
    XPath {
        expression: Value<String>,
        value_type: Value<ValueType>,
    },
    Reference {
        processor_ref: Value<EntityRef>,
    },
}

impl Processor {
    pub fn json_path(
        name: impl Into<String>,
        expression: impl Into<String>,
        value_type: ValueTypeKind,
    ) -> Self {
        Self {
            name: Value::Known(name.into()),
            kind: ProcessorKind::JsonPath {
                expression: Value::Known(expression.into()),
                value_type: Value::Known(ValueType::of(value_type)),
            },
        }
    }

    pub fn chain(name: impl Into<String>, processors: Vec<Processor>) -> Self {
        Self {
            name: Value::Known(name.into()),
            kind: ProcessorKind::Chain {
                processors: Value::Known(processors),
            },
        }
    }

    pub fn validate(&self, path: &AttributePath, diagnostics: &mut Diagnostics) {
        if self.name.is_null() {
            diagnostics.push(missing(&path.clone().attribute("name")));
        }

        match &self.kind {
            ProcessorKind::Chain { processors } => {
                let list_path = path.clone().attribute("processors");
                if processors.is_null() {
                    diagnostics.push(missing(&list_path));
                }
                if let Value::Known(processors) = processors {
                    for (index, processor) in processors.iter().enumerate() {
                        processor.validate(&list_path.clone().index(index), diagnostics);
                    }
                }
            }
            ProcessorKind::CollectionFilter { predicate } => {
                let predicate_path = path.clone().attribute("predicate");
                if predicate.is_null() {
                    diagnostics.push(missing(&predicate_path));
                }
                if let Value::Known(predicate) = predicate {
                    predicate.validate(&predicate_path, diagnostics);
                }
            }
            ProcessorKind::CollectionTransform { processor } => {
                let processor_path = path.clone().attribute("processor");
                if processor.is_null() {
                    diagnostics.push(missing(&processor_path));
                }
                if let Value::Known(processor) = processor {
                    processor.validate(&processor_path, diagnostics);
                }
            }
            ProcessorKind::JsonPath {
                expression,
                value_type,
            }
            | ProcessorKind::Spel {
                expression,
                value_type,
            }
            | ProcessorKind::XPath {
                expression,
                value_type,
            } => {
                if expression.is_null() {
                    diagnostics.push(missing(&path.clone().attribute("expression")));
                }
                let value_type_path = path.clone().attribute("value_type");
                if value_type.is_null() {
                    diagnostics.push(missing(&value_type_path));
                }
                if let Value::Known(value_type) = value_type {
                    value_type.validate(&value_type_path, diagnostics);
                }
            }
            ProcessorKind::Reference { processor_ref } => {
                let ref_path = path.clone().attribute("processor_ref");
                if processor_ref.is_null() {
                    diagnostics.push(missing(&ref_path));
                }
                if let Value::Known(processor_ref) = processor_ref {
                    processor_ref.validate(&ref_path, diagnostics);
                }
            }
        }
    }

    pub fn expand(&self, path: &AttributePath) -> Result<ProcessorDto, Diagnostic> {
        let name = self
            .name
            .expand_required(&path.clone().attribute("name"))?
            .clone();

        let kind = match &self.kind {
            ProcessorKind::Chain { processors } => {
                let list_path = path.clone().attribute("processors");
                let processors = processors
                    .expand_required(&list_path)?
                    .iter()
                    .enumerate()
                    .map(|(index, processor)| processor.expand(&list_path.clone().index(index)))
                    .collect::<Result<_, _>>()?;
                ProcessorKindDto::Chain { processors }
            }
            ProcessorKind::CollectionFilter { predicate } => {
                let predicate_path = path.clone().attribute("predicate");
                ProcessorKindDto::CollectionFilter {
                    predicate: Box::new(
                        predicate
                            .expand_required(&predicate_path)?
                            .expand(&predicate_path)?,
                    ),
                }
            }
            ProcessorKind::CollectionTransform { processor } => {
                let processor_path = path.clone().attribute("processor");
                ProcessorKindDto::CollectionTransform {
                    processor: Box::new(
                        processor
                            .expand_required(&processor_path)?
                            .expand(&processor_path)?,
                    ),
                }
            }
            ProcessorKind::JsonPath {
                expression,
                value_type,
            } => {
                let (expression, value_type) =
                    expand_expression(expression, value_type, path)?;
                ProcessorKindDto::JsonPath {
                    expression,
                    value_type,
                }
            }
            ProcessorKind::Spel {
                expression,
                value_type,
            } => {
                let (expression, value_type) =
                    expand_expression(expression, value_type, path)?;
                ProcessorKindDto::Spel {
                    expression,
                    value_type,
                }
            }
            ProcessorKind::XPath {
                expression,
                value_type,
            } => {
                let (expression, value_type) =
                    expand_expression(expression, value_type, path)?;
                ProcessorKindDto::XPath {
                    expression,
                    value_type,
                }
            }
            ProcessorKind::Reference { processor_ref } => {
                let ref_path = path.clone().attribute("processor_ref");
                ProcessorKindDto::Reference {
                    processor_ref: processor_ref
                        .expand_required(&ref_path)?
                        .expand(&ref_path)?,
                }
            }
        };

        Ok(ProcessorDto { name, kind })
    }

    pub fn flatten(dto: ProcessorDto, path: &AttributePath) -> Result<Self, Diagnostic> {
        let kind = match dto.kind {
            ProcessorKindDto::Chain { processors } => {
                let list_path = path.clone().attribute("processors");
                let processors = processors
                    .into_iter()
                    .enumerate()
                    .map(|(index, processor)| {
                        Self::flatten(processor, &list_path.clone().index(index))
                    })
                    .collect::<Result<_, _>>()?;
                ProcessorKind::Chain {
                    processors: Value::Known(processors),
                }
            }
            ProcessorKindDto::CollectionFilter { predicate } => ProcessorKind::CollectionFilter {
                predicate: Value::Known(Box::new(Condition::flatten(
                    *predicate,
                    &path.clone().attribute("predicate"),
                )?)),
            },
            ProcessorKindDto::CollectionTransform { processor } => {
                ProcessorKind::CollectionTransform {
                    processor: Value::Known(Box::new(Self::flatten(
                        *processor,
                        &path.clone().attribute("processor"),
                    )?)),
                }
            }
            ProcessorKindDto::JsonPath {
                expression,
                value_type,
            } => ProcessorKind::JsonPath {
                expression: Value::Known(expression),
                value_type: flatten_value_type(value_type, path)?,
            },
            ProcessorKindDto::Spel {
                expression,
                value_type,
            } => ProcessorKind::Spel {
                expression: Value::Known(expression),
                value_type: flatten_value_type(value_type, path)?,
            },
            ProcessorKindDto::XPath {
                expression,
                value_type,
            } => ProcessorKind::XPath {
                expression: Value::Known(expression),
                value_type: flatten_value_type(value_type, path)?,
            },
            ProcessorKindDto::Reference { processor_ref } => ProcessorKind::Reference {
                processor_ref: Value::Known(EntityRef::flatten(processor_ref)),
            },
        };

        Ok(Self {
            name: Value::Known(dto.name),
            kind,
        })
    }
}

fn expand_expression(
    expression: &Value<String>,
    value_type: &Value<ValueType>,
    path: &AttributePath,
) -> Result<(String, ValueTypeDto), Diagnostic> {
    let expression = expression
        .expand_required(&path.clone().attribute("expression"))?
        .clone();
    let value_type_path = path.clone().attribute("value_type");
    let value_type = value_type
        .expand_required(&value_type_path)?
        .expand(&value_type_path)?;
    Ok((expression, value_type))
}

fn flatten_value_type(
    value_type: ValueTypeDto,
    path: &AttributePath,
) -> Result<Value<ValueType>, Diagnostic> {
    Ok(Value::Known(ValueType::flatten(
        value_type,
        &path.clone().attribute("value_type"),
    )?))
}

/// Wire shape of a processor: a `name` plus the tagged variant fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorDto {
    pub name: String,
    #[serde(flatten)]
    pub kind: ProcessorKindDto,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProcessorKindDto {
    #[serde(rename = "CHAIN")]
    Chain { processors: Vec<ProcessorDto> },

    #[serde(rename = "COLLECTION_FILTER")]
    CollectionFilter { predicate: Box<ConditionDto> },

    #[serde(rename = "COLLECTION_TRANSFORM")]
    CollectionTransform { processor: Box<ProcessorDto> },

    #[serde(rename = "JSON_PATH")]
    JsonPath {
        expression: String,
        #[serde(rename = "valueType")]
        value_type: ValueTypeDto,
    },

    #[serde(rename = "SPEL")]
    Spel {
        expression: String,
        #[serde(rename = "valueType")]
        value_type: ValueTypeDto,
    },

    #[serde(rename = "XPATH")]
    XPath {
        expression: String,
        #[serde(rename = "valueType")]
        value_type: ValueTypeDto,
    },

    #[serde(rename = "REFERENCE")]
    Reference {
        #[serde(rename = "processorRef")]
        processor_ref: EntityRefDto,
    },
}
