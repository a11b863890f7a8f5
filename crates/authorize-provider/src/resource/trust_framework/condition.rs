//! Named condition definitions in the trust-framework editor.
//!
//! A condition wraps one expression tree under a library name so
//! policies and other conditions can reference it by id.

use async_trait::async_trait;
use snafu::ResultExt;

use crate::{
    diagnostic::{Diagnostic, Diagnostics},
    expr::{Condition, ConditionDto, EntityRef, EntityRefDto, check_known_token},
    id::{RESOURCE_ID_FMT, ResourceId},
    import::{self, ImportComponent},
    resource::{
        Error, ImportSnafu, OpContext, ReadOutcome, Reconcile, Result, call, ensure_valid,
        recover_gone, require_known,
        trust_framework::{PURGE_POLICY, delete_and_purge},
    },
    schema::{AttributeSchema, Constraint, KindSchema},
    transport::{self, ApiError, EnvironmentClient, RetryPolicy},
    value::Value,
};

const ID: AttributeSchema = AttributeSchema::computed("id");
const ENVIRONMENT_ID: AttributeSchema =
    AttributeSchema::required("environment_id").requires_replace();
const CONDITION: AttributeSchema = AttributeSchema::required("condition");
const DESCRIPTION: AttributeSchema = AttributeSchema::optional("description");
const FULL_NAME: AttributeSchema = AttributeSchema::optional("full_name");
const NAME: AttributeSchema =
    AttributeSchema::required("name").constrained(&[Constraint::LengthAtLeast(1)]);
const PARENT: AttributeSchema = AttributeSchema::optional("parent");
const TYPE: AttributeSchema = AttributeSchema::computed("type");
const VERSION: AttributeSchema = AttributeSchema::computed("version");

const ENTITY_TYPE: &[&str] = &["CONDITION"];

pub const SCHEMA: KindSchema = KindSchema {
    kind: "trust_framework_condition",
    attributes: &[
        ID,
        ENVIRONMENT_ID,
        CONDITION,
        DESCRIPTION,
        FULL_NAME,
        NAME,
        PARENT,
        TYPE,
        VERSION,
    ],
};

static IMPORT_COMPONENTS: [ImportComponent; 2] = [
    ImportComponent::new("environment_id", RESOURCE_ID_FMT),
    ImportComponent::new("trust_framework_condition_id", RESOURCE_ID_FMT).primary(),
];

/// Declared and recorded state of one condition definition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrustFrameworkCondition {
    pub id: Value<ResourceId>,
    pub environment_id: Value<ResourceId>,
    pub condition: Value<Condition>,
    pub description: Value<String>,
    pub full_name: Value<String>,
    pub name: Value<String>,
    pub parent: Value<EntityRef>,
    pub kind: Value<String>,
    pub version: Value<String>,
}

impl TrustFrameworkCondition {
    pub fn validate(&self) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();

        NAME.check_string(&self.name, &mut diagnostics);

        CONDITION.check_presence(&self.condition, &mut diagnostics);
        if let Value::Known(condition) = &self.condition {
            condition.validate(&CONDITION.path(), &mut diagnostics);
        }

        if let Value::Known(parent) = &self.parent {
            parent.validate(&PARENT.path(), &mut diagnostics);
        }

        diagnostics
    }

    /// Builds the request body. `id` and `version` stay empty; updates
    /// fill them in after the pre-write version read.
    pub fn expand(&self) -> Result<TrustFrameworkConditionDto, Diagnostic> {
        Ok(TrustFrameworkConditionDto {
            id: None,
            name: self.name.expand_required(&NAME.path())?.clone(),
            full_name: self.full_name.expand_optional(&FULL_NAME.path())?.cloned(),
            description: self
                .description
                .expand_optional(&DESCRIPTION.path())?
                .cloned(),
            parent: self
                .parent
                .expand_optional(&PARENT.path())?
                .map(|parent| parent.expand(&PARENT.path()))
                .transpose()?,
            kind: None,
            condition: self
                .condition
                .expand_required(&CONDITION.path())?
                .expand(&CONDITION.path())?,
            version: None,
        })
    }

    pub fn flatten(
        dto: TrustFrameworkConditionDto,
        environment_id: ResourceId,
    ) -> Result<Self, Diagnostic> {
        if let Some(kind) = &dto.kind {
            check_known_token(kind, ENTITY_TYPE, &TYPE.path())?;
        }

        Ok(Self {
            id: Value::from(dto.id),
            environment_id: Value::Known(environment_id),
            condition: Value::Known(Condition::flatten(dto.condition, &CONDITION.path())?),
            description: Value::from(dto.description),
            full_name: Value::from(dto.full_name),
            name: Value::Known(dto.name),
            parent: Value::from(dto.parent.map(EntityRef::flatten)),
            kind: Value::from(dto.kind),
            version: Value::from(dto.version),
        })
    }
}

/// Wire shape of a condition definition.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustFrameworkConditionDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ResourceId>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<EntityRefDto>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub condition: ConditionDto,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// REST surface for condition definitions.
#[async_trait]
pub trait TrustFrameworkConditionClient: EnvironmentClient {
    async fn create_condition(
        &self,
        environment_id: &ResourceId,
        body: &TrustFrameworkConditionDto,
    ) -> Result<TrustFrameworkConditionDto, ApiError>;

    async fn read_condition(
        &self,
        environment_id: &ResourceId,
        condition_id: &ResourceId,
    ) -> Result<TrustFrameworkConditionDto, ApiError>;

    async fn update_condition(
        &self,
        environment_id: &ResourceId,
        condition_id: &ResourceId,
        body: &TrustFrameworkConditionDto,
    ) -> Result<TrustFrameworkConditionDto, ApiError>;

    async fn delete_condition(
        &self,
        environment_id: &ResourceId,
        condition_id: &ResourceId,
    ) -> Result<(), ApiError>;
}

pub struct TrustFrameworkConditionReconciler<C> {
    client: C,
    retry: RetryPolicy,
    purge: RetryPolicy,
}

impl<C: TrustFrameworkConditionClient> TrustFrameworkConditionReconciler<C> {
    pub fn new(client: C) -> Self {
        Self::with_policies(client, RetryPolicy::DEFAULT, PURGE_POLICY)
    }

    pub fn with_policies(client: C, retry: RetryPolicy, purge: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            purge,
        }
    }
}

#[async_trait]
impl<C: TrustFrameworkConditionClient> Reconcile for TrustFrameworkConditionReconciler<C> {
    type State = TrustFrameworkCondition;

    async fn create(
        &self,
        ctx: &OpContext,
        desired: TrustFrameworkCondition,
    ) -> Result<TrustFrameworkCondition> {
        ensure_valid(desired.validate())?;

        let environment_id = require_known(&desired.environment_id, "environment_id")?;
        let body = desired.expand().map_err(Error::invalid)?;

        let response = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || self.client.create_condition(&environment_id, &body),
        )
        .await?;

        TrustFrameworkCondition::flatten(response, environment_id).map_err(Error::drift)
    }

    async fn read(
        &self,
        ctx: &OpContext,
        current: TrustFrameworkCondition,
    ) -> Result<ReadOutcome<TrustFrameworkCondition>> {
        let environment_id = require_known(&current.environment_id, "environment_id")?;
        let condition_id = require_known(&current.id, "id")?;

        let outcome = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || self.client.read_condition(&environment_id, &condition_id),
        )
        .await;

        match outcome {
            Ok(response) => Ok(ReadOutcome::Current(
                TrustFrameworkCondition::flatten(response, environment_id)
                    .map_err(Error::drift)?,
            )),
            Err(error) => recover_gone(error),
        }
    }

    async fn update(
        &self,
        ctx: &OpContext,
        desired: TrustFrameworkCondition,
    ) -> Result<TrustFrameworkCondition> {
        ensure_valid(desired.validate())?;

        let environment_id = require_known(&desired.environment_id, "environment_id")?;
        let condition_id = require_known(&desired.id, "id")?;

        let current = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || self.client.read_condition(&environment_id, &condition_id),
        )
        .await?;

        let mut body = desired.expand().map_err(Error::invalid)?;
        body.id = Some(condition_id.clone());
        body.version = current.version;

        let response = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::no_retry,
            || self.client.update_condition(&environment_id, &condition_id, &body),
        )
        .await?;

        TrustFrameworkCondition::flatten(response, environment_id).map_err(Error::drift)
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        current: TrustFrameworkCondition,
    ) -> Result<Diagnostics> {
        let environment_id = require_known(&current.environment_id, "environment_id")?;
        let condition_id = require_known(&current.id, "id")?;

        delete_and_purge(
            &self.client,
            ctx,
            &self.retry,
            &self.purge,
            &environment_id,
            || self.client.delete_condition(&environment_id, &condition_id),
            || async {
                self.client
                    .read_condition(&environment_id, &condition_id)
                    .await
                    .map(|_| ())
            },
        )
        .await
    }

    fn import(&self, id: &str) -> Result<TrustFrameworkCondition> {
        let parsed = import::parse(id, &IMPORT_COMPONENTS).context(ImportSnafu)?;
        Ok(TrustFrameworkCondition {
            id: Value::Known(
                parsed
                    .require_resource_id("trust_framework_condition_id")
                    .context(ImportSnafu)?,
            ),
            environment_id: Value::Known(
                parsed
                    .require_resource_id("environment_id")
                    .context(ImportSnafu)?,
            ),
            ..TrustFrameworkCondition::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::expr::{Comparand, Comparator};

    fn resource_id(tail: u32) -> ResourceId {
        format!("00000000-0000-4000-8000-{tail:012}").parse().unwrap()
    }

    fn definition() -> TrustFrameworkCondition {
        TrustFrameworkCondition {
            environment_id: Value::Known(resource_id(1)),
            name: Value::Known("Employment.Is employee".to_owned()),
            condition: Value::Known(Condition::comparison(
                Comparator::Equals,
                Comparand::attribute(resource_id(4)),
                Comparand::constant("employee"),
            )),
            ..TrustFrameworkCondition::default()
        }
    }

    #[test]
    fn minimal_configuration_is_valid() {
        assert!(!definition().validate().has_errors());
    }

    #[test]
    fn the_expression_tree_is_required() {
        let mut definition = definition();
        definition.condition = Value::Null;

        let diagnostics = definition.validate();

        assert!(
            diagnostics
                .iter()
                .any(|diagnostic| diagnostic.detail().contains("condition must be configured"))
        );
    }

    #[test]
    fn expand_serializes_the_create_body() {
        let mut definition = definition();
        definition.description = Value::Known("Checks the HR record".to_owned());
        definition.parent = Value::Known(EntityRef::to(resource_id(3)));

        let body = definition.expand().unwrap();

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "name": "Employment.Is employee",
                "description": "Checks the HR record",
                "parent": {"id": "00000000-0000-4000-8000-000000000003"},
                "condition": {
                    "type": "COMPARISON",
                    "comparator": "EQUALS",
                    "left": {"type": "ATTRIBUTE", "id": "00000000-0000-4000-8000-000000000004"},
                    "right": {"type": "CONSTANT", "value": "employee"},
                },
            })
        );
    }

    #[test]
    fn flatten_records_the_editor_bookkeeping() {
        let response = json!({
            "id": "00000000-0000-4000-8000-000000000009",
            "name": "Employment.Is employee",
            "fullName": "Employment.Is employee",
            "type": "CONDITION",
            "version": "36",
            "condition": {"type": "EMPTY"},
        });
        let dto: TrustFrameworkConditionDto = serde_json::from_value(response).unwrap();

        let state = TrustFrameworkCondition::flatten(dto, resource_id(1)).unwrap();

        assert_eq!(state.id, Value::Known(resource_id(9)));
        assert_eq!(state.kind, Value::Known("CONDITION".to_owned()));
        assert_eq!(state.version, Value::Known("36".to_owned()));
        assert_eq!(state.condition, Value::Known(Condition::Empty));
    }

    #[test]
    fn flatten_rejects_other_entity_types() {
        let response = json!({
            "name": "Employment.Is employee",
            "type": "PROCESSOR",
            "condition": {"type": "EMPTY"},
        });
        let dto: TrustFrameworkConditionDto = serde_json::from_value(response).unwrap();

        let diagnostic = TrustFrameworkCondition::flatten(dto, resource_id(1)).unwrap_err();

        assert_eq!(diagnostic.summary(), "Unrecognized value from service");
    }
}
