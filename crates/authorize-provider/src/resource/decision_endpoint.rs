//! Decision endpoints are the HTTP surface policies are evaluated
//! through. The tenant always carries one owned endpoint; additional
//! endpoints pin a specific published policy snapshot via
//! `authorization_version_id`.

use async_trait::async_trait;
use snafu::ResultExt;

use crate::{
    diagnostic::{Diagnostic, Diagnostics},
    expr::EntityRefDto,
    id::{RESOURCE_ID_FMT, ResourceId},
    import::{self, ImportComponent},
    resource::{
        Error, ImportSnafu, OpContext, ReadOutcome, Reconcile, Result, call, ensure_valid,
        recover_deleted, recover_gone, require_known,
    },
    schema::{AttributeSchema, Constraint, KindSchema},
    transport::{self, ApiError, EnvironmentClient, RetryPolicy},
    value::Value,
};

const ID: AttributeSchema = AttributeSchema::computed("id");
const ENVIRONMENT_ID: AttributeSchema =
    AttributeSchema::required("environment_id").requires_replace();
const ALTERNATE_ID: AttributeSchema =
    AttributeSchema::optional("alternate_id").requires_replace();
const AUTHORIZATION_VERSION_ID: AttributeSchema =
    AttributeSchema::optional("authorization_version_id");
const DESCRIPTION: AttributeSchema = AttributeSchema::optional_computed("description");
const NAME: AttributeSchema =
    AttributeSchema::required("name").constrained(&[Constraint::LengthAtLeast(1)]);
const OWNED: AttributeSchema = AttributeSchema::computed("owned");
const RECORD_RECENT_REQUESTS: AttributeSchema =
    AttributeSchema::required("record_recent_requests");

pub const SCHEMA: KindSchema = KindSchema {
    kind: "decision_endpoint",
    attributes: &[
        ID,
        ENVIRONMENT_ID,
        ALTERNATE_ID,
        AUTHORIZATION_VERSION_ID,
        DESCRIPTION,
        NAME,
        OWNED,
        RECORD_RECENT_REQUESTS,
    ],
};

static IMPORT_COMPONENTS: [ImportComponent; 2] = [
    ImportComponent::new("environment_id", RESOURCE_ID_FMT),
    ImportComponent::new("decision_endpoint_id", RESOURCE_ID_FMT).primary(),
];

/// Declared and recorded state of one decision endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecisionEndpoint {
    pub id: Value<ResourceId>,
    pub environment_id: Value<ResourceId>,
    pub alternate_id: Value<String>,
    pub authorization_version_id: Value<ResourceId>,
    pub description: Value<String>,
    pub name: Value<String>,
    pub owned: Value<bool>,
    pub record_recent_requests: Value<bool>,
}

impl DecisionEndpoint {
    /// The service stores an empty description when none is given; the
    /// default keeps state and response aligned.
    pub fn with_defaults(mut self) -> Self {
        if self.description.is_null() {
            self.description = Value::Known(String::new());
        }
        self
    }

    pub fn validate(&self) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();

        NAME.check_string(&self.name, &mut diagnostics);
        RECORD_RECENT_REQUESTS.check_presence(&self.record_recent_requests, &mut diagnostics);

        diagnostics
    }

    pub fn expand(&self) -> Result<DecisionEndpointDto, Diagnostic> {
        let authorization_version = self
            .authorization_version_id
            .expand_optional(&AUTHORIZATION_VERSION_ID.path())?
            .map(|id| EntityRefDto { id: id.clone() });

        Ok(DecisionEndpointDto {
            id: None,
            name: self.name.expand_required(&NAME.path())?.clone(),
            description: self
                .description
                .expand_optional(&DESCRIPTION.path())?
                .cloned(),
            record_recent_requests: *self
                .record_recent_requests
                .expand_required(&RECORD_RECENT_REQUESTS.path())?,
            alternate_id: self
                .alternate_id
                .expand_optional(&ALTERNATE_ID.path())?
                .cloned(),
            authorization_version,
            owned: None,
        })
    }

    pub fn flatten(dto: DecisionEndpointDto, environment_id: ResourceId) -> Self {
        Self {
            id: Value::from(dto.id),
            environment_id: Value::Known(environment_id),
            alternate_id: Value::from(dto.alternate_id),
            authorization_version_id: Value::from(
                dto.authorization_version.map(|version| version.id),
            ),
            description: Value::from(dto.description),
            name: Value::Known(dto.name),
            owned: Value::from(dto.owned),
            record_recent_requests: Value::Known(dto.record_recent_requests),
        }
    }
}

/// Wire shape of a decision endpoint.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionEndpointDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ResourceId>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub record_recent_requests: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternate_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_version: Option<EntityRefDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owned: Option<bool>,
}

/// REST surface for decision endpoints.
#[async_trait]
pub trait DecisionEndpointClient: EnvironmentClient {
    async fn create_decision_endpoint(
        &self,
        environment_id: &ResourceId,
        body: &DecisionEndpointDto,
    ) -> Result<DecisionEndpointDto, ApiError>;

    async fn read_decision_endpoint(
        &self,
        environment_id: &ResourceId,
        endpoint_id: &ResourceId,
    ) -> Result<DecisionEndpointDto, ApiError>;

    async fn update_decision_endpoint(
        &self,
        environment_id: &ResourceId,
        endpoint_id: &ResourceId,
        body: &DecisionEndpointDto,
    ) -> Result<DecisionEndpointDto, ApiError>;

    async fn delete_decision_endpoint(
        &self,
        environment_id: &ResourceId,
        endpoint_id: &ResourceId,
    ) -> Result<(), ApiError>;
}

pub struct DecisionEndpointReconciler<C> {
    client: C,
    retry: RetryPolicy,
}

impl<C: DecisionEndpointClient> DecisionEndpointReconciler<C> {
    pub fn new(client: C) -> Self {
        Self::with_retry(client, RetryPolicy::DEFAULT)
    }

    pub fn with_retry(client: C, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }
}

#[async_trait]
impl<C: DecisionEndpointClient> Reconcile for DecisionEndpointReconciler<C> {
    type State = DecisionEndpoint;

    async fn create(
        &self,
        ctx: &OpContext,
        desired: DecisionEndpoint,
    ) -> Result<DecisionEndpoint> {
        let desired = desired.with_defaults();
        ensure_valid(desired.validate())?;

        let environment_id = require_known(&desired.environment_id, "environment_id")?;
        let body = desired.expand().map_err(Error::invalid)?;

        let response = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || self.client.create_decision_endpoint(&environment_id, &body),
        )
        .await?;

        Ok(DecisionEndpoint::flatten(response, environment_id))
    }

    async fn read(
        &self,
        ctx: &OpContext,
        current: DecisionEndpoint,
    ) -> Result<ReadOutcome<DecisionEndpoint>> {
        let environment_id = require_known(&current.environment_id, "environment_id")?;
        let endpoint_id = require_known(&current.id, "id")?;

        let outcome = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || {
                self.client
                    .read_decision_endpoint(&environment_id, &endpoint_id)
            },
        )
        .await;

        match outcome {
            Ok(response) => Ok(ReadOutcome::Current(DecisionEndpoint::flatten(
                response,
                environment_id,
            ))),
            Err(error) => recover_gone(error),
        }
    }

    async fn update(
        &self,
        ctx: &OpContext,
        desired: DecisionEndpoint,
    ) -> Result<DecisionEndpoint> {
        let desired = desired.with_defaults();
        ensure_valid(desired.validate())?;

        let environment_id = require_known(&desired.environment_id, "environment_id")?;
        let endpoint_id = require_known(&desired.id, "id")?;
        let body = desired.expand().map_err(Error::invalid)?;

        let response = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::no_retry,
            || {
                self.client
                    .update_decision_endpoint(&environment_id, &endpoint_id, &body)
            },
        )
        .await?;

        Ok(DecisionEndpoint::flatten(response, environment_id))
    }

    async fn delete(&self, ctx: &OpContext, current: DecisionEndpoint) -> Result<Diagnostics> {
        let environment_id = require_known(&current.environment_id, "environment_id")?;
        let endpoint_id = require_known(&current.id, "id")?;

        let mut diagnostics = Diagnostics::new();
        let outcome = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::no_retry,
            || {
                self.client
                    .delete_decision_endpoint(&environment_id, &endpoint_id)
            },
        )
        .await;

        if let Err(error) = outcome {
            recover_deleted(error, &mut diagnostics)?;
        }
        Ok(diagnostics)
    }

    fn import(&self, id: &str) -> Result<DecisionEndpoint> {
        let parsed = import::parse(id, &IMPORT_COMPONENTS).context(ImportSnafu)?;
        Ok(DecisionEndpoint {
            id: Value::Known(
                parsed
                    .require_resource_id("decision_endpoint_id")
                    .context(ImportSnafu)?,
            ),
            environment_id: Value::Known(
                parsed
                    .require_resource_id("environment_id")
                    .context(ImportSnafu)?,
            ),
            ..DecisionEndpoint::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn resource_id(tail: u32) -> ResourceId {
        format!("00000000-0000-4000-8000-{tail:012}").parse().unwrap()
    }

    fn endpoint() -> DecisionEndpoint {
        DecisionEndpoint {
            environment_id: Value::Known(resource_id(1)),
            name: Value::Known("Self-service portal".to_owned()),
            record_recent_requests: Value::Known(true),
            ..DecisionEndpoint::default()
        }
        .with_defaults()
    }

    #[test]
    fn minimal_configuration_is_valid() {
        assert!(!endpoint().validate().has_errors());
    }

    #[test]
    fn record_recent_requests_must_be_configured() {
        let mut endpoint = endpoint();
        endpoint.record_recent_requests = Value::Null;

        let diagnostics = endpoint.validate();

        assert!(
            diagnostics
                .iter()
                .any(|diagnostic| diagnostic.detail().contains("record_recent_requests"))
        );
    }

    #[test]
    fn description_defaults_to_empty() {
        assert_eq!(endpoint().description, Value::Known(String::new()));
    }

    #[test]
    fn expand_serializes_the_create_body() {
        let mut endpoint = endpoint();
        endpoint.authorization_version_id = Value::Known(resource_id(3));

        let body = endpoint.expand().unwrap();

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "name": "Self-service portal",
                "description": "",
                "recordRecentRequests": true,
                "authorizationVersion": {"id": "00000000-0000-4000-8000-000000000003"},
            })
        );
    }

    #[test]
    fn flatten_copies_computed_attributes() {
        let response = json!({
            "id": "00000000-0000-4000-8000-000000000009",
            "name": "Self-service portal",
            "description": "",
            "recordRecentRequests": true,
            "owned": false,
        });
        let dto: DecisionEndpointDto = serde_json::from_value(response).unwrap();

        let state = DecisionEndpoint::flatten(dto, resource_id(1));

        assert_eq!(state.id, Value::Known(resource_id(9)));
        assert_eq!(state.owned, Value::Known(false));
        assert_eq!(state.alternate_id, Value::Null);
        assert_eq!(state.authorization_version_id, Value::Null);
    }
}
