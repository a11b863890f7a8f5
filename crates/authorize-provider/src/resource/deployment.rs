//! Deploys the current policy configuration of an API service to its
//! decision endpoint.
//!
//! A deployment is a singleton sub-resource of the API service and is
//! immutable once made: the remote API offers deploy and status-read
//! only. Replacement is driven by `redeployment_trigger_values`, a
//! state-local map the service never sees; a changed value under a key
//! present in both old and new state forces a fresh deployment.

use std::collections::BTreeMap;

use async_trait::async_trait;
use snafu::ResultExt;
use time::OffsetDateTime;

use crate::{
    diagnostic::Diagnostics,
    expr::EntityRefDto,
    id::{RESOURCE_ID_FMT, ResourceId},
    import::{self, ImportComponent},
    resource::{
        ImportSnafu, OpContext, ReadOutcome, Reconcile, Result, call, ensure_valid,
        recover_gone, require_known,
    },
    schema::{AttributeSchema, KindSchema},
    transport::{self, ApiError, EnvironmentClient, RetryPolicy},
    value::Value,
};

/// The deploy POST carries no body, only this content type.
pub const DEPLOY_CONTENT_TYPE: &str = "application/vnd.pingidentity.apiserver.deploy+json";

const ENVIRONMENT_ID: AttributeSchema =
    AttributeSchema::required("environment_id").requires_replace();
const API_SERVICE_ID: AttributeSchema =
    AttributeSchema::required("api_service_id").requires_replace();
const REDEPLOYMENT_TRIGGER_VALUES: AttributeSchema =
    AttributeSchema::optional("redeployment_trigger_values");
const DEPLOYED_AT: AttributeSchema = AttributeSchema::computed("deployed_at");
const STATUS: AttributeSchema = AttributeSchema::computed("status");
const API_SERVER_ID: AttributeSchema = AttributeSchema::computed("api_server_id");
const DECISION_ENDPOINT_ID: AttributeSchema =
    AttributeSchema::computed("decision_endpoint_id");
const POLICY_ID: AttributeSchema = AttributeSchema::computed("policy_id");

pub const SCHEMA: KindSchema = KindSchema {
    kind: "deployment",
    attributes: &[
        ENVIRONMENT_ID,
        API_SERVICE_ID,
        REDEPLOYMENT_TRIGGER_VALUES,
        DEPLOYED_AT,
        STATUS,
        API_SERVER_ID,
        DECISION_ENDPOINT_ID,
        POLICY_ID,
    ],
};

static IMPORT_COMPONENTS: [ImportComponent; 2] = [
    ImportComponent::new("environment_id", RESOURCE_ID_FMT),
    ImportComponent::new("api_service_id", RESOURCE_ID_FMT),
];

/// Reported lifecycle of a deployment. The reconciler records the code
/// verbatim and never acts on it; this enum is for callers that want to
/// interpret recorded state.
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
pub enum DeploymentStatusCode {
    None,
    Requested,
    Deploying,
    DeploymentSuccessful,
    DeploymentFailed,
}

impl DeploymentStatusCode {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::DeploymentSuccessful | Self::DeploymentFailed)
    }
}

/// Declared and recorded state of one deployment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Deployment {
    pub environment_id: Value<ResourceId>,
    pub api_service_id: Value<ResourceId>,
    pub redeployment_trigger_values: Value<BTreeMap<String, Value<String>>>,
    pub deployed_at: Value<OffsetDateTime>,
    pub status: Value<DeploymentStatus>,
    pub api_server_id: Value<ResourceId>,
    pub decision_endpoint_id: Value<ResourceId>,
    pub policy_id: Value<ResourceId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeploymentStatus {
    pub code: Value<String>,
    pub error: Value<DeploymentError>,
}

impl DeploymentStatus {
    /// The recorded code, if it is one this version knows about.
    pub fn code(&self) -> Option<DeploymentStatusCode> {
        self.code
            .as_known()
            .and_then(|code| code.parse().ok())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeploymentError {
    pub id: Value<String>,
    pub code: Value<String>,
    pub message: Value<String>,
}

impl Deployment {
    pub fn validate(&self) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();

        ENVIRONMENT_ID.check_presence(&self.environment_id, &mut diagnostics);
        API_SERVICE_ID.check_presence(&self.api_service_id, &mut diagnostics);

        diagnostics
    }

    /// Plan hook: whether the planned trigger map forces a fresh
    /// deployment.
    ///
    /// Only keys present in both recorded and planned state count; adding
    /// or removing a key is not a redeploy. A shared key whose planned
    /// value changed, or is not yet known, forces replacement.
    pub fn triggers_replacement(state: &Self, plan: &Self) -> bool {
        let Value::Known(recorded) = &state.redeployment_trigger_values else {
            return false;
        };

        match &plan.redeployment_trigger_values {
            Value::Known(planned) => planned.iter().any(|(key, value)| {
                recorded
                    .get(key)
                    .is_some_and(|current| !value.settles_to(current))
            }),
            Value::Unknown => !recorded.is_empty(),
            Value::Null => false,
        }
    }

    /// Rebuilds state from a response. The trigger map never appears on
    /// the wire and is carried over from the declared state.
    pub fn flatten(
        dto: DeploymentDto,
        environment_id: ResourceId,
        api_service_id: ResourceId,
        redeployment_trigger_values: Value<BTreeMap<String, Value<String>>>,
    ) -> Self {
        let status = match dto.status {
            Some(status) => Value::Known(DeploymentStatus {
                code: Value::Known(status.code),
                error: match status.error {
                    Some(error) => Value::Known(DeploymentError {
                        id: Value::from(error.id),
                        code: Value::from(error.code),
                        message: Value::from(error.message),
                    }),
                    None => Value::Null,
                },
            }),
            None => Value::Null,
        };

        Self {
            environment_id: Value::Known(environment_id),
            api_service_id: Value::Known(api_service_id),
            redeployment_trigger_values,
            deployed_at: Value::from(dto.deployed_at),
            status,
            api_server_id: Value::from(dto.api_server.map(|server| server.id)),
            decision_endpoint_id: Value::from(dto.decision_endpoint.map(|endpoint| endpoint.id)),
            policy_id: Value::from(dto.policy.map(|policy| policy.id)),
        }
    }
}

/// Wire shape of a deployment status response.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server: Option<EntityRefDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_endpoint: Option<EntityRefDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<EntityRefDto>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub deployed_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeploymentStatusDto>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeploymentStatusDto {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DeploymentErrorDto>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeploymentErrorDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// REST surface for deployments. The deploy POST has no body and must
/// carry [`DEPLOY_CONTENT_TYPE`].
#[async_trait]
pub trait DeploymentClient: EnvironmentClient {
    async fn deploy_api_service(
        &self,
        environment_id: &ResourceId,
        api_service_id: &ResourceId,
    ) -> Result<DeploymentDto, ApiError>;

    async fn read_deployment(
        &self,
        environment_id: &ResourceId,
        api_service_id: &ResourceId,
    ) -> Result<DeploymentDto, ApiError>;
}

pub struct DeploymentReconciler<C> {
    client: C,
    retry: RetryPolicy,
}

impl<C: DeploymentClient> DeploymentReconciler<C> {
    pub fn new(client: C) -> Self {
        Self::with_retry(client, RetryPolicy::DEFAULT)
    }

    pub fn with_retry(client: C, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }
}

#[async_trait]
impl<C: DeploymentClient> Reconcile for DeploymentReconciler<C> {
    type State = Deployment;

    async fn create(&self, ctx: &OpContext, desired: Deployment) -> Result<Deployment> {
        ensure_valid(desired.validate())?;

        let environment_id = require_known(&desired.environment_id, "environment_id")?;
        let api_service_id = require_known(&desired.api_service_id, "api_service_id")?;

        let response = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || self.client.deploy_api_service(&environment_id, &api_service_id),
        )
        .await?;

        Ok(Deployment::flatten(
            response,
            environment_id,
            api_service_id,
            desired.redeployment_trigger_values,
        ))
    }

    async fn read(
        &self,
        ctx: &OpContext,
        current: Deployment,
    ) -> Result<ReadOutcome<Deployment>> {
        let environment_id = require_known(&current.environment_id, "environment_id")?;
        let api_service_id = require_known(&current.api_service_id, "api_service_id")?;

        let outcome = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || self.client.read_deployment(&environment_id, &api_service_id),
        )
        .await;

        match outcome {
            Ok(response) => Ok(ReadOutcome::Current(Deployment::flatten(
                response,
                environment_id,
                api_service_id,
                current.redeployment_trigger_values,
            ))),
            Err(error) => recover_gone(error),
        }
    }

    /// The remote API cannot update a deployment; trigger-map edits that
    /// did not force replacement land here, so refresh the status and
    /// record the new map.
    async fn update(&self, ctx: &OpContext, desired: Deployment) -> Result<Deployment> {
        ensure_valid(desired.validate())?;

        let environment_id = require_known(&desired.environment_id, "environment_id")?;
        let api_service_id = require_known(&desired.api_service_id, "api_service_id")?;

        let response = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || self.client.read_deployment(&environment_id, &api_service_id),
        )
        .await?;

        Ok(Deployment::flatten(
            response,
            environment_id,
            api_service_id,
            desired.redeployment_trigger_values,
        ))
    }

    /// Deployments are immutable upstream; dropping one from
    /// configuration abandons the record without a remote call.
    async fn delete(&self, _ctx: &OpContext, _current: Deployment) -> Result<Diagnostics> {
        Ok(Diagnostics::new())
    }

    fn import(&self, id: &str) -> Result<Deployment> {
        let parsed = import::parse(id, &IMPORT_COMPONENTS).context(ImportSnafu)?;
        Ok(Deployment {
            environment_id: Value::Known(
                parsed
                    .require_resource_id("environment_id")
                    .context(ImportSnafu)?,
            ),
            api_service_id: Value::Known(
                parsed
                    .require_resource_id("api_service_id")
                    .context(ImportSnafu)?,
            ),
            ..Deployment::default()
        })
    }
}
