//! Policy statements: the obligations and advice a policy decision
//! carries back to the enforcement point.
//!
//! The `payload` is an opaque JSON document owned by the caller. It is
//! stored compact-encoded so formatting differences never show up as
//! drift, but its contents are not interpreted. Unlike the other editor
//! entities, statements have no name hierarchy.

use async_trait::async_trait;
use snafu::ResultExt;
use strum::VariantNames;

use crate::{
    diagnostic::{Diagnostic, Diagnostics},
    expr::{EntityRef, EntityRefDto, check_known_token},
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
const APPLIES_IF: AttributeSchema = AttributeSchema::required("applies_if")
    .constrained(&[Constraint::OneOf(StatementAppliesIf::VARIANTS)]);
const APPLIES_TO: AttributeSchema = AttributeSchema::required("applies_to")
    .constrained(&[Constraint::OneOf(StatementAppliesTo::VARIANTS)]);
const ATTRIBUTES: AttributeSchema =
    AttributeSchema::required("attributes").constrained(&[Constraint::SizeAtLeast(1)]);
const CODE: AttributeSchema =
    AttributeSchema::required("code").constrained(&[Constraint::LengthAtLeast(1)]);
const DESCRIPTION: AttributeSchema = AttributeSchema::optional("description");
const NAME: AttributeSchema =
    AttributeSchema::required("name").constrained(&[Constraint::LengthAtLeast(1)]);
const OBLIGATORY: AttributeSchema = AttributeSchema::optional("obligatory");
const PAYLOAD: AttributeSchema =
    AttributeSchema::required("payload").constrained(&[Constraint::LengthAtLeast(1)]);
const VERSION: AttributeSchema = AttributeSchema::computed("version");

pub const SCHEMA: KindSchema = KindSchema {
    kind: "trust_framework_statement",
    attributes: &[
        ID,
        ENVIRONMENT_ID,
        APPLIES_IF,
        APPLIES_TO,
        ATTRIBUTES,
        CODE,
        DESCRIPTION,
        NAME,
        OBLIGATORY,
        PAYLOAD,
        VERSION,
    ],
};

static IMPORT_COMPONENTS: [ImportComponent; 2] = [
    ImportComponent::new("environment_id", RESOURCE_ID_FMT),
    ImportComponent::new("trust_framework_statement_id", RESOURCE_ID_FMT).primary(),
];

/// Which decisions the statement is attached to.
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
pub enum StatementAppliesTo {
    Permit,
    Deny,
    Both,
}

/// When the statement fires relative to the decision tree.
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
pub enum StatementAppliesIf {
    FinalDecisionMatches,
    PathMatches,
}

/// Declared and recorded state of one policy statement.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrustFrameworkStatement {
    pub id: Value<ResourceId>,
    pub environment_id: Value<ResourceId>,
    pub applies_if: Value<String>,
    pub applies_to: Value<String>,
    pub attributes: Value<Vec<EntityRef>>,
    pub code: Value<String>,
    pub description: Value<String>,
    pub name: Value<String>,
    pub obligatory: Value<bool>,
    pub payload: Value<String>,
    pub version: Value<String>,
}

impl TrustFrameworkStatement {
    pub fn validate(&self) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();

        NAME.check_string(&self.name, &mut diagnostics);
        CODE.check_string(&self.code, &mut diagnostics);
        APPLIES_TO.check_string(&self.applies_to, &mut diagnostics);
        APPLIES_IF.check_string(&self.applies_if, &mut diagnostics);

        PAYLOAD.check_string(&self.payload, &mut diagnostics);
        if let Value::Known(payload) = &self.payload {
            if let Err(error) = serde_json::from_str::<serde_json::Value>(payload) {
                diagnostics.push(Diagnostic::attribute_error(
                    PAYLOAD.path(),
                    "Invalid JSON payload",
                    format!("{} must be a valid JSON document: {error}", PAYLOAD.path()),
                ));
            }
        }

        ATTRIBUTES.check_set_size(&self.attributes, &mut diagnostics);
        if let Value::Known(attributes) = &self.attributes {
            for (index, reference) in attributes.iter().enumerate() {
                reference.validate(&ATTRIBUTES.path().index(index), &mut diagnostics);
            }
        }

        diagnostics
    }

    pub fn expand(&self) -> Result<TrustFrameworkStatementDto, Diagnostic> {
        let attributes = self
            .attributes
            .expand_required(&ATTRIBUTES.path())?
            .iter()
            .enumerate()
            .map(|(index, reference)| reference.expand(&ATTRIBUTES.path().index(index)))
            .collect::<Result<Vec<_>, Diagnostic>>()?;

        let payload = canonical_payload(self.payload.expand_required(&PAYLOAD.path())?)?;

        Ok(TrustFrameworkStatementDto {
            id: None,
            name: self.name.expand_required(&NAME.path())?.clone(),
            description: self
                .description
                .expand_optional(&DESCRIPTION.path())?
                .cloned(),
            code: self.code.expand_required(&CODE.path())?.clone(),
            applies_to: self.applies_to.expand_required(&APPLIES_TO.path())?.clone(),
            applies_if: self.applies_if.expand_required(&APPLIES_IF.path())?.clone(),
            payload,
            obligatory: self
                .obligatory
                .expand_optional(&OBLIGATORY.path())?
                .copied(),
            attributes,
            version: None,
        })
    }

    /// Rebuilds state from a response. The attribute references keep
    /// their response order; it is the order the statement renders them
    /// in.
    pub fn flatten(
        dto: TrustFrameworkStatementDto,
        environment_id: ResourceId,
    ) -> Result<Self, Diagnostic> {
        check_known_token(
            &dto.applies_to,
            StatementAppliesTo::VARIANTS,
            &APPLIES_TO.path(),
        )?;
        check_known_token(
            &dto.applies_if,
            StatementAppliesIf::VARIANTS,
            &APPLIES_IF.path(),
        )?;

        Ok(Self {
            id: Value::from(dto.id),
            environment_id: Value::Known(environment_id),
            applies_if: Value::Known(dto.applies_if),
            applies_to: Value::Known(dto.applies_to),
            attributes: Value::Known(
                dto.attributes.into_iter().map(EntityRef::flatten).collect(),
            ),
            code: Value::Known(dto.code),
            description: Value::from(dto.description),
            name: Value::Known(dto.name),
            obligatory: Value::from(dto.obligatory),
            payload: Value::Known(canonicalize_or_keep(dto.payload)),
            version: Value::from(dto.version),
        })
    }
}

/// Compact-encodes the payload so formatting never counts as a change.
fn canonical_payload(payload: &str) -> Result<String, Diagnostic> {
    let invalid = |error: String| {
        Diagnostic::attribute_error(
            PAYLOAD.path(),
            "Invalid JSON payload",
            format!("{} must be a valid JSON document: {error}", PAYLOAD.path()),
        )
    };

    let value: serde_json::Value =
        serde_json::from_str(payload).map_err(|error| invalid(error.to_string()))?;
    serde_json::to_string(&value).map_err(|error| invalid(error.to_string()))
}

/// Responses normally carry valid JSON; anything else is recorded
/// verbatim rather than rejected, since the payload is opaque.
fn canonicalize_or_keep(payload: String) -> String {
    match serde_json::from_str::<serde_json::Value>(&payload)
        .ok()
        .and_then(|value| serde_json::to_string(&value).ok())
    {
        Some(canonical) => canonical,
        None => payload,
    }
}

/// Wire shape of a policy statement.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustFrameworkStatementDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ResourceId>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub code: String,
    pub applies_to: String,
    pub applies_if: String,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obligatory: Option<bool>,
    pub attributes: Vec<EntityRefDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// REST surface for policy statements.
#[async_trait]
pub trait TrustFrameworkStatementClient: EnvironmentClient {
    async fn create_statement(
        &self,
        environment_id: &ResourceId,
        body: &TrustFrameworkStatementDto,
    ) -> Result<TrustFrameworkStatementDto, ApiError>;

    async fn read_statement(
        &self,
        environment_id: &ResourceId,
        statement_id: &ResourceId,
    ) -> Result<TrustFrameworkStatementDto, ApiError>;

    async fn update_statement(
        &self,
        environment_id: &ResourceId,
        statement_id: &ResourceId,
        body: &TrustFrameworkStatementDto,
    ) -> Result<TrustFrameworkStatementDto, ApiError>;

    async fn delete_statement(
        &self,
        environment_id: &ResourceId,
        statement_id: &ResourceId,
    ) -> Result<(), ApiError>;
}

pub struct TrustFrameworkStatementReconciler<C> {
    client: C,
    retry: RetryPolicy,
    purge: RetryPolicy,
}

impl<C: TrustFrameworkStatementClient> TrustFrameworkStatementReconciler<C> {
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
impl<C: TrustFrameworkStatementClient> Reconcile for TrustFrameworkStatementReconciler<C> {
    type State = TrustFrameworkStatement;

    async fn create(
        &self,
        ctx: &OpContext,
        desired: TrustFrameworkStatement,
    ) -> Result<TrustFrameworkStatement> {
        ensure_valid(desired.validate())?;

        let environment_id = require_known(&desired.environment_id, "environment_id")?;
        let body = desired.expand().map_err(Error::invalid)?;

        let response = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || self.client.create_statement(&environment_id, &body),
        )
        .await?;

        TrustFrameworkStatement::flatten(response, environment_id).map_err(Error::drift)
    }

    async fn read(
        &self,
        ctx: &OpContext,
        current: TrustFrameworkStatement,
    ) -> Result<ReadOutcome<TrustFrameworkStatement>> {
        let environment_id = require_known(&current.environment_id, "environment_id")?;
        let statement_id = require_known(&current.id, "id")?;

        let outcome = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || self.client.read_statement(&environment_id, &statement_id),
        )
        .await;

        match outcome {
            Ok(response) => Ok(ReadOutcome::Current(
                TrustFrameworkStatement::flatten(response, environment_id)
                    .map_err(Error::drift)?,
            )),
            Err(error) => recover_gone(error),
        }
    }

    async fn update(
        &self,
        ctx: &OpContext,
        desired: TrustFrameworkStatement,
    ) -> Result<TrustFrameworkStatement> {
        ensure_valid(desired.validate())?;

        let environment_id = require_known(&desired.environment_id, "environment_id")?;
        let statement_id = require_known(&desired.id, "id")?;

        let current = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || self.client.read_statement(&environment_id, &statement_id),
        )
        .await?;

        let mut body = desired.expand().map_err(Error::invalid)?;
        body.id = Some(statement_id.clone());
        body.version = current.version;

        let response = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::no_retry,
            || self.client.update_statement(&environment_id, &statement_id, &body),
        )
        .await?;

        TrustFrameworkStatement::flatten(response, environment_id).map_err(Error::drift)
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        current: TrustFrameworkStatement,
    ) -> Result<Diagnostics> {
        let environment_id = require_known(&current.environment_id, "environment_id")?;
        let statement_id = require_known(&current.id, "id")?;

        delete_and_purge(
            &self.client,
            ctx,
            &self.retry,
            &self.purge,
            &environment_id,
            || self.client.delete_statement(&environment_id, &statement_id),
            || async {
                self.client
                    .read_statement(&environment_id, &statement_id)
                    .await
                    .map(|_| ())
            },
        )
        .await
    }

    fn import(&self, id: &str) -> Result<TrustFrameworkStatement> {
        let parsed = import::parse(id, &IMPORT_COMPONENTS).context(ImportSnafu)?;
        Ok(TrustFrameworkStatement {
            id: Value::Known(
                parsed
                    .require_resource_id("trust_framework_statement_id")
                    .context(ImportSnafu)?,
            ),
            environment_id: Value::Known(
                parsed
                    .require_resource_id("environment_id")
                    .context(ImportSnafu)?,
            ),
            ..TrustFrameworkStatement::default()
        })
    }
}
