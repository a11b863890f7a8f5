//! Named processor definitions in the trust-framework editor.

use async_trait::async_trait;
use snafu::ResultExt;

use crate::{
    diagnostic::{Diagnostic, Diagnostics},
    expr::{EntityRef, EntityRefDto, Processor, ProcessorDto, check_known_token},
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
const DESCRIPTION: AttributeSchema = AttributeSchema::optional("description");
const FULL_NAME: AttributeSchema = AttributeSchema::optional("full_name");
const NAME: AttributeSchema =
    AttributeSchema::required("name").constrained(&[Constraint::LengthAtLeast(1)]);
const PARENT: AttributeSchema = AttributeSchema::optional("parent");
const PROCESSOR: AttributeSchema = AttributeSchema::required("processor");
const TYPE: AttributeSchema = AttributeSchema::computed("type");
const VERSION: AttributeSchema = AttributeSchema::computed("version");

const ENTITY_TYPE: &[&str] = &["PROCESSOR"];

pub const SCHEMA: KindSchema = KindSchema {
    kind: "trust_framework_processor",
    attributes: &[
        ID,
        ENVIRONMENT_ID,
        DESCRIPTION,
        FULL_NAME,
        NAME,
        PARENT,
        PROCESSOR,
        TYPE,
        VERSION,
    ],
};

static IMPORT_COMPONENTS: [ImportComponent; 2] = [
    ImportComponent::new("environment_id", RESOURCE_ID_FMT),
    ImportComponent::new("trust_framework_processor_id", RESOURCE_ID_FMT).primary(),
];

/// Declared and recorded state of one processor definition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrustFrameworkProcessor {
    pub id: Value<ResourceId>,
    pub environment_id: Value<ResourceId>,
    pub description: Value<String>,
    pub full_name: Value<String>,
    pub name: Value<String>,
    pub parent: Value<EntityRef>,
    pub processor: Value<Processor>,
    pub kind: Value<String>,
    pub version: Value<String>,
}

impl TrustFrameworkProcessor {
    pub fn validate(&self) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();

        NAME.check_string(&self.name, &mut diagnostics);

        PROCESSOR.check_presence(&self.processor, &mut diagnostics);
        if let Value::Known(processor) = &self.processor {
            processor.validate(&PROCESSOR.path(), &mut diagnostics);
        }

        if let Value::Known(parent) = &self.parent {
            parent.validate(&PARENT.path(), &mut diagnostics);
        }

        diagnostics
    }

    pub fn expand(&self) -> Result<TrustFrameworkProcessorDto, Diagnostic> {
        Ok(TrustFrameworkProcessorDto {
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
            processor: self
                .processor
                .expand_required(&PROCESSOR.path())?
                .expand(&PROCESSOR.path())?,
            version: None,
        })
    }

    pub fn flatten(
        dto: TrustFrameworkProcessorDto,
        environment_id: ResourceId,
    ) -> Result<Self, Diagnostic> {
        if let Some(kind) = &dto.kind {
            check_known_token(kind, ENTITY_TYPE, &TYPE.path())?;
        }

        Ok(Self {
            id: Value::from(dto.id),
            environment_id: Value::Known(environment_id),
            description: Value::from(dto.description),
            full_name: Value::from(dto.full_name),
            name: Value::Known(dto.name),
            parent: Value::from(dto.parent.map(EntityRef::flatten)),
            processor: Value::Known(Processor::flatten(dto.processor, &PROCESSOR.path())?),
            kind: Value::from(dto.kind),
            version: Value::from(dto.version),
        })
    }
}

/// Wire shape of a processor definition.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustFrameworkProcessorDto {
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
    pub processor: ProcessorDto,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// REST surface for processor definitions.
#[async_trait]
pub trait TrustFrameworkProcessorClient: EnvironmentClient {
    async fn create_processor(
        &self,
        environment_id: &ResourceId,
        body: &TrustFrameworkProcessorDto,
    ) -> Result<TrustFrameworkProcessorDto, ApiError>;

    async fn read_processor(
        &self,
        environment_id: &ResourceId,
        processor_id: &ResourceId,
    ) -> Result<TrustFrameworkProcessorDto, ApiError>;

    async fn update_processor(
        &self,
        environment_id: &ResourceId,
        processor_id: &ResourceId,
        body: &TrustFrameworkProcessorDto,
    ) -> Result<TrustFrameworkProcessorDto, ApiError>;

    async fn delete_processor(
        &self,
        environment_id: &ResourceId,
        processor_id: &ResourceId,
    ) -> Result<(), ApiError>;
}

pub struct TrustFrameworkProcessorReconciler<C> {
    client: C,
    retry: RetryPolicy,
    purge: RetryPolicy,
}

impl<C: TrustFrameworkProcessorClient> TrustFrameworkProcessorReconciler<C> {
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
impl<C: TrustFrameworkProcessorClient> Reconcile for TrustFrameworkProcessorReconciler<C> {
    type State = TrustFrameworkProcessor;

    async fn create(
        &self,
        ctx: &OpContext,
        desired: TrustFrameworkProcessor,
    ) -> Result<TrustFrameworkProcessor> {
        ensure_valid(desired.validate())?;

        let environment_id = require_known(&desired.environment_id, "environment_id")?;
        let body = desired.expand().map_err(Error::invalid)?;

        let response = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || self.client.create_processor(&environment_id, &body),
        )
        .await?;

        TrustFrameworkProcessor::flatten(response, environment_id).map_err(Error::drift)
    }

    async fn read(
        &self,
        ctx: &OpContext,
        current: TrustFrameworkProcessor,
    ) -> Result<ReadOutcome<TrustFrameworkProcessor>> {
        let environment_id = require_known(&current.environment_id, "environment_id")?;
        let processor_id = require_known(&current.id, "id")?;

        let outcome = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || self.client.read_processor(&environment_id, &processor_id),
        )
        .await;

        match outcome {
            Ok(response) => Ok(ReadOutcome::Current(
                TrustFrameworkProcessor::flatten(response, environment_id)
                    .map_err(Error::drift)?,
            )),
            Err(error) => recover_gone(error),
        }
    }

    async fn update(
        &self,
        ctx: &OpContext,
        desired: TrustFrameworkProcessor,
    ) -> Result<TrustFrameworkProcessor> {
        ensure_valid(desired.validate())?;

        let environment_id = require_known(&desired.environment_id, "environment_id")?;
        let processor_id = require_known(&desired.id, "id")?;

        let current = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || self.client.read_processor(&environment_id, &processor_id),
        )
        .await?;

        let mut body = desired.expand().map_err(Error::invalid)?;
        body.id = Some(processor_id.clone());
        body.version = current.version;

        let response = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::no_retry,
            || self.client.update_processor(&environment_id, &processor_id, &body),
        )
        .await?;

        TrustFrameworkProcessor::flatten(response, environment_id).map_err(Error::drift)
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        current: TrustFrameworkProcessor,
    ) -> Result<Diagnostics> {
        let environment_id = require_known(&current.environment_id, "environment_id")?;
        let processor_id = require_known(&current.id, "id")?;

        delete_and_purge(
            &self.client,
            ctx,
            &self.retry,
            &self.purge,
            &environment_id,
            || self.client.delete_processor(&environment_id, &processor_id),
            || async {
                self.client
                    .read_processor(&environment_id, &processor_id)
                    .await
                    .map(|_| ())
            },
        )
        .await
    }

    fn import(&self, id: &str) -> Result<TrustFrameworkProcessor> {
        let parsed = import::parse(id, &IMPORT_COMPONENTS).context(ImportSnafu)?;
        Ok(TrustFrameworkProcessor {
            id: Value::Known(
                parsed
                    .require_resource_id("trust_framework_processor_id")
                    .context(ImportSnafu)?,
            ),
            environment_id: Value::Known(
                parsed
                    .require_resource_id("environment_id")
                    .context(ImportSnafu)?,
            ),
            ..TrustFrameworkProcessor::default()
        })
    }
}
