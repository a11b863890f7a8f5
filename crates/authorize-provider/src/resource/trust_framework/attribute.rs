//! Attribute definitions in the trust-framework editor.
//!
//! An attribute names a value the decision engine can resolve at
//! runtime. Its resolvers are tried in declared order and the optional
//! processor reshapes whatever they produce, so both lists keep their
//! configured order through the codec. Attributes provisioned by other
//! services arrive with a `managed_entity` marker; everything under it
//! is server-owned bookkeeping.

use async_trait::async_trait;
use snafu::ResultExt;

use crate::{
    diagnostic::{Diagnostic, Diagnostics},
    expr::{
        EntityRef, EntityRefDto, Processor, ProcessorDto, Resolver, ResolverDto, ValueType,
        ValueTypeDto, check_known_token,
    },
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
const DEFAULT_VALUE: AttributeSchema = AttributeSchema::optional("default_value");
const DESCRIPTION: AttributeSchema = AttributeSchema::optional("description");
const FULL_NAME: AttributeSchema = AttributeSchema::computed("full_name");
const MANAGED_ENTITY: AttributeSchema = AttributeSchema::computed("managed_entity");
const NAME: AttributeSchema =
    AttributeSchema::required("name").constrained(&[Constraint::LengthAtLeast(1)]);
const PARENT: AttributeSchema = AttributeSchema::optional("parent");
const PROCESSOR: AttributeSchema = AttributeSchema::optional("processor");
const REPETITION_SOURCE: AttributeSchema = AttributeSchema::optional("repetition_source");
const RESOLVERS: AttributeSchema = AttributeSchema::optional_computed("resolvers");
const TYPE: AttributeSchema = AttributeSchema::computed("type");
const VALUE_SCHEMA: AttributeSchema = AttributeSchema::optional("value_schema");
const VALUE_TYPE: AttributeSchema = AttributeSchema::required("value_type");
const VERSION: AttributeSchema = AttributeSchema::computed("version");

const ENTITY_TYPE: &[&str] = &["ATTRIBUTE"];

pub const SCHEMA: KindSchema = KindSchema {
    kind: "trust_framework_attribute",
    attributes: &[
        ID,
        ENVIRONMENT_ID,
        DEFAULT_VALUE,
        DESCRIPTION,
        FULL_NAME,
        MANAGED_ENTITY,
        NAME,
        PARENT,
        PROCESSOR,
        REPETITION_SOURCE,
        RESOLVERS,
        TYPE,
        VALUE_SCHEMA,
        VALUE_TYPE,
        VERSION,
    ],
};

static IMPORT_COMPONENTS: [ImportComponent; 2] = [
    ImportComponent::new("environment_id", RESOURCE_ID_FMT),
    ImportComponent::new("trust_framework_attribute_id", RESOURCE_ID_FMT).primary(),
];

/// Declared and recorded state of one attribute definition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrustFrameworkAttribute {
    pub id: Value<ResourceId>,
    pub environment_id: Value<ResourceId>,
    pub default_value: Value<String>,
    pub description: Value<String>,
    pub full_name: Value<String>,
    pub managed_entity: Value<ManagedEntity>,
    pub name: Value<String>,
    pub parent: Value<EntityRef>,
    pub processor: Value<Processor>,
    pub repetition_source: Value<EntityRef>,
    pub resolvers: Value<Vec<Resolver>>,
    pub value_schema: Value<String>,
    pub value_type: Value<ValueType>,
    pub kind: Value<String>,
    pub version: Value<String>,
}

/// Marker the service attaches to definitions it provisions itself.
/// Entirely server-owned; never part of a request body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManagedEntity {
    pub owner_service_name: Value<String>,
    pub reference: Value<ManagedEntityReference>,
    pub restrictions: Value<ManagedEntityRestrictions>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManagedEntityReference {
    pub id: Value<String>,
    pub kind: Value<String>,
    pub name: Value<String>,
    pub ui_deep_link: Value<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManagedEntityRestrictions {
    pub read_only: Value<bool>,
    pub disallow_children: Value<bool>,
}

impl TrustFrameworkAttribute {
    /// Fills the attributes the host treats as defaulted when the
    /// configuration leaves them null.
    pub fn with_defaults(mut self) -> Self {
        if self.resolvers.is_null() {
            self.resolvers = Value::Known(Vec::new());
        }
        self
    }

    pub fn validate(&self) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();

        NAME.check_string(&self.name, &mut diagnostics);

        VALUE_TYPE.check_presence(&self.value_type, &mut diagnostics);
        if let Value::Known(value_type) = &self.value_type {
            value_type.validate(&VALUE_TYPE.path(), &mut diagnostics);
        }

        if let Value::Known(parent) = &self.parent {
            parent.validate(&PARENT.path(), &mut diagnostics);
        }
        if let Value::Known(processor) = &self.processor {
            processor.validate(&PROCESSOR.path(), &mut diagnostics);
        }
        if let Value::Known(repetition_source) = &self.repetition_source {
            repetition_source.validate(&REPETITION_SOURCE.path(), &mut diagnostics);
        }
        if let Value::Known(resolvers) = &self.resolvers {
            for (index, resolver) in resolvers.iter().enumerate() {
                resolver.validate(&RESOLVERS.path().index(index), &mut diagnostics);
            }
        }

        diagnostics
    }

    /// Builds the request body. `id` and `version` stay empty; updates
    /// fill them in after the pre-write version read.
    pub fn expand(&self) -> Result<TrustFrameworkAttributeDto, Diagnostic> {
        let resolvers = self
            .resolvers
            .expand_optional(&RESOLVERS.path())?
            .map(|resolvers| {
                resolvers
                    .iter()
                    .enumerate()
                    .map(|(index, resolver)| resolver.expand(&RESOLVERS.path().index(index)))
                    .collect::<Result<Vec<_>, Diagnostic>>()
            })
            .transpose()?;

        Ok(TrustFrameworkAttributeDto {
            id: None,
            name: self.name.expand_required(&NAME.path())?.clone(),
            full_name: None,
            description: self
                .description
                .expand_optional(&DESCRIPTION.path())?
                .cloned(),
            default_value: self
                .default_value
                .expand_optional(&DEFAULT_VALUE.path())?
                .cloned(),
            managed_entity: None,
            parent: self
                .parent
                .expand_optional(&PARENT.path())?
                .map(|parent| parent.expand(&PARENT.path()))
                .transpose()?,
            processor: self
                .processor
                .expand_optional(&PROCESSOR.path())?
                .map(|processor| processor.expand(&PROCESSOR.path()))
                .transpose()?,
            repetition_source: self
                .repetition_source
                .expand_optional(&REPETITION_SOURCE.path())?
                .map(|source| source.expand(&REPETITION_SOURCE.path()))
                .transpose()?,
            resolvers,
            value_schema: self
                .value_schema
                .expand_optional(&VALUE_SCHEMA.path())?
                .cloned(),
            value_type: self
                .value_type
                .expand_required(&VALUE_TYPE.path())?
                .expand(&VALUE_TYPE.path())?,
            kind: None,
            version: None,
        })
    }

    /// Rebuilds state from a response. Resolvers keep their response
    /// order; an omitted list records as empty, matching the default.
    pub fn flatten(
        dto: TrustFrameworkAttributeDto,
        environment_id: ResourceId,
    ) -> Result<Self, Diagnostic> {
        if let Some(kind) = &dto.kind {
            check_known_token(kind, ENTITY_TYPE, &TYPE.path())?;
        }

        let resolvers = dto
            .resolvers
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(index, resolver)| Resolver::flatten(resolver, &RESOLVERS.path().index(index)))
            .collect::<Result<Vec<_>, Diagnostic>>()?;

        Ok(Self {
            id: Value::from(dto.id),
            environment_id: Value::Known(environment_id),
            default_value: Value::from(dto.default_value),
            description: Value::from(dto.description),
            full_name: Value::from(dto.full_name),
            managed_entity: Value::from(dto.managed_entity.map(ManagedEntity::flatten)),
            name: Value::Known(dto.name),
            parent: Value::from(dto.parent.map(EntityRef::flatten)),
            processor: dto
                .processor
                .map(|processor| Processor::flatten(processor, &PROCESSOR.path()))
                .transpose()?
                .into(),
            repetition_source: Value::from(dto.repetition_source.map(EntityRef::flatten)),
            resolvers: Value::Known(resolvers),
            value_schema: Value::from(dto.value_schema),
            value_type: Value::Known(ValueType::flatten(dto.value_type, &VALUE_TYPE.path())?),
            kind: Value::from(dto.kind),
            version: Value::from(dto.version),
        })
    }
}

impl ManagedEntity {
    fn flatten(dto: ManagedEntityDto) -> Self {
        Self {
            owner_service_name: Value::from(
                dto.owner
                    .and_then(|owner| owner.service)
                    .and_then(|service| service.name),
            ),
            reference: Value::from(dto.reference.map(|reference| ManagedEntityReference {
                id: Value::from(reference.id),
                kind: Value::from(reference.kind),
                name: Value::from(reference.name),
                ui_deep_link: Value::from(reference.ui_deep_link),
            })),
            restrictions: Value::from(dto.restrictions.map(|restrictions| {
                ManagedEntityRestrictions {
                    read_only: Value::from(restrictions.read_only),
                    disallow_children: Value::from(restrictions.disallow_children),
                }
            })),
        }
    }
}

/// Wire shape of an attribute definition.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustFrameworkAttributeDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ResourceId>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_entity: Option<ManagedEntityDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<EntityRefDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor: Option<ProcessorDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_source: Option<EntityRefDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolvers: Option<Vec<ResolverDto>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_schema: Option<String>,
    pub value_type: ValueTypeDto,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ManagedEntityDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<ManagedEntityOwnerDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ManagedEntityReferenceDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restrictions: Option<ManagedEntityRestrictionsDto>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ManagedEntityOwnerDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<OwningServiceDto>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OwningServiceDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedEntityReferenceDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_deep_link: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedEntityRestrictionsDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disallow_children: Option<bool>,
}

/// REST surface for attribute definitions.
#[async_trait]
pub trait TrustFrameworkAttributeClient: EnvironmentClient {
    async fn create_attribute(
        &self,
        environment_id: &ResourceId,
        body: &TrustFrameworkAttributeDto,
    ) -> Result<TrustFrameworkAttributeDto, ApiError>;

    async fn read_attribute(
        &self,
        environment_id: &ResourceId,
        attribute_id: &ResourceId,
    ) -> Result<TrustFrameworkAttributeDto, ApiError>;

    async fn update_attribute(
        &self,
        environment_id: &ResourceId,
        attribute_id: &ResourceId,
        body: &TrustFrameworkAttributeDto,
    ) -> Result<TrustFrameworkAttributeDto, ApiError>;

    async fn delete_attribute(
        &self,
        environment_id: &ResourceId,
        attribute_id: &ResourceId,
    ) -> Result<(), ApiError>;
}

pub struct TrustFrameworkAttributeReconciler<C> {
    client: C,
    retry: RetryPolicy,
    purge: RetryPolicy,
}

impl<C: TrustFrameworkAttributeClient> TrustFrameworkAttributeReconciler<C> {
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
impl<C: TrustFrameworkAttributeClient> Reconcile for TrustFrameworkAttributeReconciler<C> {
    type State = TrustFrameworkAttribute;

    async fn create(
        &self,
        ctx: &OpContext,
        desired: TrustFrameworkAttribute,
    ) -> Result<TrustFrameworkAttribute> {
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
            || self.client.create_attribute(&environment_id, &body),
        )
        .await?;

        TrustFrameworkAttribute::flatten(response, environment_id).map_err(Error::drift)
    }

    async fn read(
        &self,
        ctx: &OpContext,
        current: TrustFrameworkAttribute,
    ) -> Result<ReadOutcome<TrustFrameworkAttribute>> {
        let environment_id = require_known(&current.environment_id, "environment_id")?;
        let attribute_id = require_known(&current.id, "id")?;

        let outcome = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || self.client.read_attribute(&environment_id, &attribute_id),
        )
        .await;

        match outcome {
            Ok(response) => Ok(ReadOutcome::Current(
                TrustFrameworkAttribute::flatten(response, environment_id)
                    .map_err(Error::drift)?,
            )),
            Err(error) => recover_gone(error),
        }
    }

    async fn update(
        &self,
        ctx: &OpContext,
        desired: TrustFrameworkAttribute,
    ) -> Result<TrustFrameworkAttribute> {
        let desired = desired.with_defaults();
        ensure_valid(desired.validate())?;

        let environment_id = require_known(&desired.environment_id, "environment_id")?;
        let attribute_id = require_known(&desired.id, "id")?;

        let current = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || self.client.read_attribute(&environment_id, &attribute_id),
        )
        .await?;

        let mut body = desired.expand().map_err(Error::invalid)?;
        body.id = Some(attribute_id.clone());
        body.version = current.version;

        let response = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::no_retry,
            || self.client.update_attribute(&environment_id, &attribute_id, &body),
        )
        .await?;

        TrustFrameworkAttribute::flatten(response, environment_id).map_err(Error::drift)
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        current: TrustFrameworkAttribute,
    ) -> Result<Diagnostics> {
        let environment_id = require_known(&current.environment_id, "environment_id")?;
        let attribute_id = require_known(&current.id, "id")?;

        delete_and_purge(
            &self.client,
            ctx,
            &self.retry,
            &self.purge,
            &environment_id,
            || self.client.delete_attribute(&environment_id, &attribute_id),
            || async {
                self.client
                    .read_attribute(&environment_id, &attribute_id)
                    .await
                    .map(|_| ())
            },
        )
        .await
    }

    fn import(&self, id: &str) -> Result<TrustFrameworkAttribute> {
        let parsed = import::parse(id, &IMPORT_COMPONENTS).context(ImportSnafu)?;
        Ok(TrustFrameworkAttribute {
            id: Value::Known(
                parsed
                    .require_resource_id("trust_framework_attribute_id")
                    .context(ImportSnafu)?,
            ),
            environment_id: Value::Known(
                parsed
                    .require_resource_id("environment_id")
                    .context(ImportSnafu)?,
            ),
            ..TrustFrameworkAttribute::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::expr::ValueTypeKind;

    fn resource_id(tail: u32) -> ResourceId {
        format!("00000000-0000-4000-8000-{tail:012}").parse().unwrap()
    }

    fn definition() -> TrustFrameworkAttribute {
        TrustFrameworkAttribute {
            environment_id: Value::Known(resource_id(1)),
            name: Value::Known("Employment.Current status".to_owned()),
            value_type: Value::Known(ValueType::of(ValueTypeKind::String)),
            ..TrustFrameworkAttribute::default()
        }
    }

    #[test]
    fn minimal_configuration_is_valid() {
        assert!(!definition().validate().has_errors());
    }

    #[test]
    fn the_value_type_is_required() {
        let mut definition = definition();
        definition.value_type = Value::Null;

        let diagnostics = definition.validate();

        assert!(
            diagnostics
                .iter()
                .any(|diagnostic| diagnostic.detail().contains("value_type must be configured"))
        );
    }

    #[test]
    fn null_resolvers_default_to_an_empty_list() {
        let definition = definition().with_defaults();

        assert_eq!(definition.resolvers, Value::Known(Vec::new()));
    }

    #[test]
    fn expand_keeps_resolvers_in_declared_order() {
        let mut definition = definition();
        definition.default_value = Value::Known("unknown".to_owned());
        definition.resolvers = Value::Known(vec![
            Resolver::attribute(EntityRef::to(resource_id(7))),
            Resolver::constant("unknown", ValueTypeKind::String),
        ]);

        let body = definition.expand().unwrap();

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "name": "Employment.Current status",
                "defaultValue": "unknown",
                "resolvers": [
                    {"type": "ATTRIBUTE", "valueRef": {"id": "00000000-0000-4000-8000-000000000007"}},
                    {"type": "CONSTANT", "value": "unknown", "valueType": {"type": "STRING"}},
                ],
                "valueType": {"type": "STRING"},
            })
        );
    }

    #[test]
    fn flatten_records_the_managed_entity_marker() {
        let response = json!({
            "id": "00000000-0000-4000-8000-000000000009",
            "name": "Directory.Population",
            "fullName": "Directory.Population",
            "type": "ATTRIBUTE",
            "version": "4",
            "valueType": {"type": "STRING"},
            "managedEntity": {
                "owner": {"service": {"name": "PingOne Directory"}},
                "reference": {
                    "id": "pingone-population",
                    "type": "ATTRIBUTE",
                    "name": "Population",
                    "uiDeepLink": "https://console.pingone.example/population",
                },
                "restrictions": {"readOnly": true, "disallowChildren": true},
            },
        });
        let dto: TrustFrameworkAttributeDto = serde_json::from_value(response).unwrap();

        let state = TrustFrameworkAttribute::flatten(dto, resource_id(1)).unwrap();

        let Value::Known(managed) = state.managed_entity else {
            panic!("expected a managed entity marker");
        };
        assert_eq!(
            managed.owner_service_name,
            Value::Known("PingOne Directory".to_owned())
        );
        let Value::Known(restrictions) = managed.restrictions else {
            panic!("expected restrictions");
        };
        assert_eq!(restrictions.read_only, Value::Known(true));
        assert_eq!(state.resolvers, Value::Known(Vec::new()));
        assert_eq!(state.full_name, Value::Known("Directory.Population".to_owned()));
    }

    #[test]
    fn flatten_keeps_the_response_resolver_order() {
        let response = json!({
            "name": "Employment.Current status",
            "valueType": {"type": "STRING"},
            "resolvers": [
                {"type": "CONSTANT", "value": "b", "valueType": {"type": "STRING"}},
                {"type": "CONSTANT", "value": "a", "valueType": {"type": "STRING"}},
            ],
        });
        let dto: TrustFrameworkAttributeDto = serde_json::from_value(response).unwrap();

        let state = TrustFrameworkAttribute::flatten(dto, resource_id(1)).unwrap();

        let Value::Known(resolvers) = state.resolvers else {
            panic!("expected resolvers");
        };
        let values: Vec<_> = resolvers
            .iter()
            .map(|resolver| match &resolver.kind {
                crate::expr::ResolverKind::Constant { value, .. } => value.clone(),
                other => panic!("unexpected resolver {other:?}"),
            })
            .collect();
        assert_eq!(
            values,
            [Value::Known("b".to_owned()), Value::Known("a".to_owned())]
        );
    }

    #[test]
    fn flatten_rejects_other_entity_types() {
        let response = json!({
            "name": "Employment.Current status",
            "type": "CONDITION",
            "valueType": {"type": "STRING"},
        });
        let dto: TrustFrameworkAttributeDto = serde_json::from_value(response).unwrap();

        let diagnostic = TrustFrameworkAttribute::flatten(dto, resource_id(1)).unwrap_err();

        assert_eq!(diagnostic.summary(), "Unrecognized value from service");
    }
}
