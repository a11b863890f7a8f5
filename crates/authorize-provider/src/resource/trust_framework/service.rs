//! Service definitions in the trust-framework editor.
//!
//! A service is an outbound callout the decision engine can invoke
//! while resolving attributes. Its `service_type` selects one of three
//! shapes: `NONE` is a bare grouping node, `HTTP` calls a REST endpoint
//! and `CONNECTOR` invokes a built-in integration. The settings object
//! is shared between the two concrete shapes, so most of its fields are
//! conditionally required on `service_type`.

use async_trait::async_trait;
use snafu::ResultExt;
use strum::VariantNames;

use crate::{
    diagnostic::{Diagnostic, Diagnostics},
    expr::{
        EntityRef, EntityRefDto, Processor, ProcessorDto, ValueType, ValueTypeDto,
        check_known_token, missing, one_of_error,
    },
    id::{RESOURCE_ID_FMT, ResourceId},
    import::{self, ImportComponent},
    path::AttributePath,
    resource::{
        Error, ImportSnafu, OpContext, ReadOutcome, Reconcile, Result, call, ensure_valid,
        recover_gone, require_known,
        trust_framework::{PURGE_POLICY, delete_and_purge},
    },
    schema::{AttributeSchema, Constraint, KindSchema, conflict_when, require_when},
    transport::{self, ApiError, EnvironmentClient, RetryPolicy},
    value::Value,
};

const MIN_CONCURRENT_REQUESTS: i32 = 1;
const MIN_REQUESTS_PER_SECOND: f64 = 0.1;
const MAX_TIMEOUT_MILLISECONDS: i32 = 3000;

const ID: AttributeSchema = AttributeSchema::computed("id");
const ENVIRONMENT_ID: AttributeSchema =
    AttributeSchema::required("environment_id").requires_replace();
const CACHE_SETTINGS: AttributeSchema = AttributeSchema::optional("cache_settings");
const DESCRIPTION: AttributeSchema = AttributeSchema::required("description");
const FULL_NAME: AttributeSchema = AttributeSchema::computed("full_name");
const NAME: AttributeSchema =
    AttributeSchema::required("name").constrained(&[Constraint::LengthAtLeast(1)]);
const PARENT: AttributeSchema = AttributeSchema::optional("parent");
const PROCESSOR: AttributeSchema = AttributeSchema::optional("processor");
const SERVICE_SETTINGS: AttributeSchema = AttributeSchema::optional("service_settings");
const SERVICE_TYPE: AttributeSchema = AttributeSchema::required("service_type")
    .constrained(&[Constraint::OneOf(ServiceType::VARIANTS)]);
const TYPE: AttributeSchema = AttributeSchema::computed("type");
const VALUE_TYPE: AttributeSchema = AttributeSchema::optional("value_type");
const VERSION: AttributeSchema = AttributeSchema::computed("version");

const SETTINGS_MAXIMUM_CONCURRENT_REQUESTS: AttributeSchema =
    AttributeSchema::required("service_settings.maximum_concurrent_requests");
const SETTINGS_MAXIMUM_REQUESTS_PER_SECOND: AttributeSchema =
    AttributeSchema::required("service_settings.maximum_requests_per_second");
const SETTINGS_TIMEOUT_MILLISECONDS: AttributeSchema =
    AttributeSchema::required("service_settings.timeout_milliseconds");
const SETTINGS_URL: AttributeSchema = AttributeSchema::optional("service_settings.url");
const SETTINGS_VERB: AttributeSchema = AttributeSchema::optional("service_settings.verb")
    .constrained(&[Constraint::OneOf(HttpVerb::VARIANTS)]);
const SETTINGS_BODY: AttributeSchema = AttributeSchema::optional("service_settings.body");
const SETTINGS_CONTENT_TYPE: AttributeSchema =
    AttributeSchema::optional("service_settings.content_type");
const SETTINGS_TLS_SETTINGS: AttributeSchema =
    AttributeSchema::optional("service_settings.tls_settings");
const SETTINGS_TLS_VALIDATION_TYPE: AttributeSchema =
    AttributeSchema::required("service_settings.tls_settings.tls_validation_type")
        .constrained(&[Constraint::OneOf(TlsValidationType::VARIANTS)]);
const SETTINGS_CHANNEL: AttributeSchema = AttributeSchema::optional("service_settings.channel")
    .constrained(&[Constraint::OneOf(ConnectorChannel::VARIANTS)]);
const SETTINGS_CODE: AttributeSchema = AttributeSchema::optional("service_settings.code")
    .constrained(&[Constraint::OneOf(ConnectorCode::VARIANTS)]);
const SETTINGS_CAPABILITY: AttributeSchema =
    AttributeSchema::optional("service_settings.capability");
const SETTINGS_SCHEMA_VERSION: AttributeSchema =
    AttributeSchema::optional("service_settings.schema_version");
const SETTINGS_INPUT_MAPPINGS: AttributeSchema =
    AttributeSchema::optional("service_settings.input_mappings");

const ENTITY_TYPE: &[&str] = &["SERVICE"];

pub const SCHEMA: KindSchema = KindSchema {
    kind: "trust_framework_service",
    attributes: &[
        ID,
        ENVIRONMENT_ID,
        CACHE_SETTINGS,
        DESCRIPTION,
        FULL_NAME,
        NAME,
        PARENT,
        PROCESSOR,
        SERVICE_SETTINGS,
        SETTINGS_MAXIMUM_CONCURRENT_REQUESTS,
        SETTINGS_MAXIMUM_REQUESTS_PER_SECOND,
        SETTINGS_TIMEOUT_MILLISECONDS,
        SETTINGS_URL,
        SETTINGS_VERB,
        SETTINGS_BODY,
        SETTINGS_CONTENT_TYPE,
        SETTINGS_TLS_SETTINGS,
        SETTINGS_TLS_VALIDATION_TYPE,
        SETTINGS_CHANNEL,
        SETTINGS_CODE,
        SETTINGS_CAPABILITY,
        SETTINGS_SCHEMA_VERSION,
        SETTINGS_INPUT_MAPPINGS,
        SERVICE_TYPE,
        TYPE,
        VALUE_TYPE,
        VERSION,
    ],
};

static IMPORT_COMPONENTS: [ImportComponent; 2] = [
    ImportComponent::new("environment_id", RESOURCE_ID_FMT),
    ImportComponent::new("trust_framework_service_id", RESOURCE_ID_FMT).primary(),
];

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
pub enum ServiceType {
    None,
    Http,
    Connector,
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
pub enum HttpVerb {
    Get,
    Post,
    Put,
    Delete,
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
pub enum TlsValidationType {
    Default,
    None,
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
pub enum ConnectorChannel {
    Authorize,
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
pub enum ConnectorCode {
    P1Risk,
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
pub enum InputMappingKind {
    Attribute,
    Input,
}

/// Declared and recorded state of one service definition.
///
/// `maximum_requests_per_second` is a float, so this tree compares with
/// `PartialEq` only.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrustFrameworkService {
    pub id: Value<ResourceId>,
    pub environment_id: Value<ResourceId>,
    pub cache_settings: Value<CacheSettings>,
    pub description: Value<String>,
    pub full_name: Value<String>,
    pub name: Value<String>,
    pub parent: Value<EntityRef>,
    pub processor: Value<Processor>,
    pub service_settings: Value<ServiceSettings>,
    pub service_type: Value<String>,
    pub value_type: Value<ValueType>,
    pub kind: Value<String>,
    pub version: Value<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheSettings {
    pub ttl_seconds: Value<i32>,
}

/// Settings shared by the `HTTP` and `CONNECTOR` shapes. The capacity
/// trio applies to both; the rest belongs to exactly one shape.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceSettings {
    pub maximum_concurrent_requests: Value<i32>,
    pub maximum_requests_per_second: Value<f64>,
    pub timeout_milliseconds: Value<i32>,

    pub url: Value<String>,
    pub verb: Value<String>,
    pub body: Value<String>,
    pub content_type: Value<String>,
    pub tls_settings: Value<TlsSettings>,

    pub channel: Value<String>,
    pub code: Value<String>,
    pub capability: Value<String>,
    pub schema_version: Value<i32>,
    pub input_mappings: Value<Vec<InputMapping>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsSettings {
    pub tls_validation_type: Value<String>,
}

/// One input the connector receives, fed from an attribute or a literal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InputMapping {
    pub property: Value<String>,
    pub kind: Value<String>,
    pub value_ref: Value<EntityRef>,
    pub value: Value<String>,
}

impl InputMapping {
    pub fn attribute(property: impl Into<String>, value_ref: EntityRef) -> Self {
        Self {
            property: Value::Known(property.into()),
            kind: Value::Known(InputMappingKind::Attribute.to_string()),
            value_ref: Value::Known(value_ref),
            value: Value::Null,
        }
    }

    pub fn input(property: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            property: Value::Known(property.into()),
            kind: Value::Known(InputMappingKind::Input.to_string()),
            value_ref: Value::Null,
            value: Value::Known(value.into()),
        }
    }

    fn validate(&self, path: &AttributePath, diagnostics: &mut Diagnostics) {
        if self.property.is_null() {
            diagnostics.push(missing(&path.clone().attribute("property")));
        }

        let kind_path = path.clone().attribute("type");
        if self.kind.is_null() {
            diagnostics.push(missing(&kind_path));
        }
        let Value::Known(kind) = &self.kind else {
            return;
        };
        if !InputMappingKind::VARIANTS.contains(&kind.as_str()) {
            diagnostics.push(one_of_error(&kind_path, kind, InputMappingKind::VARIANTS));
            return;
        }

        let attribute_token = InputMappingKind::Attribute.as_ref();
        let input_token = InputMappingKind::Input.as_ref();
        let ref_path = path.clone().attribute("value_ref");
        let value_path = path.clone().attribute("value");

        if kind == attribute_token {
            if self.value_ref.is_null() {
                diagnostics.push(Diagnostic::attribute_error(
                    ref_path.clone(),
                    "Missing required attribute",
                    format!("{ref_path} must be configured when {kind_path} is {attribute_token:?}"),
                ));
            }
            if !self.value.is_null() {
                diagnostics.push(Diagnostic::attribute_error(
                    value_path.clone(),
                    "Invalid combination of arguments",
                    format!(
                        "{value_path} must not be configured when {kind_path} is {attribute_token:?}"
                    ),
                ));
            }
        } else {
            if self.value.is_null() {
                diagnostics.push(Diagnostic::attribute_error(
                    value_path.clone(),
                    "Missing required attribute",
                    format!("{value_path} must be configured when {kind_path} is {input_token:?}"),
                ));
            }
            if !self.value_ref.is_null() {
                diagnostics.push(Diagnostic::attribute_error(
                    ref_path.clone(),
                    "Invalid combination of arguments",
                    format!(
                        "{ref_path} must not be configured when {kind_path} is {input_token:?}"
                    ),
                ));
            }
        }

        if let Value::Known(value_ref) = &self.value_ref {
            value_ref.validate(&ref_path, diagnostics);
        }
    }

    fn expand(&self, path: &AttributePath) -> Result<InputMappingDto, Diagnostic> {
        let property = self
            .property
            .expand_required(&path.clone().attribute("property"))?
            .clone();
        let kind_path = path.clone().attribute("type");
        let kind = self.kind.expand_required(&kind_path)?;

        if kind == InputMappingKind::Attribute.as_ref() {
            let ref_path = path.clone().attribute("value_ref");
            Ok(InputMappingDto::Attribute {
                property,
                value_ref: self
                    .value_ref
                    .expand_required(&ref_path)?
                    .expand(&ref_path)?,
            })
        } else {
            Ok(InputMappingDto::Input {
                property,
                value: self
                    .value
                    .expand_required(&path.clone().attribute("value"))?
                    .clone(),
            })
        }
    }

    fn flatten(dto: InputMappingDto) -> Self {
        match dto {
            InputMappingDto::Attribute {
                property,
                value_ref,
            } => Self::attribute(property, EntityRef::flatten(value_ref)),
            InputMappingDto::Input { property, value } => Self::input(property, value),
        }
    }
}

impl TrustFrameworkService {
    pub fn validate(&self) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();

        NAME.check_string(&self.name, &mut diagnostics);
        DESCRIPTION.check_presence(&self.description, &mut diagnostics);
        SERVICE_TYPE.check_string(&self.service_type, &mut diagnostics);

        let service_type = self.service_type.as_known().map(String::as_str);
        let none_token = ServiceType::None.as_ref();
        let http_token = ServiceType::Http.as_ref();
        let connector_token = ServiceType::Connector.as_ref();

        let value_type_set = !self.value_type.is_null();
        require_when(
            &VALUE_TYPE,
            value_type_set,
            &SERVICE_TYPE,
            http_token,
            service_type,
            &mut diagnostics,
        );
        require_when(
            &VALUE_TYPE,
            value_type_set,
            &SERVICE_TYPE,
            connector_token,
            service_type,
            &mut diagnostics,
        );
        conflict_when(
            &VALUE_TYPE,
            value_type_set,
            &SERVICE_TYPE,
            none_token,
            service_type,
            &mut diagnostics,
        );
        if let Value::Known(value_type) = &self.value_type {
            value_type.validate(&VALUE_TYPE.path(), &mut diagnostics);
        }

        let settings_set = !self.service_settings.is_null();
        require_when(
            &SERVICE_SETTINGS,
            settings_set,
            &SERVICE_TYPE,
            http_token,
            service_type,
            &mut diagnostics,
        );
        require_when(
            &SERVICE_SETTINGS,
            settings_set,
            &SERVICE_TYPE,
            connector_token,
            service_type,
            &mut diagnostics,
        );
        conflict_when(
            &SERVICE_SETTINGS,
            settings_set,
            &SERVICE_TYPE,
            none_token,
            service_type,
            &mut diagnostics,
        );

        conflict_when(
            &PROCESSOR,
            !self.processor.is_null(),
            &SERVICE_TYPE,
            none_token,
            service_type,
            &mut diagnostics,
        );
        if let Value::Known(processor) = &self.processor {
            processor.validate(&PROCESSOR.path(), &mut diagnostics);
        }

        if let Value::Known(parent) = &self.parent {
            parent.validate(&PARENT.path(), &mut diagnostics);
        }

        if let Value::Known(settings) = &self.service_settings {
            settings.validate(service_type, &mut diagnostics);
        }

        diagnostics
    }

    /// Builds the request body. `id` and `version` stay empty; updates
    /// fill them in after the pre-write version read.
    pub fn expand(&self) -> Result<TrustFrameworkServiceDto, Diagnostic> {
        Ok(TrustFrameworkServiceDto {
            id: None,
            name: self.name.expand_required(&NAME.path())?.clone(),
            full_name: None,
            description: self
                .description
                .expand_required(&DESCRIPTION.path())?
                .clone(),
            parent: self
                .parent
                .expand_optional(&PARENT.path())?
                .map(|parent| parent.expand(&PARENT.path()))
                .transpose()?,
            kind: None,
            cache_settings: self
                .cache_settings
                .expand_optional(&CACHE_SETTINGS.path())?
                .map(CacheSettings::expand)
                .transpose()?,
            service_type: self
                .service_type
                .expand_required(&SERVICE_TYPE.path())?
                .clone(),
            processor: self
                .processor
                .expand_optional(&PROCESSOR.path())?
                .map(|processor| processor.expand(&PROCESSOR.path()))
                .transpose()?,
            value_type: self
                .value_type
                .expand_optional(&VALUE_TYPE.path())?
                .map(|value_type| value_type.expand(&VALUE_TYPE.path()))
                .transpose()?,
            service_settings: self
                .service_settings
                .expand_optional(&SERVICE_SETTINGS.path())?
                .map(ServiceSettings::expand)
                .transpose()?,
            version: None,
        })
    }

    pub fn flatten(
        dto: TrustFrameworkServiceDto,
        environment_id: ResourceId,
    ) -> Result<Self, Diagnostic> {
        if let Some(kind) = &dto.kind {
            check_known_token(kind, ENTITY_TYPE, &TYPE.path())?;
        }
        check_known_token(&dto.service_type, ServiceType::VARIANTS, &SERVICE_TYPE.path())?;

        Ok(Self {
            id: Value::from(dto.id),
            environment_id: Value::Known(environment_id),
            cache_settings: Value::from(dto.cache_settings.map(CacheSettings::flatten)),
            description: Value::from(dto.description),
            full_name: Value::from(dto.full_name),
            name: Value::Known(dto.name),
            parent: Value::from(dto.parent.map(EntityRef::flatten)),
            processor: dto
                .processor
                .map(|processor| Processor::flatten(processor, &PROCESSOR.path()))
                .transpose()?
                .into(),
            service_settings: dto
                .service_settings
                .map(ServiceSettings::flatten)
                .transpose()?
                .into(),
            service_type: Value::Known(dto.service_type),
            value_type: dto
                .value_type
                .map(|value_type| ValueType::flatten(value_type, &VALUE_TYPE.path()))
                .transpose()?
                .into(),
            kind: Value::from(dto.kind),
            version: Value::from(dto.version),
        })
    }
}

impl CacheSettings {
    pub fn ttl(seconds: i32) -> Self {
        Self {
            ttl_seconds: Value::Known(seconds),
        }
    }

    fn expand(&self) -> Result<CacheSettingsDto, Diagnostic> {
        Ok(CacheSettingsDto {
            ttl_seconds: self
                .ttl_seconds
                .expand_optional(&CACHE_SETTINGS.path().attribute("ttl_seconds"))?
                .copied(),
        })
    }

    fn flatten(dto: CacheSettingsDto) -> Self {
        Self {
            ttl_seconds: Value::from(dto.ttl_seconds),
        }
    }
}

impl ServiceSettings {
    fn validate(&self, service_type: Option<&str>, diagnostics: &mut Diagnostics) {
        let http_token = ServiceType::Http.as_ref();
        let connector_token = ServiceType::Connector.as_ref();

        SETTINGS_MAXIMUM_CONCURRENT_REQUESTS
            .check_presence(&self.maximum_concurrent_requests, diagnostics);
        if let Value::Known(limit) = &self.maximum_concurrent_requests {
            if *limit < MIN_CONCURRENT_REQUESTS {
                diagnostics.push(Diagnostic::attribute_error(
                    SETTINGS_MAXIMUM_CONCURRENT_REQUESTS.path(),
                    "Invalid attribute value",
                    format!(
                        "{} must be at least {MIN_CONCURRENT_REQUESTS}, got {limit}",
                        SETTINGS_MAXIMUM_CONCURRENT_REQUESTS.path()
                    ),
                ));
            }
        }

        SETTINGS_MAXIMUM_REQUESTS_PER_SECOND
            .check_presence(&self.maximum_requests_per_second, diagnostics);
        if let Value::Known(rate) = &self.maximum_requests_per_second {
            if *rate < MIN_REQUESTS_PER_SECOND {
                diagnostics.push(Diagnostic::attribute_error(
                    SETTINGS_MAXIMUM_REQUESTS_PER_SECOND.path(),
                    "Invalid attribute value",
                    format!(
                        "{} must be at least {MIN_REQUESTS_PER_SECOND}, got {rate}",
                        SETTINGS_MAXIMUM_REQUESTS_PER_SECOND.path()
                    ),
                ));
            }
        }

        SETTINGS_TIMEOUT_MILLISECONDS.check_presence(&self.timeout_milliseconds, diagnostics);
        if let Value::Known(timeout) = &self.timeout_milliseconds {
            if !(0..=MAX_TIMEOUT_MILLISECONDS).contains(timeout) {
                diagnostics.push(Diagnostic::attribute_error(
                    SETTINGS_TIMEOUT_MILLISECONDS.path(),
                    "Invalid attribute value",
                    format!(
                        "{} must be between 0 and {MAX_TIMEOUT_MILLISECONDS}, got {timeout}",
                        SETTINGS_TIMEOUT_MILLISECONDS.path()
                    ),
                ));
            }
        }

        for (schema, set) in [
            (&SETTINGS_URL, !self.url.is_null()),
            (&SETTINGS_VERB, !self.verb.is_null()),
            (&SETTINGS_TLS_SETTINGS, !self.tls_settings.is_null()),
        ] {
            require_when(schema, set, &SERVICE_TYPE, http_token, service_type, diagnostics);
            conflict_when(
                schema,
                set,
                &SERVICE_TYPE,
                connector_token,
                service_type,
                diagnostics,
            );
        }
        for (schema, set) in [
            (&SETTINGS_BODY, !self.body.is_null()),
            (&SETTINGS_CONTENT_TYPE, !self.content_type.is_null()),
        ] {
            conflict_when(
                schema,
                set,
                &SERVICE_TYPE,
                connector_token,
                service_type,
                diagnostics,
            );
        }
        for (schema, set) in [
            (&SETTINGS_CHANNEL, !self.channel.is_null()),
            (&SETTINGS_CODE, !self.code.is_null()),
            (&SETTINGS_CAPABILITY, !self.capability.is_null()),
            (&SETTINGS_INPUT_MAPPINGS, !self.input_mappings.is_null()),
        ] {
            require_when(
                schema,
                set,
                &SERVICE_TYPE,
                connector_token,
                service_type,
                diagnostics,
            );
            conflict_when(schema, set, &SERVICE_TYPE, http_token, service_type, diagnostics);
        }
        conflict_when(
            &SETTINGS_SCHEMA_VERSION,
            !self.schema_version.is_null(),
            &SERVICE_TYPE,
            http_token,
            service_type,
            diagnostics,
        );

        SETTINGS_VERB.check_string(&self.verb, diagnostics);
        SETTINGS_CHANNEL.check_string(&self.channel, diagnostics);
        SETTINGS_CODE.check_string(&self.code, diagnostics);

        if let Value::Known(tls) = &self.tls_settings {
            SETTINGS_TLS_VALIDATION_TYPE.check_string(&tls.tls_validation_type, diagnostics);
        }

        if let Value::Known(mappings) = &self.input_mappings {
            for (index, mapping) in mappings.iter().enumerate() {
                mapping.validate(&SETTINGS_INPUT_MAPPINGS.path().index(index), diagnostics);
            }
        }
    }

    fn expand(&self) -> Result<ServiceSettingsDto, Diagnostic> {
        let input_mappings = self
            .input_mappings
            .expand_optional(&SETTINGS_INPUT_MAPPINGS.path())?
            .map(|mappings| {
                mappings
                    .iter()
                    .enumerate()
                    .map(|(index, mapping)| {
                        mapping.expand(&SETTINGS_INPUT_MAPPINGS.path().index(index))
                    })
                    .collect::<Result<Vec<_>, Diagnostic>>()
            })
            .transpose()?;

        Ok(ServiceSettingsDto {
            maximum_concurrent_requests: *self
                .maximum_concurrent_requests
                .expand_required(&SETTINGS_MAXIMUM_CONCURRENT_REQUESTS.path())?,
            maximum_requests_per_second: *self
                .maximum_requests_per_second
                .expand_required(&SETTINGS_MAXIMUM_REQUESTS_PER_SECOND.path())?,
            timeout_milliseconds: *self
                .timeout_milliseconds
                .expand_required(&SETTINGS_TIMEOUT_MILLISECONDS.path())?,
            url: self.url.expand_optional(&SETTINGS_URL.path())?.cloned(),
            verb: self.verb.expand_optional(&SETTINGS_VERB.path())?.cloned(),
            body: self.body.expand_optional(&SETTINGS_BODY.path())?.cloned(),
            content_type: self
                .content_type
                .expand_optional(&SETTINGS_CONTENT_TYPE.path())?
                .cloned(),
            tls_settings: self
                .tls_settings
                .expand_optional(&SETTINGS_TLS_SETTINGS.path())?
                .map(|tls| {
                    Ok::<_, Diagnostic>(TlsSettingsDto {
                        tls_validation_type: tls
                            .tls_validation_type
                            .expand_required(&SETTINGS_TLS_VALIDATION_TYPE.path())?
                            .clone(),
                    })
                })
                .transpose()?,
            channel: self
                .channel
                .expand_optional(&SETTINGS_CHANNEL.path())?
                .cloned(),
            code: self.code.expand_optional(&SETTINGS_CODE.path())?.cloned(),
            capability: self
                .capability
                .expand_optional(&SETTINGS_CAPABILITY.path())?
                .cloned(),
            schema_version: self
                .schema_version
                .expand_optional(&SETTINGS_SCHEMA_VERSION.path())?
                .copied(),
            input_mappings,
        })
    }

    fn flatten(dto: ServiceSettingsDto) -> Result<Self, Diagnostic> {
        if let Some(verb) = &dto.verb {
            check_known_token(verb, HttpVerb::VARIANTS, &SETTINGS_VERB.path())?;
        }
        if let Some(channel) = &dto.channel {
            check_known_token(channel, ConnectorChannel::VARIANTS, &SETTINGS_CHANNEL.path())?;
        }
        if let Some(code) = &dto.code {
            check_known_token(code, ConnectorCode::VARIANTS, &SETTINGS_CODE.path())?;
        }
        let tls_settings = dto
            .tls_settings
            .map(|tls| {
                check_known_token(
                    &tls.tls_validation_type,
                    TlsValidationType::VARIANTS,
                    &SETTINGS_TLS_VALIDATION_TYPE.path(),
                )?;
                Ok::<_, Diagnostic>(TlsSettings {
                    tls_validation_type: Value::Known(tls.tls_validation_type),
                })
            })
            .transpose()?;

        Ok(Self {
            maximum_concurrent_requests: Value::Known(dto.maximum_concurrent_requests),
            maximum_requests_per_second: Value::Known(dto.maximum_requests_per_second),
            timeout_milliseconds: Value::Known(dto.timeout_milliseconds),
            url: Value::from(dto.url),
            verb: Value::from(dto.verb),
            body: Value::from(dto.body),
            content_type: Value::from(dto.content_type),
            tls_settings: Value::from(tls_settings),
            channel: Value::from(dto.channel),
            code: Value::from(dto.code),
            capability: Value::from(dto.capability),
            schema_version: Value::from(dto.schema_version),
            input_mappings: Value::from(
                dto.input_mappings
                    .map(|mappings| mappings.into_iter().map(InputMapping::flatten).collect()),
            ),
        })
    }
}

/// Wire shape of a service definition. The server discriminates on
/// `serviceType`; the shape-specific fields travel flat beside the
/// common ones.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustFrameworkServiceDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ResourceId>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<EntityRefDto>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_settings: Option<CacheSettingsDto>,
    pub service_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor: Option<ProcessorDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<ValueTypeDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_settings: Option<ServiceSettingsDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSettingsDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSettingsDto {
    pub maximum_concurrent_requests: i32,
    pub maximum_requests_per_second: f64,
    pub timeout_milliseconds: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettingsDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_mappings: Option<Vec<InputMappingDto>>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettingsDto {
    pub tls_validation_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum InputMappingDto {
    #[serde(rename = "ATTRIBUTE")]
    Attribute {
        property: String,
        #[serde(rename = "valueRef")]
        value_ref: EntityRefDto,
    },

    #[serde(rename = "INPUT")]
    Input { property: String, value: String },
}

/// REST surface for service definitions.
#[async_trait]
pub trait TrustFrameworkServiceClient: EnvironmentClient {
    async fn create_service(
        &self,
        environment_id: &ResourceId,
        body: &TrustFrameworkServiceDto,
    ) -> Result<TrustFrameworkServiceDto, ApiError>;

    async fn read_service(
        &self,
        environment_id: &ResourceId,
        service_id: &ResourceId,
    ) -> Result<TrustFrameworkServiceDto, ApiError>;

    async fn update_service(
        &self,
        environment_id: &ResourceId,
        service_id: &ResourceId,
        body: &TrustFrameworkServiceDto,
    ) -> Result<TrustFrameworkServiceDto, ApiError>;

    async fn delete_service(
        &self,
        environment_id: &ResourceId,
        service_id: &ResourceId,
    ) -> Result<(), ApiError>;
}

pub struct TrustFrameworkServiceReconciler<C> {
    client: C,
    retry: RetryPolicy,
    purge: RetryPolicy,
}

impl<C: TrustFrameworkServiceClient> TrustFrameworkServiceReconciler<C> {
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
impl<C: TrustFrameworkServiceClient> Reconcile for TrustFrameworkServiceReconciler<C> {
    type State = TrustFrameworkService;

    async fn create(
        &self,
        ctx: &OpContext,
        desired: TrustFrameworkService,
    ) -> Result<TrustFrameworkService> {
        ensure_valid(desired.validate())?;

        let environment_id = require_known(&desired.environment_id, "environment_id")?;
        let body = desired.expand().map_err(Error::invalid)?;

        let response = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || self.client.create_service(&environment_id, &body),
        )
        .await?;

        TrustFrameworkService::flatten(response, environment_id).map_err(Error::drift)
    }

    async fn read(
        &self,
        ctx: &OpContext,
        current: TrustFrameworkService,
    ) -> Result<ReadOutcome<TrustFrameworkService>> {
        let environment_id = require_known(&current.environment_id, "environment_id")?;
        let service_id = require_known(&current.id, "id")?;

        let outcome = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || self.client.read_service(&environment_id, &service_id),
        )
        .await;

        match outcome {
            Ok(response) => Ok(ReadOutcome::Current(
                TrustFrameworkService::flatten(response, environment_id)
                    .map_err(Error::drift)?,
            )),
            Err(error) => recover_gone(error),
        }
    }

    async fn update(
        &self,
        ctx: &OpContext,
        desired: TrustFrameworkService,
    ) -> Result<TrustFrameworkService> {
        ensure_valid(desired.validate())?;

        let environment_id = require_known(&desired.environment_id, "environment_id")?;
        let service_id = require_known(&desired.id, "id")?;

        let current = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || self.client.read_service(&environment_id, &service_id),
        )
        .await?;

        let mut body = desired.expand().map_err(Error::invalid)?;
        body.id = Some(service_id.clone());
        body.version = current.version;

        let response = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::no_retry,
            || self.client.update_service(&environment_id, &service_id, &body),
        )
        .await?;

        TrustFrameworkService::flatten(response, environment_id).map_err(Error::drift)
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        current: TrustFrameworkService,
    ) -> Result<Diagnostics> {
        let environment_id = require_known(&current.environment_id, "environment_id")?;
        let service_id = require_known(&current.id, "id")?;

        delete_and_purge(
            &self.client,
            ctx,
            &self.retry,
            &self.purge,
            &environment_id,
            || self.client.delete_service(&environment_id, &service_id),
            || async {
                self.client
                    .read_service(&environment_id, &service_id)
                    .await
                    .map(|_| ())
            },
        )
        .await
    }

    fn import(&self, id: &str) -> Result<TrustFrameworkService> {
        let parsed = import::parse(id, &IMPORT_COMPONENTS).context(ImportSnafu)?;
        Ok(TrustFrameworkService {
            id: Value::Known(
                parsed
                    .require_resource_id("trust_framework_service_id")
                    .context(ImportSnafu)?,
            ),
            environment_id: Value::Known(
                parsed
                    .require_resource_id("environment_id")
                    .context(ImportSnafu)?,
            ),
            ..TrustFrameworkService::default()
        })
    }
}
