//! The API service resource: registers a customer API with the
//! authorization engine.
//!
//! `access_control` and `directory` carry server-side defaults that are
//! injected before validation so cross-field checks see the effective
//! configuration. `authorization_server.type` and `directory.type` both
//! decide who issues access tokens and must agree.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use snafu::ResultExt;
use strum::VariantNames;
use url::Url;

use crate::{
    diagnostic::{Diagnostic, Diagnostics},
    expr::{EntityRefDto, check_known_token},
    id::{RESOURCE_ID_FMT, ResourceId},
    import::{self, ImportComponent},
    path::AttributePath,
    resource::{
        Error, ImportSnafu, OpContext, ReadOutcome, Reconcile, Result, call, ensure_valid,
        recover_deleted, recover_gone, require_known,
    },
    schema::{AttributeSchema, Constraint, KindSchema, conflict_when, require_when},
    transport::{self, ApiError, EnvironmentClient, RetryPolicy},
    value::Value,
};

const BASE_URL_MAX_LENGTH: usize = 256;

const ID: AttributeSchema = AttributeSchema::computed("id");
const ENVIRONMENT_ID: AttributeSchema =
    AttributeSchema::required("environment_id").requires_replace();
const ACCESS_CONTROL: AttributeSchema = AttributeSchema::optional_computed("access_control");
const ACCESS_CONTROL_CUSTOM: AttributeSchema =
    AttributeSchema::required("access_control.custom");
const ACCESS_CONTROL_CUSTOM_ENABLED: AttributeSchema =
    AttributeSchema::required("access_control.custom.enabled").requires_replace();
const AUTHORIZATION_SERVER: AttributeSchema = AttributeSchema::required("authorization_server");
const AUTHORIZATION_SERVER_RESOURCE_ID: AttributeSchema =
    AttributeSchema::optional("authorization_server.resource_id");
const AUTHORIZATION_SERVER_TYPE: AttributeSchema =
    AttributeSchema::required("authorization_server.type")
        .requires_replace()
        .constrained(&[Constraint::OneOf(AuthorizationServerType::VARIANTS)]);
const BASE_URLS: AttributeSchema = AttributeSchema::required("base_urls");
const DIRECTORY: AttributeSchema = AttributeSchema::optional_computed("directory");
const DIRECTORY_TYPE: AttributeSchema = AttributeSchema::required("directory.type")
    .constrained(&[Constraint::OneOf(AuthorizationServerType::VARIANTS)]);
const NAME: AttributeSchema =
    AttributeSchema::required("name").constrained(&[Constraint::LengthAtLeast(1)]);
const POLICY_ID: AttributeSchema = AttributeSchema::computed("policy_id");

pub const SCHEMA: KindSchema = KindSchema {
    kind: "api_service",
    attributes: &[
        ID,
        ENVIRONMENT_ID,
        ACCESS_CONTROL,
        ACCESS_CONTROL_CUSTOM,
        ACCESS_CONTROL_CUSTOM_ENABLED,
        AUTHORIZATION_SERVER,
        AUTHORIZATION_SERVER_RESOURCE_ID,
        AUTHORIZATION_SERVER_TYPE,
        BASE_URLS,
        DIRECTORY,
        DIRECTORY_TYPE,
        NAME,
        POLICY_ID,
    ],
};

static IMPORT_COMPONENTS: [ImportComponent; 2] = [
    ImportComponent::new("environment_id", RESOURCE_ID_FMT),
    ImportComponent::new("api_service_id", RESOURCE_ID_FMT).primary(),
];

static HOSTNAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[0-9A-Za-z]([0-9A-Za-z-]{0,61}[0-9A-Za-z])?(\.[0-9A-Za-z]([0-9A-Za-z-]{0,61}[0-9A-Za-z])?)*$",
    )
    .expect("failed to compile hostname regex")
});

/// Who issues the access tokens callers present to the API service.
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
pub enum AuthorizationServerType {
    PingoneSso,
    External,
}

/// Declared and recorded state of one API service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApiService {
    pub id: Value<ResourceId>,
    pub environment_id: Value<ResourceId>,
    pub access_control: Value<AccessControl>,
    pub authorization_server: Value<AuthorizationServer>,
    pub base_urls: Value<Vec<String>>,
    pub directory: Value<Directory>,
    pub name: Value<String>,
    pub policy_id: Value<ResourceId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessControl {
    pub custom: Value<CustomAccessControl>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CustomAccessControl {
    pub enabled: Value<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthorizationServer {
    pub resource_id: Value<ResourceId>,
    pub kind: Value<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Directory {
    pub kind: Value<String>,
}

impl ApiService {
    /// Injects the server-side defaults for `access_control` and
    /// `directory` so validation and expansion see the effective
    /// configuration.
    pub fn with_defaults(mut self) -> Self {
        if self.access_control.is_null() {
            self.access_control = Value::Known(AccessControl::custom_disabled());
        }
        if self.directory.is_null() {
            self.directory = Value::Known(Directory::pingone_sso());
        }
        self
    }

    pub fn validate(&self) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();

        NAME.check_string(&self.name, &mut diagnostics);

        BASE_URLS.check_presence(&self.base_urls, &mut diagnostics);
        if let Value::Known(urls) = &self.base_urls {
            for (index, url) in urls.iter().enumerate() {
                let path = BASE_URLS.path().index(index);
                check_base_url(&path, url, &mut diagnostics);
                if urls[..index].contains(url) {
                    diagnostics.push(Diagnostic::attribute_error(
                        path,
                        "Duplicate set element",
                        format!("{url:?} appears more than once in {}", BASE_URLS.path()),
                    ));
                }
            }
        }

        AUTHORIZATION_SERVER.check_presence(&self.authorization_server, &mut diagnostics);
        if let Value::Known(server) = &self.authorization_server {
            AUTHORIZATION_SERVER_TYPE.check_string(&server.kind, &mut diagnostics);

            let actual = server.kind.as_known().map(String::as_str);
            let resource_id_set = !server.resource_id.is_null();
            require_when(
                &AUTHORIZATION_SERVER_RESOURCE_ID,
                resource_id_set,
                &AUTHORIZATION_SERVER_TYPE,
                AuthorizationServerType::PingoneSso.as_ref(),
                actual,
                &mut diagnostics,
            );
            conflict_when(
                &AUTHORIZATION_SERVER_RESOURCE_ID,
                resource_id_set,
                &AUTHORIZATION_SERVER_TYPE,
                AuthorizationServerType::External.as_ref(),
                actual,
                &mut diagnostics,
            );
        }

        if let Value::Known(directory) = &self.directory {
            DIRECTORY_TYPE.check_string(&directory.kind, &mut diagnostics);
        }

        if let Value::Known(access_control) = &self.access_control {
            ACCESS_CONTROL_CUSTOM.check_presence(&access_control.custom, &mut diagnostics);
            if let Value::Known(custom) = &access_control.custom {
                ACCESS_CONTROL_CUSTOM_ENABLED.check_presence(&custom.enabled, &mut diagnostics);
            }
        }

        self.check_token_issuer_pair(&mut diagnostics);

        diagnostics
    }

    /// Both sub-objects name the token issuer; a mismatch is reported on
    /// each of the two attributes.
    fn check_token_issuer_pair(&self, diagnostics: &mut Diagnostics) {
        let server_type = self
            .authorization_server
            .as_known()
            .and_then(|server| server.kind.as_known());
        let directory_type = self
            .directory
            .as_known()
            .and_then(|directory| directory.kind.as_known());

        if let (Some(server_type), Some(directory_type)) = (server_type, directory_type) {
            if server_type != directory_type {
                let detail = format!(
                    "The `authorization_server.type` (value `{server_type}`) and \
                     `directory.type` (value `{directory_type}`) parameters must be set to the \
                     same value."
                );
                diagnostics.push(Diagnostic::attribute_error(
                    AUTHORIZATION_SERVER_TYPE.path(),
                    "Parameter conflict",
                    detail.clone(),
                ));
                diagnostics.push(Diagnostic::attribute_error(
                    DIRECTORY_TYPE.path(),
                    "Parameter conflict",
                    detail,
                ));
            }
        }
    }

    /// Builds the request body. Computed attributes stay absent; the
    /// server assigns them.
    pub fn expand(&self) -> Result<ApiServiceDto, Diagnostic> {
        let authorization_server = self
            .authorization_server
            .expand_required(&AUTHORIZATION_SERVER.path())?
            .expand()?;

        let access_control = self
            .access_control
            .expand_optional(&ACCESS_CONTROL.path())?
            .map(AccessControl::expand)
            .transpose()?;
        let directory = self
            .directory
            .expand_optional(&DIRECTORY.path())?
            .map(Directory::expand)
            .transpose()?;

        Ok(ApiServiceDto {
            id: None,
            name: self.name.expand_required(&NAME.path())?.clone(),
            base_urls: self.base_urls.expand_required(&BASE_URLS.path())?.clone(),
            authorization_server,
            access_control,
            directory,
            policy: None,
        })
    }

    /// Rebuilds state from a response. `base_urls` is an unordered set and
    /// comes back sorted so recorded state is stable across refreshes.
    pub fn flatten(dto: ApiServiceDto, environment_id: ResourceId) -> Result<Self, Diagnostic> {
        let mut base_urls = dto.base_urls;
        base_urls.sort_unstable();

        let access_control = match dto.access_control {
            Some(access_control) => Value::Known(AccessControl::flatten(access_control)),
            None => Value::Null,
        };
        let directory = match dto.directory {
            Some(directory) => Value::Known(Directory::flatten(directory)?),
            None => Value::Null,
        };

        Ok(Self {
            id: Value::from(dto.id),
            environment_id: Value::Known(environment_id),
            access_control,
            authorization_server: Value::Known(AuthorizationServer::flatten(
                dto.authorization_server,
            )?),
            base_urls: Value::Known(base_urls),
            directory,
            name: Value::Known(dto.name),
            policy_id: Value::from(dto.policy.map(|policy| policy.id)),
        })
    }
}

impl AccessControl {
    /// The server-side default: custom policy evaluation disabled.
    pub fn custom_disabled() -> Self {
        Self {
            custom: Value::Known(CustomAccessControl {
                enabled: Value::Known(false),
            }),
        }
    }

    fn expand(&self) -> Result<AccessControlDto, Diagnostic> {
        let custom = self.custom.expand_required(&ACCESS_CONTROL_CUSTOM.path())?;
        Ok(AccessControlDto {
            custom: CustomAccessControlDto {
                enabled: *custom
                    .enabled
                    .expand_required(&ACCESS_CONTROL_CUSTOM_ENABLED.path())?,
            },
        })
    }

    fn flatten(dto: AccessControlDto) -> Self {
        Self {
            custom: Value::Known(CustomAccessControl {
                enabled: Value::Known(dto.custom.enabled),
            }),
        }
    }
}

impl AuthorizationServer {
    pub fn external() -> Self {
        Self {
            resource_id: Value::Null,
            kind: Value::Known(AuthorizationServerType::External.to_string()),
        }
    }

    pub fn pingone_sso(resource_id: ResourceId) -> Self {
        Self {
            resource_id: Value::Known(resource_id),
            kind: Value::Known(AuthorizationServerType::PingoneSso.to_string()),
        }
    }

    fn expand(&self) -> Result<AuthorizationServerDto, Diagnostic> {
        let resource = self
            .resource_id
            .expand_optional(&AUTHORIZATION_SERVER_RESOURCE_ID.path())?
            .map(|id| EntityRefDto { id: id.clone() });
        Ok(AuthorizationServerDto {
            kind: self
                .kind
                .expand_required(&AUTHORIZATION_SERVER_TYPE.path())?
                .clone(),
            resource,
        })
    }

    fn flatten(dto: AuthorizationServerDto) -> Result<Self, Diagnostic> {
        check_known_token(
            &dto.kind,
            AuthorizationServerType::VARIANTS,
            &AUTHORIZATION_SERVER_TYPE.path(),
        )?;
        Ok(Self {
            resource_id: Value::from(dto.resource.map(|resource| resource.id)),
            kind: Value::Known(dto.kind),
        })
    }
}

impl Directory {
    /// The server-side default directory.
    pub fn pingone_sso() -> Self {
        Self {
            kind: Value::Known(AuthorizationServerType::PingoneSso.to_string()),
        }
    }

    fn expand(&self) -> Result<DirectoryDto, Diagnostic> {
        Ok(DirectoryDto {
            kind: self.kind.expand_required(&DIRECTORY_TYPE.path())?.clone(),
        })
    }

    fn flatten(dto: DirectoryDto) -> Result<Self, Diagnostic> {
        check_known_token(
            &dto.kind,
            AuthorizationServerType::VARIANTS,
            &DIRECTORY_TYPE.path(),
        )?;
        Ok(Self {
            kind: Value::Known(dto.kind),
        })
    }
}

fn check_base_url(path: &AttributePath, raw: &str, diagnostics: &mut Diagnostics) {
    if raw.chars().count() > BASE_URL_MAX_LENGTH {
        diagnostics.push(Diagnostic::attribute_error(
            path.clone(),
            "Invalid attribute value length",
            format!("{path} must be at most {BASE_URL_MAX_LENGTH} characters"),
        ));
    }

    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(error) => {
            diagnostics.push(Diagnostic::attribute_error(
                path.clone(),
                "Invalid base URL",
                format!("{path} is not a valid absolute URL: {error}"),
            ));
            return;
        }
    };

    if !matches!(url.scheme(), "http" | "https") {
        diagnostics.push(Diagnostic::attribute_error(
            path.clone(),
            "Invalid base URL",
            format!(
                "{path} must use the http or https scheme, got {:?}",
                url.scheme()
            ),
        ));
    }

    if url.query().is_some() {
        diagnostics.push(Diagnostic::attribute_error(
            path.clone(),
            "Invalid base URL",
            format!("{path} must not contain a query component"),
        ));
    }

    if url.fragment().is_some() {
        diagnostics.push(Diagnostic::attribute_error(
            path.clone(),
            "Invalid base URL",
            format!("{path} must not contain a fragment component"),
        ));
    }

    match url.host() {
        Some(url::Host::Ipv4(_) | url::Host::Ipv6(_)) => {}
        Some(url::Host::Domain(domain)) if HOSTNAME_REGEX.is_match(domain) => {}
        _ => {
            diagnostics.push(Diagnostic::attribute_error(
                path.clone(),
                "Invalid base URL",
                format!("{path} authority must be a DNS hostname or an IPv4/IPv6 address"),
            ));
        }
    }

    check_path_segments(path, raw, diagnostics);
}

/// Segment checks run on the raw string: the parser normalizes `.` and
/// `..` segments away, and those must be rejected rather than collapsed.
fn check_path_segments(path: &AttributePath, raw: &str, diagnostics: &mut Diagnostics) {
    let after_scheme = raw.split_once("://").map_or(raw, |(_, rest)| rest);
    let Some(start) = after_scheme.find(['/', '?', '#']) else {
        return;
    };
    if !after_scheme[start..].starts_with('/') {
        return;
    }

    let rest = &after_scheme[start..];
    let raw_path = match rest.find(['?', '#']) {
        Some(end) => &rest[..end],
        None => rest,
    };

    if raw_path.ends_with('/') {
        diagnostics.push(Diagnostic::attribute_error(
            path.clone(),
            "Invalid base URL",
            format!("{path} must not end in a trailing slash"),
        ));
    }

    let trimmed = raw_path.strip_suffix('/').unwrap_or(raw_path);
    let Some(segments) = trimmed.strip_prefix('/') else {
        return;
    };
    if segments.is_empty() {
        return;
    }

    for segment in segments.split('/') {
        if segment.is_empty() {
            diagnostics.push(Diagnostic::attribute_error(
                path.clone(),
                "Invalid base URL",
                format!("{path} must not contain empty path segments"),
            ));
        } else if segment == "." || segment == ".." {
            diagnostics.push(Diagnostic::attribute_error(
                path.clone(),
                "Invalid base URL",
                format!("{path} must not contain {segment:?} path segments"),
            ));
        }
    }
}

/// Wire shape of an API service.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiServiceDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ResourceId>,
    pub name: String,
    pub base_urls: Vec<String>,
    pub authorization_server: AuthorizationServerDto,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_control: Option<AccessControlDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<DirectoryDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<EntityRefDto>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AuthorizationServerDto {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<EntityRefDto>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AccessControlDto {
    pub custom: CustomAccessControlDto,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CustomAccessControlDto {
    pub enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DirectoryDto {
    #[serde(rename = "type")]
    pub kind: String,
}

/// REST surface for API services.
#[async_trait]
pub trait ApiServiceClient: EnvironmentClient {
    async fn create_api_service(
        &self,
        environment_id: &ResourceId,
        body: &ApiServiceDto,
    ) -> Result<ApiServiceDto, ApiError>;

    async fn read_api_service(
        &self,
        environment_id: &ResourceId,
        api_service_id: &ResourceId,
    ) -> Result<ApiServiceDto, ApiError>;

    async fn update_api_service(
        &self,
        environment_id: &ResourceId,
        api_service_id: &ResourceId,
        body: &ApiServiceDto,
    ) -> Result<ApiServiceDto, ApiError>;

    async fn delete_api_service(
        &self,
        environment_id: &ResourceId,
        api_service_id: &ResourceId,
    ) -> Result<(), ApiError>;
}

pub struct ApiServiceReconciler<C> {
    client: C,
    retry: RetryPolicy,
}

impl<C: ApiServiceClient> ApiServiceReconciler<C> {
    pub fn new(client: C) -> Self {
        Self::with_retry(client, RetryPolicy::DEFAULT)
    }

    pub fn with_retry(client: C, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }
}

#[async_trait]
impl<C: ApiServiceClient> Reconcile for ApiServiceReconciler<C> {
    type State = ApiService;

    async fn create(&self, ctx: &OpContext, desired: ApiService) -> Result<ApiService> {
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
            || self.client.create_api_service(&environment_id, &body),
        )
        .await?;

        ApiService::flatten(response, environment_id).map_err(Error::drift)
    }

    async fn read(&self, ctx: &OpContext, current: ApiService) -> Result<ReadOutcome<ApiService>> {
        let environment_id = require_known(&current.environment_id, "environment_id")?;
        let api_service_id = require_known(&current.id, "id")?;

        let outcome = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || self.client.read_api_service(&environment_id, &api_service_id),
        )
        .await;

        match outcome {
            Ok(response) => Ok(ReadOutcome::Current(
                ApiService::flatten(response, environment_id).map_err(Error::drift)?,
            )),
            Err(error) => recover_gone(error),
        }
    }

    async fn update(&self, ctx: &OpContext, desired: ApiService) -> Result<ApiService> {
        let desired = desired.with_defaults();
        ensure_valid(desired.validate())?;

        let environment_id = require_known(&desired.environment_id, "environment_id")?;
        let api_service_id = require_known(&desired.id, "id")?;
        let body = desired.expand().map_err(Error::invalid)?;

        let response = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::no_retry,
            || {
                self.client
                    .update_api_service(&environment_id, &api_service_id, &body)
            },
        )
        .await?;

        ApiService::flatten(response, environment_id).map_err(Error::drift)
    }

    async fn delete(&self, ctx: &OpContext, current: ApiService) -> Result<Diagnostics> {
        let environment_id = require_known(&current.environment_id, "environment_id")?;
        let api_service_id = require_known(&current.id, "id")?;

        let mut diagnostics = Diagnostics::new();
        let outcome = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::no_retry,
            || self.client.delete_api_service(&environment_id, &api_service_id),
        )
        .await;

        if let Err(error) = outcome {
            recover_deleted(error, &mut diagnostics)?;
        }
        Ok(diagnostics)
    }

    fn import(&self, id: &str) -> Result<ApiService> {
        let parsed = import::parse(id, &IMPORT_COMPONENTS).context(ImportSnafu)?;
        Ok(ApiService {
            id: Value::Known(
                parsed
                    .require_resource_id("api_service_id")
                    .context(ImportSnafu)?,
            ),
            environment_id: Value::Known(
                parsed
                    .require_resource_id("environment_id")
                    .context(ImportSnafu)?,
            ),
            ..ApiService::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn resource_id(tail: u32) -> ResourceId {
        format!("00000000-0000-4000-8000-{tail:012}").parse().unwrap()
    }

    fn service() -> ApiService {
        ApiService {
            environment_id: Value::Known(resource_id(1)),
            authorization_server: Value::Known(AuthorizationServer::pingone_sso(resource_id(2))),
            base_urls: Value::Known(vec!["https://api.bxretail.org/payments".to_owned()]),
            name: Value::Known("Payments API".to_owned()),
            ..ApiService::default()
        }
        .with_defaults()
    }

    #[test]
    fn minimal_configuration_is_valid() {
        assert!(!service().validate().has_errors());
    }

    #[test]
    fn defaults_fill_access_control_and_directory() {
        let service = service();

        assert_eq!(
            service.access_control,
            Value::Known(AccessControl::custom_disabled())
        );
        assert_eq!(service.directory, Value::Known(Directory::pingone_sso()));
    }

    #[test]
    fn defaults_leave_explicit_configuration_alone() {
        let mut explicit = service();
        explicit.directory = Value::Known(Directory {
            kind: Value::Known("EXTERNAL".to_owned()),
        });

        let service = explicit.clone().with_defaults();

        assert_eq!(service.directory, explicit.directory);
    }

    #[rstest]
    #[case::scheme("ftp://api.bxretail.org", "must use the http or https scheme")]
    #[case::query("https://api.bxretail.org/a?b=c", "query component")]
    #[case::fragment("https://api.bxretail.org/a#b", "fragment component")]
    #[case::trailing_slash("https://api.bxretail.org/a/", "trailing slash")]
    #[case::empty_segment("https://api.bxretail.org/a//b", "empty path segments")]
    #[case::dot_segment("https://api.bxretail.org/a/./b", "\".\" path segments")]
    #[case::dot_dot_segment("https://api.bxretail.org/a/../b", "\"..\" path segments")]
    #[case::relative("/payments", "not a valid absolute URL")]
    #[case::hostname("https://-api-.bxretail.org/a", "DNS hostname")]
    fn base_url_rules_reject(#[case] url: &str, #[case] expected: &str) {
        let mut service = service();
        service.base_urls = Value::Known(vec![url.to_owned()]);

        let diagnostics = service.validate();

        assert!(
            diagnostics
                .iter()
                .any(|diagnostic| diagnostic.detail().contains(expected)),
            "expected a diagnostic containing {expected:?}, got: {diagnostics}"
        );
    }

    #[rstest]
    #[case::plain_host("https://api.bxretail.org")]
    #[case::with_path("http://api.bxretail.org/payments/v1")]
    #[case::ipv4("https://192.168.1.1/payments")]
    #[case::ipv6("https://[2001:db8::1]/payments")]
    fn base_url_rules_accept(#[case] url: &str) {
        let mut service = service();
        service.base_urls = Value::Known(vec![url.to_owned()]);

        assert!(!service.validate().has_errors());
    }

    #[test]
    fn overlong_base_url_is_rejected() {
        let mut service = service();
        let url = format!("https://api.bxretail.org/{}", "a".repeat(BASE_URL_MAX_LENGTH));
        service.base_urls = Value::Known(vec![url]);

        let diagnostics = service.validate();

        assert!(
            diagnostics
                .iter()
                .any(|diagnostic| diagnostic.detail().contains("at most 256 characters"))
        );
    }

    #[test]
    fn duplicate_base_urls_are_rejected() {
        let mut service = service();
        service.base_urls = Value::Known(vec![
            "https://api.bxretail.org".to_owned(),
            "https://api.bxretail.org".to_owned(),
        ]);

        let diagnostics = service.validate();

        assert_eq!(
            diagnostics
                .iter()
                .filter(|diagnostic| diagnostic.summary() == "Duplicate set element")
                .count(),
            1
        );
    }

    #[test]
    fn mismatched_token_issuers_flag_both_attributes() {
        let mut service = service();
        service.directory = Value::Known(Directory {
            kind: Value::Known("EXTERNAL".to_owned()),
        });

        let diagnostics = service.validate();

        let conflicts: Vec<_> = diagnostics
            .iter()
            .filter(|diagnostic| diagnostic.summary() == "Parameter conflict")
            .collect();
        assert_eq!(conflicts.len(), 2);
        assert_eq!(
            conflicts[0].attribute().map(ToString::to_string),
            Some("authorization_server.type".to_owned())
        );
        assert_eq!(
            conflicts[1].attribute().map(ToString::to_string),
            Some("directory.type".to_owned())
        );
        assert!(
            conflicts[0]
                .detail()
                .contains("must be set to the same value")
        );
    }

    #[test]
    fn pingone_sso_requires_a_resource_id() {
        let mut service = service();
        service.authorization_server = Value::Known(AuthorizationServer {
            resource_id: Value::Null,
            kind: Value::Known("PINGONE_SSO".to_owned()),
        });

        let diagnostics = service.validate();

        assert!(diagnostics.iter().any(|diagnostic| {
            diagnostic.summary() == "Missing required attribute"
                && diagnostic
                    .detail()
                    .contains("authorization_server.resource_id")
        }));
    }

    #[test]
    fn external_conflicts_with_a_resource_id() {
        let mut service = service();
        service.authorization_server = Value::Known(AuthorizationServer {
            resource_id: Value::Known(resource_id(2)),
            kind: Value::Known("EXTERNAL".to_owned()),
        });
        service.directory = Value::Known(Directory {
            kind: Value::Known("EXTERNAL".to_owned()),
        });

        let diagnostics = service.validate();

        assert!(
            diagnostics
                .iter()
                .any(|diagnostic| diagnostic.summary() == "Invalid combination of arguments")
        );
    }

    #[test]
    fn expand_serializes_the_create_body() {
        let body = service().expand().unwrap();

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "name": "Payments API",
                "baseUrls": ["https://api.bxretail.org/payments"],
                "authorizationServer": {
                    "type": "PINGONE_SSO",
                    "resource": {"id": "00000000-0000-4000-8000-000000000002"},
                },
                "accessControl": {"custom": {"enabled": false}},
                "directory": {"type": "PINGONE_SSO"},
            })
        );
    }

    #[test]
    fn expand_reports_unsettled_references() {
        let mut service = service();
        service.base_urls = Value::Unknown;

        let diagnostic = service.expand().unwrap_err();

        assert_eq!(diagnostic.summary(), "Unresolved attribute value");
        assert_eq!(
            diagnostic.attribute().map(ToString::to_string),
            Some("base_urls".to_owned())
        );
    }

    #[test]
    fn flatten_sorts_base_urls_and_copies_computed_attributes() {
        let dto = ApiServiceDto {
            id: Some(resource_id(9)),
            name: "Payments API".to_owned(),
            base_urls: vec![
                "https://b.bxretail.org".to_owned(),
                "https://a.bxretail.org".to_owned(),
            ],
            authorization_server: AuthorizationServerDto {
                kind: "PINGONE_SSO".to_owned(),
                resource: Some(EntityRefDto { id: resource_id(2) }),
            },
            access_control: Some(AccessControlDto {
                custom: CustomAccessControlDto { enabled: false },
            }),
            directory: Some(DirectoryDto {
                kind: "PINGONE_SSO".to_owned(),
            }),
            policy: Some(EntityRefDto { id: resource_id(7) }),
        };

        let state = ApiService::flatten(dto, resource_id(1)).unwrap();

        assert_eq!(state.id, Value::Known(resource_id(9)));
        assert_eq!(state.policy_id, Value::Known(resource_id(7)));
        assert_eq!(
            state.base_urls,
            Value::Known(vec![
                "https://a.bxretail.org".to_owned(),
                "https://b.bxretail.org".to_owned(),
            ])
        );
    }

    #[test]
    fn flatten_rejects_unknown_issuer_tokens() {
        let dto = ApiServiceDto {
            id: None,
            name: "Payments API".to_owned(),
            base_urls: vec![],
            authorization_server: AuthorizationServerDto {
                kind: "FEDERATED".to_owned(),
                resource: None,
            },
            access_control: None,
            directory: None,
            policy: None,
        };

        let diagnostic = ApiService::flatten(dto, resource_id(1)).unwrap_err();

        assert_eq!(diagnostic.summary(), "Unrecognized value from service");
    }

    #[test]
    fn response_json_round_trips() {
        let response = json!({
            "id": "00000000-0000-4000-8000-000000000009",
            "name": "Payments API",
            "baseUrls": ["https://api.bxretail.org/payments"],
            "authorizationServer": {"type": "EXTERNAL"},
            "policy": {"id": "00000000-0000-4000-8000-000000000007"},
        });

        let dto: ApiServiceDto = serde_json::from_value(response).unwrap();

        assert_eq!(dto.id, Some(resource_id(9)));
        assert_eq!(dto.authorization_server.resource, None);
        assert_eq!(dto.access_control, None);
        assert_eq!(dto.policy, Some(EntityRefDto { id: resource_id(7) }));
    }
}
