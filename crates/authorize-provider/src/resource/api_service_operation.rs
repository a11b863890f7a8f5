//! Operations group the URL paths and HTTP methods of an API service and
//! attach access-control rules to the group.
//!
//! `methods` left null means the operation covers every method. Path
//! entries keep their declared order; patterns must be unique within one
//! operation.

use async_trait::async_trait;
use snafu::ResultExt;
use strum::VariantNames;

use crate::{
    diagnostic::{Diagnostic, Diagnostics},
    expr::{EntityRef, EntityRefDto, check_known_token},
    id::{RESOURCE_ID_FMT, ResourceId},
    import::{self, ImportComponent},
    path::AttributePath,
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
const API_SERVICE_ID: AttributeSchema =
    AttributeSchema::required("api_service_id").requires_replace();
const ACCESS_CONTROL: AttributeSchema = AttributeSchema::optional("access_control");
const ACCESS_CONTROL_GROUP: AttributeSchema =
    AttributeSchema::optional("access_control.group");
const ACCESS_CONTROL_GROUP_GROUPS: AttributeSchema =
    AttributeSchema::required("access_control.group.groups")
        .constrained(&[Constraint::SizeAtLeast(1), Constraint::SizeAtMost(25)]);
const ACCESS_CONTROL_PERMISSION: AttributeSchema =
    AttributeSchema::optional("access_control.permission");
const ACCESS_CONTROL_SCOPE: AttributeSchema =
    AttributeSchema::optional("access_control.scope");
const ACCESS_CONTROL_SCOPE_MATCH_TYPE: AttributeSchema =
    AttributeSchema::optional("access_control.scope.match_type")
        .constrained(&[Constraint::OneOf(ScopeMatchType::VARIANTS)]);
const ACCESS_CONTROL_SCOPE_SCOPES: AttributeSchema =
    AttributeSchema::required("access_control.scope.scopes")
        .constrained(&[Constraint::SizeAtLeast(1)]);
const METHODS: AttributeSchema = AttributeSchema::optional("methods")
    .constrained(&[Constraint::SizeAtLeast(1), Constraint::SizeAtMost(10)]);
const NAME: AttributeSchema =
    AttributeSchema::required("name").constrained(&[Constraint::LengthAtLeast(1)]);
const PATHS: AttributeSchema = AttributeSchema::required("paths")
    .constrained(&[Constraint::SizeAtLeast(1), Constraint::SizeAtMost(10)]);

const PATH_PATTERN_CONSTRAINTS: &[Constraint] =
    &[Constraint::LengthAtLeast(1), Constraint::LengthAtMost(2048)];

pub const SCHEMA: KindSchema = KindSchema {
    kind: "api_service_operation",
    attributes: &[
        ID,
        ENVIRONMENT_ID,
        API_SERVICE_ID,
        ACCESS_CONTROL,
        ACCESS_CONTROL_GROUP,
        ACCESS_CONTROL_GROUP_GROUPS,
        ACCESS_CONTROL_PERMISSION,
        ACCESS_CONTROL_SCOPE,
        ACCESS_CONTROL_SCOPE_MATCH_TYPE,
        ACCESS_CONTROL_SCOPE_SCOPES,
        METHODS,
        NAME,
        PATHS,
    ],
};

static IMPORT_COMPONENTS: [ImportComponent; 3] = [
    ImportComponent::new("environment_id", RESOURCE_ID_FMT),
    ImportComponent::new("api_service_id", RESOURCE_ID_FMT),
    ImportComponent::new("api_service_operation_id", RESOURCE_ID_FMT).primary(),
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
pub enum HttpMethod {
    Delete,
    Get,
    Head,
    Options,
    Patch,
    Post,
    Put,
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
pub enum PathPatternType {
    Exact,
    Parameter,
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
pub enum ScopeMatchType {
    All,
    Any,
}

/// Declared and recorded state of one API service operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApiServiceOperation {
    pub id: Value<ResourceId>,
    pub environment_id: Value<ResourceId>,
    pub api_service_id: Value<ResourceId>,
    pub access_control: Value<OperationAccessControl>,
    pub methods: Value<Vec<String>>,
    pub name: Value<String>,
    pub paths: Value<Vec<PathPattern>>,
}

/// The three rule objects are independent; any subset may be configured.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperationAccessControl {
    pub group: Value<GroupRule>,
    pub permission: Value<EntityRef>,
    pub scope: Value<ScopeRule>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupRule {
    pub groups: Value<Vec<EntityRef>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScopeRule {
    pub match_type: Value<String>,
    pub scopes: Value<Vec<EntityRef>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PathPattern {
    pub pattern: Value<String>,
    pub kind: Value<String>,
}

impl PathPattern {
    pub fn exact(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Value::Known(pattern.into()),
            kind: Value::Known(PathPatternType::Exact.to_string()),
        }
    }

    pub fn parameter(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Value::Known(pattern.into()),
            kind: Value::Known(PathPatternType::Parameter.to_string()),
        }
    }

    fn validate(&self, path: &AttributePath, diagnostics: &mut Diagnostics) {
        let pattern_path = path.clone().attribute("pattern");
        match &self.pattern {
            Value::Known(pattern) => {
                for constraint in PATH_PATTERN_CONSTRAINTS {
                    constraint.check_str(&pattern_path, pattern, diagnostics);
                }
            }
            Value::Null => diagnostics.push(Diagnostic::attribute_error(
                pattern_path.clone(),
                "Missing required attribute",
                format!("{pattern_path} must be configured"),
            )),
            Value::Unknown => {}
        }

        let kind_path = path.clone().attribute("type");
        match &self.kind {
            Value::Known(kind) => {
                Constraint::OneOf(PathPatternType::VARIANTS).check_str(
                    &kind_path,
                    kind,
                    diagnostics,
                );
            }
            Value::Null => diagnostics.push(Diagnostic::attribute_error(
                kind_path.clone(),
                "Missing required attribute",
                format!("{kind_path} must be configured"),
            )),
            Value::Unknown => {}
        }
    }

    fn expand(&self, path: &AttributePath) -> Result<PathPatternDto, Diagnostic> {
        Ok(PathPatternDto {
            pattern: self
                .pattern
                .expand_required(&path.clone().attribute("pattern"))?
                .clone(),
            kind: self
                .kind
                .expand_required(&path.clone().attribute("type"))?
                .clone(),
        })
    }

    fn flatten(dto: PathPatternDto, path: &AttributePath) -> Result<Self, Diagnostic> {
        check_known_token(
            &dto.kind,
            PathPatternType::VARIANTS,
            &path.clone().attribute("type"),
        )?;
        Ok(Self {
            pattern: Value::Known(dto.pattern),
            kind: Value::Known(dto.kind),
        })
    }
}

impl ApiServiceOperation {
    pub fn validate(&self) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();

        NAME.check_string(&self.name, &mut diagnostics);

        METHODS.check_set_size(&self.methods, &mut diagnostics);
        if let Value::Known(methods) = &self.methods {
            for (index, method) in methods.iter().enumerate() {
                Constraint::OneOf(HttpMethod::VARIANTS).check_str(
                    &METHODS.path().index(index),
                    method,
                    &mut diagnostics,
                );
            }
        }

        PATHS.check_set_size(&self.paths, &mut diagnostics);
        if let Value::Known(paths) = &self.paths {
            for (index, entry) in paths.iter().enumerate() {
                let path = PATHS.path().index(index);
                entry.validate(&path, &mut diagnostics);

                let duplicate = entry.pattern.as_known().is_some_and(|pattern| {
                    paths[..index]
                        .iter()
                        .any(|seen| seen.pattern.as_known() == Some(pattern))
                });
                if duplicate {
                    diagnostics.push(Diagnostic::attribute_error(
                        path.attribute("pattern"),
                        "Duplicate path pattern",
                        format!(
                            "pattern {:?} appears more than once in {}",
                            entry.pattern.as_known().map_or("", String::as_str),
                            PATHS.path()
                        ),
                    ));
                }
            }
        }

        if let Value::Known(access_control) = &self.access_control {
            access_control.validate(&mut diagnostics);
        }

        diagnostics
    }

    pub fn expand(&self) -> Result<ApiServiceOperationDto, Diagnostic> {
        let access_control = self
            .access_control
            .expand_optional(&ACCESS_CONTROL.path())?
            .map(OperationAccessControl::expand)
            .transpose()?;
        let methods = self.methods.expand_optional(&METHODS.path())?.cloned();
        let paths = self
            .paths
            .expand_required(&PATHS.path())?
            .iter()
            .enumerate()
            .map(|(index, entry)| entry.expand(&PATHS.path().index(index)))
            .collect::<Result<Vec<_>, Diagnostic>>()?;

        Ok(ApiServiceOperationDto {
            id: None,
            name: self.name.expand_required(&NAME.path())?.clone(),
            access_control,
            methods,
            paths,
        })
    }

    /// Rebuilds state from a response. `methods` and the rule id sets are
    /// unordered and come back sorted; `paths` keeps the response order.
    pub fn flatten(
        dto: ApiServiceOperationDto,
        environment_id: ResourceId,
        api_service_id: ResourceId,
    ) -> Result<Self, Diagnostic> {
        let methods = match dto.methods {
            Some(mut methods) => {
                for method in &methods {
                    check_known_token(method, HttpMethod::VARIANTS, &METHODS.path())?;
                }
                methods.sort_unstable();
                Value::Known(methods)
            }
            None => Value::Null,
        };

        let paths = dto
            .paths
            .into_iter()
            .enumerate()
            .map(|(index, entry)| PathPattern::flatten(entry, &PATHS.path().index(index)))
            .collect::<Result<Vec<_>, Diagnostic>>()?;

        let access_control = match dto.access_control {
            Some(access_control) => {
                Value::Known(OperationAccessControl::flatten(access_control)?)
            }
            None => Value::Null,
        };

        Ok(Self {
            id: Value::from(dto.id),
            environment_id: Value::Known(environment_id),
            api_service_id: Value::Known(api_service_id),
            access_control,
            methods,
            name: Value::Known(dto.name),
            paths: Value::Known(paths),
        })
    }
}

impl OperationAccessControl {
    fn validate(&self, diagnostics: &mut Diagnostics) {
        if let Value::Known(group) = &self.group {
            ACCESS_CONTROL_GROUP_GROUPS.check_set_size(&group.groups, diagnostics);
            if let Value::Known(groups) = &group.groups {
                for (index, reference) in groups.iter().enumerate() {
                    reference.validate(&ACCESS_CONTROL_GROUP_GROUPS.path().index(index), diagnostics);
                }
            }
        }

        if let Value::Known(permission) = &self.permission {
            permission.validate(&ACCESS_CONTROL_PERMISSION.path(), diagnostics);
        }

        if let Value::Known(scope) = &self.scope {
            if let Value::Known(match_type) = &scope.match_type {
                Constraint::OneOf(ScopeMatchType::VARIANTS).check_str(
                    &ACCESS_CONTROL_SCOPE_MATCH_TYPE.path(),
                    match_type,
                    diagnostics,
                );
            }
            ACCESS_CONTROL_SCOPE_SCOPES.check_set_size(&scope.scopes, diagnostics);
            if let Value::Known(scopes) = &scope.scopes {
                for (index, reference) in scopes.iter().enumerate() {
                    reference.validate(&ACCESS_CONTROL_SCOPE_SCOPES.path().index(index), diagnostics);
                }
            }
        }
    }

    fn expand(&self) -> Result<OperationAccessControlDto, Diagnostic> {
        let group = self
            .group
            .expand_optional(&ACCESS_CONTROL_GROUP.path())?
            .map(|group| {
                let groups = group
                    .groups
                    .expand_required(&ACCESS_CONTROL_GROUP_GROUPS.path())?
                    .iter()
                    .enumerate()
                    .map(|(index, reference)| {
                        reference.expand(&ACCESS_CONTROL_GROUP_GROUPS.path().index(index))
                    })
                    .collect::<Result<Vec<_>, Diagnostic>>()?;
                Ok(GroupRuleDto { groups })
            })
            .transpose()?;

        let permission = self
            .permission
            .expand_optional(&ACCESS_CONTROL_PERMISSION.path())?
            .map(|reference| reference.expand(&ACCESS_CONTROL_PERMISSION.path()))
            .transpose()?;

        let scope = self
            .scope
            .expand_optional(&ACCESS_CONTROL_SCOPE.path())?
            .map(|scope| {
                let scopes = scope
                    .scopes
                    .expand_required(&ACCESS_CONTROL_SCOPE_SCOPES.path())?
                    .iter()
                    .enumerate()
                    .map(|(index, reference)| {
                        reference.expand(&ACCESS_CONTROL_SCOPE_SCOPES.path().index(index))
                    })
                    .collect::<Result<Vec<_>, Diagnostic>>()?;
                Ok(ScopeRuleDto {
                    match_type: scope
                        .match_type
                        .expand_optional(&ACCESS_CONTROL_SCOPE_MATCH_TYPE.path())?
                        .cloned(),
                    scopes,
                })
            })
            .transpose()?;

        Ok(OperationAccessControlDto {
            group,
            permission,
            scope,
        })
    }

    fn flatten(dto: OperationAccessControlDto) -> Result<Self, Diagnostic> {
        let group = match dto.group {
            Some(group) => {
                let mut groups = group.groups;
                groups.sort_unstable_by(|left, right| left.id.cmp(&right.id));
                Value::Known(GroupRule {
                    groups: Value::Known(
                        groups.into_iter().map(EntityRef::flatten).collect(),
                    ),
                })
            }
            None => Value::Null,
        };

        let scope = match dto.scope {
            Some(scope) => {
                if let Some(match_type) = &scope.match_type {
                    check_known_token(
                        match_type,
                        ScopeMatchType::VARIANTS,
                        &ACCESS_CONTROL_SCOPE_MATCH_TYPE.path(),
                    )?;
                }
                let mut scopes = scope.scopes;
                scopes.sort_unstable_by(|left, right| left.id.cmp(&right.id));
                Value::Known(ScopeRule {
                    match_type: Value::from(scope.match_type),
                    scopes: Value::Known(
                        scopes.into_iter().map(EntityRef::flatten).collect(),
                    ),
                })
            }
            None => Value::Null,
        };

        Ok(Self {
            group,
            permission: Value::from(dto.permission.map(EntityRef::flatten)),
            scope,
        })
    }
}

/// Wire shape of an operation.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiServiceOperationDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ResourceId>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_control: Option<OperationAccessControlDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    pub paths: Vec<PathPatternDto>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OperationAccessControlDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupRuleDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<EntityRefDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeRuleDto>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GroupRuleDto {
    pub groups: Vec<EntityRefDto>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeRuleDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_type: Option<String>,
    pub scopes: Vec<EntityRefDto>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PathPatternDto {
    pub pattern: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// REST surface for API service operations.
#[async_trait]
pub trait ApiServiceOperationClient: EnvironmentClient {
    async fn create_operation(
        &self,
        environment_id: &ResourceId,
        api_service_id: &ResourceId,
        body: &ApiServiceOperationDto,
    ) -> Result<ApiServiceOperationDto, ApiError>;

    async fn read_operation(
        &self,
        environment_id: &ResourceId,
        api_service_id: &ResourceId,
        operation_id: &ResourceId,
    ) -> Result<ApiServiceOperationDto, ApiError>;

    async fn update_operation(
        &self,
        environment_id: &ResourceId,
        api_service_id: &ResourceId,
        operation_id: &ResourceId,
        body: &ApiServiceOperationDto,
    ) -> Result<ApiServiceOperationDto, ApiError>;

    async fn delete_operation(
        &self,
        environment_id: &ResourceId,
        api_service_id: &ResourceId,
        operation_id: &ResourceId,
    ) -> Result<(), ApiError>;
}

pub struct ApiServiceOperationReconciler<C> {
    client: C,
    retry: RetryPolicy,
}

impl<C: ApiServiceOperationClient> ApiServiceOperationReconciler<C> {
    pub fn new(client: C) -> Self {
        Self::with_retry(client, RetryPolicy::DEFAULT)
    }

    pub fn with_retry(client: C, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }
}

#[async_trait]
impl<C: ApiServiceOperationClient> Reconcile for ApiServiceOperationReconciler<C> {
    type State = ApiServiceOperation;

    async fn create(
        &self,
        ctx: &OpContext,
        desired: ApiServiceOperation,
    ) -> Result<ApiServiceOperation> {
        ensure_valid(desired.validate())?;

        let environment_id = require_known(&desired.environment_id, "environment_id")?;
        let api_service_id = require_known(&desired.api_service_id, "api_service_id")?;
        let body = desired.expand().map_err(Error::invalid)?;

        let response = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || {
                self.client
                    .create_operation(&environment_id, &api_service_id, &body)
            },
        )
        .await?;

        ApiServiceOperation::flatten(response, environment_id, api_service_id)
            .map_err(Error::drift)
    }

    async fn read(
        &self,
        ctx: &OpContext,
        current: ApiServiceOperation,
    ) -> Result<ReadOutcome<ApiServiceOperation>> {
        let environment_id = require_known(&current.environment_id, "environment_id")?;
        let api_service_id = require_known(&current.api_service_id, "api_service_id")?;
        let operation_id = require_known(&current.id, "id")?;

        let outcome = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || {
                self.client
                    .read_operation(&environment_id, &api_service_id, &operation_id)
            },
        )
        .await;

        match outcome {
            Ok(response) => Ok(ReadOutcome::Current(
                ApiServiceOperation::flatten(response, environment_id, api_service_id)
                    .map_err(Error::drift)?,
            )),
            Err(error) => recover_gone(error),
        }
    }

    async fn update(
        &self,
        ctx: &OpContext,
        desired: ApiServiceOperation,
    ) -> Result<ApiServiceOperation> {
        ensure_valid(desired.validate())?;

        let environment_id = require_known(&desired.environment_id, "environment_id")?;
        let api_service_id = require_known(&desired.api_service_id, "api_service_id")?;
        let operation_id = require_known(&desired.id, "id")?;
        let body = desired.expand().map_err(Error::invalid)?;

        let response = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::no_retry,
            || {
                self.client
                    .update_operation(&environment_id, &api_service_id, &operation_id, &body)
            },
        )
        .await?;

        ApiServiceOperation::flatten(response, environment_id, api_service_id)
            .map_err(Error::drift)
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        current: ApiServiceOperation,
    ) -> Result<Diagnostics> {
        let environment_id = require_known(&current.environment_id, "environment_id")?;
        let api_service_id = require_known(&current.api_service_id, "api_service_id")?;
        let operation_id = require_known(&current.id, "id")?;

        let mut diagnostics = Diagnostics::new();
        let outcome = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::no_retry,
            || {
                self.client
                    .delete_operation(&environment_id, &api_service_id, &operation_id)
            },
        )
        .await;

        if let Err(error) = outcome {
            recover_deleted(error, &mut diagnostics)?;
        }
        Ok(diagnostics)
    }

    fn import(&self, id: &str) -> Result<ApiServiceOperation> {
        let parsed = import::parse(id, &IMPORT_COMPONENTS).context(ImportSnafu)?;
        Ok(ApiServiceOperation {
            id: Value::Known(
                parsed
                    .require_resource_id("api_service_operation_id")
                    .context(ImportSnafu)?,
            ),
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
            ..ApiServiceOperation::default()
        })
    }
}
