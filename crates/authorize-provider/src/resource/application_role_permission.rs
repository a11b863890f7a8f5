//! Attaches an existing application resource permission to an
//! application role.
//!
//! The grant itself has no identifier of its own: it is addressed by the
//! permission id under the role's permission collection, and the remote
//! API offers no update. Every configurable attribute forces
//! replacement.

use async_trait::async_trait;
use snafu::ResultExt;

use crate::{
    diagnostic::{Diagnostic, Diagnostics},
    expr::EntityRefDto,
    id::{RESOURCE_ID_FMT, ResourceId},
    import::{self, ImportComponent},
    resource::{
        Error, ImportSnafu, OpContext, ReadOutcome, Reconcile, Result, call, ensure_valid,
        not_found_warning, recover_deleted, recover_gone, require_known,
    },
    schema::{AttributeSchema, KindSchema},
    transport::{self, ApiError, EnvironmentClient, RetryPolicy},
    value::Value,
};

const ENVIRONMENT_ID: AttributeSchema =
    AttributeSchema::required("environment_id").requires_replace();
const APPLICATION_ROLE_ID: AttributeSchema =
    AttributeSchema::required("application_role_id").requires_replace();
const APPLICATION_RESOURCE_PERMISSION_ID: AttributeSchema =
    AttributeSchema::required("application_resource_permission_id").requires_replace();
const ACTION: AttributeSchema = AttributeSchema::computed("action");
const DESCRIPTION: AttributeSchema = AttributeSchema::computed("description");
const KEY: AttributeSchema = AttributeSchema::computed("key");
const RESOURCE: AttributeSchema = AttributeSchema::computed("resource");

pub const SCHEMA: KindSchema = KindSchema {
    kind: "application_role_permission",
    attributes: &[
        ENVIRONMENT_ID,
        APPLICATION_ROLE_ID,
        APPLICATION_RESOURCE_PERMISSION_ID,
        ACTION,
        DESCRIPTION,
        KEY,
        RESOURCE,
    ],
};

static IMPORT_COMPONENTS: [ImportComponent; 3] = [
    ImportComponent::new("environment_id", RESOURCE_ID_FMT),
    ImportComponent::new("application_role_id", RESOURCE_ID_FMT),
    ImportComponent::new("application_resource_permission_id", RESOURCE_ID_FMT),
];

/// Declared and recorded state of one role-permission grant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplicationRolePermission {
    pub environment_id: Value<ResourceId>,
    pub application_role_id: Value<ResourceId>,
    pub application_resource_permission_id: Value<ResourceId>,
    pub action: Value<String>,
    pub description: Value<String>,
    pub key: Value<String>,
    pub resource: Value<PermissionResource>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PermissionResource {
    pub id: Value<ResourceId>,
    pub name: Value<String>,
}

impl ApplicationRolePermission {
    pub fn validate(&self) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();

        ENVIRONMENT_ID.check_presence(&self.environment_id, &mut diagnostics);
        APPLICATION_ROLE_ID.check_presence(&self.application_role_id, &mut diagnostics);
        APPLICATION_RESOURCE_PERMISSION_ID
            .check_presence(&self.application_resource_permission_id, &mut diagnostics);

        diagnostics
    }

    /// The create body is a bare reference to the permission being
    /// attached.
    pub fn expand(&self) -> Result<EntityRefDto, Diagnostic> {
        Ok(EntityRefDto {
            id: self
                .application_resource_permission_id
                .expand_required(&APPLICATION_RESOURCE_PERMISSION_ID.path())?
                .clone(),
        })
    }

    pub fn flatten(
        dto: RolePermissionDto,
        environment_id: ResourceId,
        application_role_id: ResourceId,
    ) -> Self {
        let resource = match dto.resource {
            Some(resource) => Value::Known(PermissionResource {
                id: Value::Known(resource.id),
                name: Value::from(resource.name),
            }),
            None => Value::Null,
        };

        Self {
            environment_id: Value::Known(environment_id),
            application_role_id: Value::Known(application_role_id),
            application_resource_permission_id: Value::Known(dto.id),
            action: Value::from(dto.action),
            description: Value::from(dto.description),
            key: Value::from(dto.key),
            resource,
        }
    }
}

/// Wire shape of a permission as listed under a role.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolePermissionDto {
    pub id: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<PermissionResourceDto>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PermissionResourceDto {
    pub id: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// REST surface for role-permission grants.
///
/// The grant collection has no by-id GET; `read_role_permissions`
/// returns the full collection and the reconciler scans it. Paging is
/// the adapter's concern.
#[async_trait]
pub trait ApplicationRolePermissionClient: EnvironmentClient {
    async fn create_role_permission(
        &self,
        environment_id: &ResourceId,
        application_role_id: &ResourceId,
        body: &EntityRefDto,
    ) -> Result<RolePermissionDto, ApiError>;

    async fn read_role_permissions(
        &self,
        environment_id: &ResourceId,
        application_role_id: &ResourceId,
    ) -> Result<Vec<RolePermissionDto>, ApiError>;

    async fn delete_role_permission(
        &self,
        environment_id: &ResourceId,
        application_role_id: &ResourceId,
        permission_id: &ResourceId,
    ) -> Result<(), ApiError>;
}

pub struct ApplicationRolePermissionReconciler<C> {
    client: C,
    retry: RetryPolicy,
}

impl<C: ApplicationRolePermissionClient> ApplicationRolePermissionReconciler<C> {
    pub fn new(client: C) -> Self {
        Self::with_retry(client, RetryPolicy::DEFAULT)
    }

    pub fn with_retry(client: C, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }
}

#[async_trait]
impl<C: ApplicationRolePermissionClient> Reconcile
    for ApplicationRolePermissionReconciler<C>
{
    type State = ApplicationRolePermission;

    async fn create(
        &self,
        ctx: &OpContext,
        desired: ApplicationRolePermission,
    ) -> Result<ApplicationRolePermission> {
        ensure_valid(desired.validate())?;

        let environment_id = require_known(&desired.environment_id, "environment_id")?;
        let application_role_id =
            require_known(&desired.application_role_id, "application_role_id")?;
        let body = desired.expand().map_err(Error::invalid)?;

        let response = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || {
                self.client
                    .create_role_permission(&environment_id, &application_role_id, &body)
            },
        )
        .await?;

        Ok(ApplicationRolePermission::flatten(
            response,
            environment_id,
            application_role_id,
        ))
    }

    async fn read(
        &self,
        ctx: &OpContext,
        current: ApplicationRolePermission,
    ) -> Result<ReadOutcome<ApplicationRolePermission>> {
        let environment_id = require_known(&current.environment_id, "environment_id")?;
        let application_role_id =
            require_known(&current.application_role_id, "application_role_id")?;
        let permission_id = require_known(
            &current.application_resource_permission_id,
            "application_resource_permission_id",
        )?;

        let outcome = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::retry_on_lagging_permissions,
            || {
                self.client
                    .read_role_permissions(&environment_id, &application_role_id)
            },
        )
        .await;

        let permissions = match outcome {
            Ok(permissions) => permissions,
            Err(error) => return recover_gone(error),
        };

        match permissions
            .into_iter()
            .find(|permission| permission.id == permission_id)
        {
            Some(dto) => Ok(ReadOutcome::Current(ApplicationRolePermission::flatten(
                dto,
                environment_id,
                application_role_id,
            ))),
            None => Ok(ReadOutcome::Gone(not_found_warning())),
        }
    }

    /// Every argument forces replacement, so the host never issues an
    /// in-place update for this kind.
    async fn update(
        &self,
        _ctx: &OpContext,
        desired: ApplicationRolePermission,
    ) -> Result<ApplicationRolePermission> {
        ensure_valid(desired.validate())?;
        Ok(desired)
    }

    async fn delete(
        &self,
        ctx: &OpContext,
        current: ApplicationRolePermission,
    ) -> Result<Diagnostics> {
        let environment_id = require_known(&current.environment_id, "environment_id")?;
        let application_role_id =
            require_known(&current.application_role_id, "application_role_id")?;
        let permission_id = require_known(
            &current.application_resource_permission_id,
            "application_resource_permission_id",
        )?;

        let mut diagnostics = Diagnostics::new();
        let outcome = call(
            &self.client,
            ctx.cancel_token(),
            &self.retry,
            &environment_id,
            transport::no_retry,
            || {
                self.client.delete_role_permission(
                    &environment_id,
                    &application_role_id,
                    &permission_id,
                )
            },
        )
        .await;

        if let Err(error) = outcome {
            recover_deleted(error, &mut diagnostics)?;
        }
        Ok(diagnostics)
    }

    fn import(&self, id: &str) -> Result<ApplicationRolePermission> {
        let parsed = import::parse(id, &IMPORT_COMPONENTS).context(ImportSnafu)?;
        Ok(ApplicationRolePermission {
            environment_id: Value::Known(
                parsed
                    .require_resource_id("environment_id")
                    .context(ImportSnafu)?,
            ),
            application_role_id: Value::Known(
                parsed
                    .require_resource_id("application_role_id")
                    .context(ImportSnafu)?,
            ),
            application_resource_permission_id: Value::Known(
                parsed
                    .require_resource_id("application_resource_permission_id")
                    .context(ImportSnafu)?,
            ),
            ..ApplicationRolePermission::default()
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

    fn grant() -> ApplicationRolePermission {
        ApplicationRolePermission {
            environment_id: Value::Known(resource_id(1)),
            application_role_id: Value::Known(resource_id(2)),
            application_resource_permission_id: Value::Known(resource_id(3)),
            ..ApplicationRolePermission::default()
        }
    }

    #[test]
    fn all_three_links_are_required() {
        let diagnostics = ApplicationRolePermission::default().validate();

        assert_eq!(diagnostics.errors().count(), 3);
    }

    #[test]
    fn expand_produces_a_bare_reference() {
        let body = grant().expand().unwrap();

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"id": "00000000-0000-4000-8000-000000000003"})
        );
    }

    #[test]
    fn flatten_copies_computed_attributes() {
        let response = json!({
            "id": "00000000-0000-4000-8000-000000000003",
            "action": "payments:read",
            "key": "payments:read:self",
            "resource": {"id": "00000000-0000-4000-8000-000000000007", "name": "Payments"},
        });
        let dto: RolePermissionDto = serde_json::from_value(response).unwrap();

        let state =
            ApplicationRolePermission::flatten(dto, resource_id(1), resource_id(2));

        assert_eq!(state.action, Value::Known("payments:read".to_owned()));
        assert_eq!(state.description, Value::Null);
        assert_eq!(
            state.resource.as_known().unwrap().name,
            Value::Known("Payments".to_owned())
        );
    }
}
