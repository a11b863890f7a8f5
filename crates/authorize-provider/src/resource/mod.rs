//! One reconciler per resource kind.
//!
//! A reconciler owns a REST client and drives the five-operation contract:
//! validate and expand the declared state, call the service, flatten the
//! response back over the model. Reads that find nothing and deletes of
//! already-deleted resources recover locally; everything else surfaces as
//! an [`Error`].

pub mod api_service;
pub mod api_service_operation;
pub mod application_role_permission;
pub mod decision_endpoint;
pub mod deployment;
pub mod trust_framework;

use std::future::Future;

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;

use crate::{
    diagnostic::{Diagnostic, Diagnostics},
    id::ResourceId,
    import::ImportIdParseError,
    path::AttributePath,
    transport::{self, ApiError, EnvironmentClient, RetryPolicy},
    value::Value,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a reconcile operation failed.
#[derive(Debug, Snafu)]
pub enum Error {
    /// The declared configuration violates the kind's schema; nothing was
    /// sent upstream.
    #[snafu(display("configuration invalid: {diagnostics}"))]
    Validation { diagnostics: Diagnostics },

    /// The service answered outside its documented shape.
    #[snafu(display("unexpected response from the service: {diagnostic}"))]
    Drift { diagnostic: Diagnostic },

    #[snafu(display("request failed"))]
    Transport { source: transport::Error },

    #[snafu(display("malformed import id"))]
    Import { source: ImportIdParseError },
}

impl Error {
    pub(crate) fn drift(diagnostic: Diagnostic) -> Self {
        Self::Drift { diagnostic }
    }

    pub(crate) fn invalid(diagnostic: Diagnostic) -> Self {
        Self::Validation {
            diagnostics: diagnostic.into(),
        }
    }
}

/// Concrete value of an attribute no remote call can run without, such as
/// `environment_id` or the primary `id`.
pub(crate) fn require_known<T: Clone>(value: &Value<T>, name: &str) -> Result<T> {
    value
        .expand_required(&AttributePath::dotted(name))
        .map(Clone::clone)
        .map_err(Error::invalid)
}

/// Fails with [`Error::Validation`] when the collected diagnostics contain
/// at least one error.
pub(crate) fn ensure_valid(diagnostics: Diagnostics) -> Result<()> {
    if diagnostics.has_errors() {
        ValidationSnafu { diagnostics }.fail()
    } else {
        Ok(())
    }
}

/// What a read found upstream.
#[derive(Clone, Debug)]
pub enum ReadOutcome<S> {
    /// The resource exists; the carried state reflects the response.
    Current(S),

    /// The resource, or its whole environment, is gone. The host should
    /// drop it from state; the warning says why.
    Gone(Diagnostic),
}

impl<S> ReadOutcome<S> {
    pub fn into_current(self) -> Option<S> {
        match self {
            Self::Current(state) => Some(state),
            Self::Gone(_) => None,
        }
    }

    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone(_))
    }
}

pub(crate) fn not_found_warning() -> Diagnostic {
    Diagnostic::warning(
        "Requested resource not found",
        "The requested resource cannot be found upstream. If it is still recorded in state, \
         it may have been deleted outside of this provider.",
    )
}

fn environment_gone_warning(environment_id: &ResourceId) -> Diagnostic {
    Diagnostic::warning(
        "Environment no longer exists",
        format!(
            "Environment {environment_id} containing this resource has been deleted; the \
             resource is treated as removed."
        ),
    )
}

/// Converts not-found and environment-gone failures on a read into
/// [`ReadOutcome::Gone`]; every other failure propagates.
pub(crate) fn recover_gone<S>(error: Error) -> Result<ReadOutcome<S>> {
    match error {
        Error::Transport {
            source: transport::Error::NotFound,
        } => Ok(ReadOutcome::Gone(not_found_warning())),
        Error::Transport {
            source: transport::Error::EnvironmentGone { environment_id },
        } => Ok(ReadOutcome::Gone(environment_gone_warning(&environment_id))),
        other => Err(other),
    }
}

/// Deleting something already gone counts as success, with a warning so
/// the operator knows the delete was a no-op.
pub(crate) fn recover_deleted(error: Error, diagnostics: &mut Diagnostics) -> Result<()> {
    match error {
        Error::Transport {
            source: transport::Error::NotFound,
        } => {
            diagnostics.push(not_found_warning());
            Ok(())
        }
        Error::Transport {
            source: transport::Error::EnvironmentGone { environment_id },
        } => {
            diagnostics.push(environment_gone_warning(&environment_id));
            Ok(())
        }
        other => Err(other),
    }
}

/// Runs one remote operation: retry per `retryable`, then reclassify
/// permission-shaped failures against the containing environment.
pub(crate) async fn call<T, Fut>(
    environments: &dyn EnvironmentClient,
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    environment_id: &ResourceId,
    retryable: impl Fn(&ApiError) -> bool,
    operation: impl FnMut() -> Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T, ApiError>>,
{
    match transport::execute(cancel, policy, retryable, operation).await {
        Ok(value) => Ok(value),
        Err(error) => {
            Err(transport::check_environment_gone(environments, environment_id, error).await)
                .context(TransportSnafu)
        }
    }
}

/// Per-operation context handed in by the host.
#[derive(Clone, Debug, Default)]
pub struct OpContext {
    cancel: CancellationToken,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ties the operation to a host-owned token so an apply can be
    /// interrupted between requests.
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// The five-operation contract every resource kind implements.
///
/// `create` and `update` validate and expand the declared state, call the
/// service, and flatten the response into the returned state. `read`
/// refreshes the state or reports the resource gone. `delete` returns the
/// warnings it accumulated. `import` parses a composite id into a skeleton
/// state for the first refresh.
#[async_trait]
pub trait Reconcile {
    type State: Send;

    async fn create(&self, ctx: &OpContext, desired: Self::State) -> Result<Self::State>;

    async fn read(&self, ctx: &OpContext, current: Self::State)
    -> Result<ReadOutcome<Self::State>>;

    async fn update(&self, ctx: &OpContext, desired: Self::State) -> Result<Self::State>;

    async fn delete(&self, ctx: &OpContext, current: Self::State) -> Result<Diagnostics>;

    fn import(&self, id: &str) -> Result<Self::State>;
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::*;
    use crate::transport::ErrorModel;

    fn environment_id() -> ResourceId {
        "99999999-8888-7777-6666-555555555555".parse().unwrap()
    }

    fn transport_error(source: transport::Error) -> Error {
        Error::Transport { source }
    }

    #[test]
    fn read_recovers_not_found_with_a_warning() {
        let outcome: ReadOutcome<()> =
            recover_gone(transport_error(transport::Error::NotFound)).unwrap();

        match outcome {
            ReadOutcome::Gone(warning) => {
                assert_eq!(warning.summary(), "Requested resource not found");
            }
            ReadOutcome::Current(()) => panic!("expected the resource to be gone"),
        }
    }

    #[test]
    fn read_recovers_environment_gone_naming_the_environment() {
        let outcome: ReadOutcome<()> = recover_gone(transport_error(
            transport::Error::EnvironmentGone {
                environment_id: environment_id(),
            },
        ))
        .unwrap();

        match outcome {
            ReadOutcome::Gone(warning) => {
                assert!(warning.detail().contains("99999999-8888-7777-6666-555555555555"));
            }
            ReadOutcome::Current(()) => panic!("expected the resource to be gone"),
        }
    }

    #[test]
    fn read_propagates_other_transport_errors() {
        let error = transport_error(transport::Error::Permanent {
            source: ApiError::Response {
                status: StatusCode::CONFLICT,
                error: ErrorModel::default(),
            },
        });

        assert!(recover_gone::<()>(error).is_err());
    }

    #[test]
    fn delete_of_missing_resource_succeeds_with_warning() {
        let mut diagnostics = Diagnostics::new();

        recover_deleted(transport_error(transport::Error::NotFound), &mut diagnostics).unwrap();

        assert_eq!(diagnostics.len(), 1);
        assert!(!diagnostics.has_errors());
    }

    #[test]
    fn valid_configuration_passes_through() {
        assert!(ensure_valid(Diagnostics::new()).is_ok());
    }

    #[test]
    fn invalid_configuration_carries_its_diagnostics() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.push(Diagnostic::error("Missing required attribute", "name"));

        match ensure_valid(diagnostics) {
            Err(Error::Validation { diagnostics }) => assert_eq!(diagnostics.len(), 1),
            other => panic!("expected a validation error, got {other:?}"),
        }
    }
}
