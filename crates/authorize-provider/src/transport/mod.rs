//! Talking to the remote service.
//!
//! Per-kind clients return raw [`ApiError`]s; this module turns those into
//! the taxonomy the reconcilers act on. Transient failures retry with
//! exponential backoff, deletes blocked on referential integrity retry
//! until the referencing entity is gone, and permissions failures are
//! double-checked against the containing environment, which may itself
//! have been deleted. Cancellation is cooperative and observed before
//! every request and between attempts.

pub mod backoff;

use std::{fmt::Display, future::Future, sync::LazyLock};

use async_trait::async_trait;
use http::StatusCode;
use regex::Regex;
use snafu::{Snafu, ensure};
use tokio_util::sync::CancellationToken;

pub use backoff::RetryPolicy;

use crate::id::ResourceId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

static ACTOR_NOT_AUTHORIZED_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("^The actor attempting to perform the request is not authorized")
        .expect("failed to compile actor authorization regex")
});

/// The error body the service attaches to non-2xx responses.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorModel {
    pub id: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<ErrorDetail>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorDetail {
    pub code: Option<String>,
    pub target: Option<String>,
    pub message: Option<String>,
}

impl Display for ErrorModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code.as_deref().unwrap_or("UNKNOWN"))?;
        if let Some(message) = &self.message {
            write!(f, " ({message})")?;
        }
        Ok(())
    }
}

/// A single failed exchange with the service.
#[derive(Clone, Debug, PartialEq, Eq, Snafu)]
pub enum ApiError {
    #[snafu(display("service responded with {status}: {error}"))]
    Response { status: StatusCode, error: ErrorModel },

    #[snafu(display("request never completed: {message}"))]
    Network { message: String },
}

impl ApiError {
    pub fn not_found() -> Self {
        Self::Response {
            status: StatusCode::NOT_FOUND,
            error: ErrorModel {
                code: Some("NOT_FOUND".to_owned()),
                ..ErrorModel::default()
            },
        }
    }

    pub fn error_model(&self) -> Option<&ErrorModel> {
        match self {
            Self::Response { error, .. } => Some(error),
            Self::Network { .. } => None,
        }
    }

    /// HTTP 404 or the service's `NOT_FOUND` error code.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Response { status, error } => {
                *status == StatusCode::NOT_FOUND || error.code.as_deref() == Some("NOT_FOUND")
            }
            Self::Network { .. } => false,
        }
    }

    /// Worth retrying no matter the operation: the request never reached
    /// the service, or the service itself failed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Response { status, .. } => status.is_server_error(),
        }
    }
}

/// What a failed operation means for the reconciler.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("operation cancelled by the host"))]
    Cancelled,

    /// The resource is absent upstream. Recovered locally on Read and
    /// Delete, surfaced on Create and Update.
    #[snafu(display("resource not found"))]
    NotFound,

    /// The containing environment has been deleted; every child resource
    /// is gone with it.
    #[snafu(display("environment {environment_id} no longer exists"))]
    EnvironmentGone { environment_id: ResourceId },

    #[snafu(display("request still failing after {attempts} attempts"))]
    TransientExhausted { attempts: u32, source: ApiError },

    /// A delete kept failing because another entity still references this
    /// one.
    #[snafu(display("entity still referenced after {attempts} attempts"))]
    ReferencesRemain { attempts: u32, source: ApiError },

    #[snafu(display("service rejected the request"))]
    Permanent { source: ApiError },

    #[snafu(display("resource still present after {attempts} deletion checks"))]
    StillPresent { attempts: u32 },
}

/// Retry condition for creates and reads: permissions on freshly created
/// resources can lag, during which the service reports the actor as
/// unauthorized.
pub fn retry_on_lagging_permissions(error: &ApiError) -> bool {
    error.is_transient()
        || error
            .error_model()
            .and_then(|model| model.message.as_deref())
            .is_some_and(|message| ACTOR_NOT_AUTHORIZED_REGEX.is_match(message))
}

/// Retry condition for editor deletes: `REQUEST_FAILED` with an "entity is
/// referenced" message means the referencing entity may itself be
/// mid-deletion. Any other `REQUEST_FAILED` is fatal.
pub fn retry_on_referenced_entity(error: &ApiError) -> bool {
    error.is_transient() || is_referenced_entity(error)
}

/// Retry condition for updates and non-editor deletes: fail fast and let
/// the host re-plan.
pub fn no_retry(_: &ApiError) -> bool {
    false
}

fn is_referenced_entity(error: &ApiError) -> bool {
    let Some(model) = error.error_model() else {
        return false;
    };
    if model.code.as_deref() != Some("REQUEST_FAILED") {
        return false;
    }

    let phrase = "entity is referenced";
    model
        .message
        .as_deref()
        .is_some_and(|message| message.contains(phrase))
        || model
            .details
            .iter()
            .any(|detail| detail.message.as_deref().is_some_and(|m| m.contains(phrase)))
}

fn permanent(error: ApiError) -> Error {
    if error.is_not_found() {
        Error::NotFound
    } else {
        Error::Permanent { source: error }
    }
}

fn exhausted(attempts: u32, error: ApiError) -> Error {
    if is_referenced_entity(&error) {
        Error::ReferencesRemain {
            attempts,
            source: error,
        }
    } else {
        Error::TransientExhausted {
            attempts,
            source: error,
        }
    }
}

/// Runs `operation` until it succeeds, fails permanently, exhausts the
/// retry budget, or the host cancels.
///
/// `retryable` widens the built-in transient class with operation-specific
/// conditions; 404s always map to [`Error::NotFound`] without retrying.
pub async fn execute<T, Fut>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    retryable: impl Fn(&ApiError) -> bool,
    mut operation: impl FnMut() -> Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 1;

    loop {
        ensure!(!cancel.is_cancelled(), CancelledSnafu);

        let outcome = tokio::select! {
            () = cancel.cancelled() => return CancelledSnafu.fail(),
            outcome = operation() => outcome,
        };

        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if error.is_not_found() || !retryable(&error) {
            return Err(permanent(error));
        }

        if attempt >= policy.max_attempts {
            return Err(exhausted(attempt, error));
        }

        let delay = backoff::jittered(backoff::base_delay(policy, attempt));
        tracing::warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "request failed, retrying"
        );
        tokio::select! {
            () = cancel.cancelled() => return CancelledSnafu.fail(),
            () = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}

/// Read access to the management surface, used to tell "permission denied"
/// on a live environment from "the whole environment is gone".
#[async_trait]
pub trait EnvironmentClient: Send + Sync {
    /// Succeeds when the environment exists; a not-found [`ApiError`]
    /// means it has been deleted.
    async fn read_environment(&self, environment_id: &ResourceId) -> Result<(), ApiError>;
}

/// Rewrites permission-shaped failures into [`Error::EnvironmentGone`]
/// when the containing environment turns out to have been deleted.
///
/// The service answers 400, 401 or 403 for children of deleted
/// environments, so those three are double-checked with a management read.
pub async fn check_environment_gone(
    environments: &dyn EnvironmentClient,
    environment_id: &ResourceId,
    error: Error,
) -> Error {
    let suspicious = matches!(
        &error,
        Error::Permanent {
            source: ApiError::Response { status, .. }
        } if [
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::FORBIDDEN,
        ]
        .contains(status)
    );
    if !suspicious {
        return error;
    }

    match environments.read_environment(environment_id).await {
        Err(probe) if probe.is_not_found() => {
            tracing::warn!(
                %environment_id,
                "environment no longer exists, overriding permissions error"
            );
            Error::EnvironmentGone {
                environment_id: environment_id.clone(),
            }
        }
        _ => error,
    }
}

/// Polls `read` until the resource reports not found.
///
/// Editor entities linger briefly after a delete; creating a replacement
/// while the purge is still running would reference the stale entity.
pub async fn wait_until_purged<Fut>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    mut read: impl FnMut() -> Fut,
) -> Result<()>
where
    Fut: Future<Output = Result<(), ApiError>>,
{
    for attempt in 1..=policy.max_attempts {
        let outcome = tokio::select! {
            () = cancel.cancelled() => return CancelledSnafu.fail(),
            outcome = read() => outcome,
        };

        match outcome {
            Err(error) if error.is_not_found() => return Ok(()),
            Ok(()) => {
                tracing::debug!(attempt, "entity still present after delete");
            }
            Err(error) if error.is_transient() => {
                tracing::debug!(attempt, error = %error, "transient error while waiting for purge");
            }
            Err(error) => return Err(permanent(error)),
        }

        if attempt < policy.max_attempts {
            let delay = backoff::jittered(backoff::base_delay(policy, attempt));
            tokio::select! {
                () = cancel.cancelled() => return CancelledSnafu.fail(),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    StillPresentSnafu {
        attempts: policy.max_attempts,
    }
    .fail()
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use rstest::rstest;

    use super::*;

    fn request_failed(message: &str) -> ApiError {
        ApiError::Response {
            status: StatusCode::BAD_REQUEST,
            error: ErrorModel {
                code: Some("REQUEST_FAILED".to_owned()),
                message: Some(message.to_owned()),
                ..ErrorModel::default()
            },
        }
    }

    fn server_error() -> ApiError {
        ApiError::Response {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: ErrorModel::default(),
        }
    }

    struct LiveEnvironment;
    struct GoneEnvironment;

    #[async_trait]
    impl EnvironmentClient for LiveEnvironment {
        async fn read_environment(&self, _: &ResourceId) -> Result<(), ApiError> {
            Ok(())
        }
    }

    #[async_trait]
    impl EnvironmentClient for GoneEnvironment {
        async fn read_environment(&self, _: &ResourceId) -> Result<(), ApiError> {
            Err(ApiError::not_found())
        }
    }

    fn environment_id() -> ResourceId {
        "11111111-2222-3333-4444-555555555555".parse().unwrap()
    }

    #[rstest]
    #[case::referenced("the entity is referenced by another entity", true)]
    #[case::other_message("the request body is malformed", false)]
    fn referenced_entity_needs_the_exact_phrase(#[case] message: &str, #[case] expected: bool) {
        assert_eq!(retry_on_referenced_entity(&request_failed(message)), expected);
    }

    #[test]
    fn referenced_entity_requires_request_failed_code() {
        let error = ApiError::Response {
            status: StatusCode::BAD_REQUEST,
            error: ErrorModel {
                code: Some("INVALID_DATA".to_owned()),
                message: Some("entity is referenced".to_owned()),
                ..ErrorModel::default()
            },
        };

        assert!(!retry_on_referenced_entity(&error));
    }

    #[test]
    fn lagging_permissions_matches_prefix_only() {
        let lagging = ApiError::Response {
            status: StatusCode::FORBIDDEN,
            error: ErrorModel {
                message: Some(
                    "The actor attempting to perform the request is not authorized.".to_owned(),
                ),
                ..ErrorModel::default()
            },
        };
        let other = ApiError::Response {
            status: StatusCode::FORBIDDEN,
            error: ErrorModel {
                message: Some("Some other message".to_owned()),
                ..ErrorModel::default()
            },
        };

        assert!(retry_on_lagging_permissions(&lagging));
        assert!(!retry_on_lagging_permissions(&other));
    }

    #[tokio::test]
    async fn referenced_entity_delete_succeeds_on_second_attempt() {
        let cancel = CancellationToken::new();
        let calls = Cell::new(0_u32);

        let outcome = execute(
            &cancel,
            &RetryPolicy::immediate(5),
            retry_on_referenced_entity,
            || {
                let call = calls.get() + 1;
                calls.set(call);
                async move {
                    if call == 1 {
                        Err(request_failed("entity is referenced"))
                    } else {
                        Ok(())
                    }
                }
            },
        )
        .await;

        assert!(outcome.is_ok());
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn unclassified_request_failed_is_permanent_immediately() {
        let cancel = CancellationToken::new();
        let calls = Cell::new(0_u32);

        let outcome: Result<()> = execute(
            &cancel,
            &RetryPolicy::immediate(5),
            retry_on_referenced_entity,
            || {
                calls.set(calls.get() + 1);
                async { Err(request_failed("something else went wrong")) }
            },
        )
        .await;

        assert!(matches!(outcome, Err(Error::Permanent { .. })));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_reports_attempt_count() {
        let cancel = CancellationToken::new();

        let outcome: Result<()> =
            execute(&cancel, &RetryPolicy::immediate(3), ApiError::is_transient, || async {
                Err(server_error())
            })
            .await;

        assert!(matches!(
            outcome,
            Err(Error::TransientExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn not_found_is_never_retried() {
        let cancel = CancellationToken::new();
        let calls = Cell::new(0_u32);

        let outcome: Result<()> =
            execute(&cancel, &RetryPolicy::immediate(5), |_| true, || {
                calls.set(calls.get() + 1);
                async { Err(ApiError::not_found()) }
            })
            .await;

        assert!(matches!(outcome, Err(Error::NotFound)));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_the_request() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome: Result<()> =
            execute(&cancel, &RetryPolicy::immediate(5), |_| true, || async { Ok(()) }).await;

        assert!(matches!(outcome, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn environment_probe_overrides_permission_errors() {
        let error = permanent(ApiError::Response {
            status: StatusCode::FORBIDDEN,
            error: ErrorModel::default(),
        });

        let rewritten = check_environment_gone(&GoneEnvironment, &environment_id(), error).await;

        assert!(matches!(rewritten, Error::EnvironmentGone { .. }));
    }

    #[tokio::test]
    async fn live_environment_keeps_the_original_error() {
        let error = permanent(ApiError::Response {
            status: StatusCode::FORBIDDEN,
            error: ErrorModel::default(),
        });

        let kept = check_environment_gone(&LiveEnvironment, &environment_id(), error).await;

        assert!(matches!(kept, Error::Permanent { .. }));
    }

    #[tokio::test]
    async fn server_errors_are_not_probed() {
        let error = permanent(server_error());

        let kept = check_environment_gone(&GoneEnvironment, &environment_id(), error).await;

        assert!(matches!(kept, Error::Permanent { .. }));
    }

    #[tokio::test]
    async fn purge_wait_finishes_once_entity_is_gone() {
        let cancel = CancellationToken::new();
        let calls = Cell::new(0_u32);

        let outcome = wait_until_purged(&cancel, &RetryPolicy::immediate(5), || {
            let call = calls.get() + 1;
            calls.set(call);
            async move {
                if call < 3 {
                    Ok(())
                } else {
                    Err(ApiError::not_found())
                }
            }
        })
        .await;

        assert!(outcome.is_ok());
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn purge_wait_gives_up_on_a_lingering_entity() {
        let cancel = CancellationToken::new();

        let outcome =
            wait_until_purged(&cancel, &RetryPolicy::immediate(2), || async { Ok(()) }).await;

        assert!(matches!(outcome, Err(Error::StillPresent { attempts: 2 })));
    }
}
