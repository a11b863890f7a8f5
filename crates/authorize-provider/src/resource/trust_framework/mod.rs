//! Trust-framework editor entities: attributes, conditions, processors,
//! services and policy statements.
//!
//! The editor enforces optimistic concurrency. Updates are a
//! read-then-write pair: the version fetched immediately before the PUT
//! goes into the body, and a stale version is a conflict for the host to
//! re-plan. Deletes are asynchronous upstream; the entity lingers until
//! a background purge runs, so deletion polls until the entity is gone
//! and downgrades a still-running purge to a warning.

use std::{future::Future, time::Duration};

use snafu::ResultExt;

use crate::{
    diagnostic::{Diagnostic, Diagnostics},
    id::ResourceId,
    resource::{OpContext, Result, TransportSnafu, call, recover_deleted},
    transport::{self, ApiError, EnvironmentClient, RetryPolicy},
};

pub mod attribute;
pub mod condition;
pub mod processor;
pub mod service;
pub mod statement;

/// Poll cadence while waiting for a deleted entity to disappear.
pub const PURGE_POLICY: RetryPolicy = RetryPolicy {
    max_attempts: 10,
    base_delay: Duration::from_millis(500),
    max_delay: Duration::from_secs(5),
};

fn purge_timeout_warning(attempts: u32) -> Diagnostic {
    Diagnostic::warning(
        "Deleted entity may still be purging",
        format!(
            "The service still reported the entity after {attempts} checks. A replacement \
             created right away can conflict with it until the purge completes."
        ),
    )
}

/// Deletes an editor entity, then polls `probe` until it reports not
/// found.
///
/// The delete retries while the service reports dangling references;
/// sibling deletes may still be releasing them. A purge that outlasts
/// the poll budget becomes a warning rather than an error.
pub(crate) async fn delete_and_purge<DeleteFut, ProbeFut>(
    environments: &dyn EnvironmentClient,
    ctx: &OpContext,
    retry: &RetryPolicy,
    purge: &RetryPolicy,
    environment_id: &ResourceId,
    delete: impl FnMut() -> DeleteFut,
    probe: impl FnMut() -> ProbeFut,
) -> Result<Diagnostics>
where
    DeleteFut: Future<Output = Result<(), ApiError>>,
    ProbeFut: Future<Output = Result<(), ApiError>>,
{
    let mut diagnostics = Diagnostics::new();

    let outcome = call(
        environments,
        ctx.cancel_token(),
        retry,
        environment_id,
        transport::retry_on_referenced_entity,
        delete,
    )
    .await;

    if let Err(error) = outcome {
        recover_deleted(error, &mut diagnostics)?;
        return Ok(diagnostics);
    }

    match transport::wait_until_purged(ctx.cancel_token(), purge, probe).await {
        Ok(()) => {}
        Err(transport::Error::StillPresent { attempts }) => {
            diagnostics.push(purge_timeout_warning(attempts));
        }
        Err(error) => {
            let error =
                transport::check_environment_gone(environments, environment_id, error).await;
            if !matches!(error, transport::Error::EnvironmentGone { .. }) {
                return Err(error).context(TransportSnafu);
            }
        }
    }

    Ok(diagnostics)
}
