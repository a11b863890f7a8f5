//! Declarative reconciliation core for the Authorize subsystem of a
//! PingOne tenant.
//!
//! Each remote resource kind (API services and their operations,
//! deployments, decision endpoints, application role permissions and the
//! trust framework editor entities) is exposed through the five-operation
//! [`Reconcile`](resource::Reconcile) contract: create, read, update,
//! delete and import. The shared machinery lives in the leaf modules:
//! tri-state [`Value`](value::Value)s, per-kind [`schema`]s, expression
//! tree codecs in [`expr`], the retrying [`transport`] adapter and the
//! composite [`import`] id parser.
//!
//! The host engine owns planning, state persistence and credentials; this
//! crate only maps declared state to REST calls and responses back to
//! recorded state.

pub mod diagnostic;
pub mod expr;
pub mod id;
pub mod import;
pub mod path;
pub mod resource;
pub mod schema;
pub mod transport;
pub mod value;

pub use diagnostic::{Diagnostic, Diagnostics, Severity};
pub use id::ResourceId;
pub use path::AttributePath;
pub use resource::{OpContext, ReadOutcome, Reconcile};
pub use value::Value;
