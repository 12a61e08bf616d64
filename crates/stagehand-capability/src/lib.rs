//! Stagehand capabilities
//!
//! Typed, policy-bounded units of side effect.
//!
//! # Core Concepts
//!
//! - [`CapabilityDescriptor`]: static contract (schemas, egress allowlist, retry policy)
//! - [`CapabilityRegistry`]: `(id, version)` to descriptor and handler
//! - [`ExecutionRuntime`]: secret mounting, egress gating and outcome normalization
//! - [`execute_with_retry`]: classified retries with exponential backoff
//!
//! # Example
//!
//! ```rust,ignore
//! use stagehand_capability::prelude::*;
//!
//! let descriptor = CapabilityDescriptor::builder("k8s.apply", CapabilityVersion::new(1, 0, 0))
//!     .allow_outbound(["*.k8s.internal"])
//!     .required_secrets(&["kubeconfig"])
//!     .build()?;
//!
//! let validated = descriptor.validate_invocation(invocation)?;
//! let outcome = execute_with_retry(&runtime, &capability, &validated, &TokioSleep::default()).await;
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod descriptor;
pub mod egress;
pub mod error;
pub mod invocation;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod schema;
pub mod secrets;

pub use descriptor::{
    default_classifier, CapabilityDescriptor, CapabilityVersion, Classifier, DataClassification,
    DescriptorBuilder, Operations, Schemas, SecurityPolicy,
};
pub use egress::{host_matches, EgressGate, EgressPolicy};
pub use error::{
    CapabilityError, CapabilityResult, Classification, DescriptorError, ErrorKind,
    FieldViolation, HandlerError,
};
pub use invocation::{CapabilityInvocation, ExecutionContext, SecretRef, ValidatedInvocation};
pub use registry::{CapabilityRegistry, RegisteredCapability};
pub use retry::{execute_with_retry, DurableSleep, RetryOutcome, RetryPolicy, TokioSleep};
pub use runtime::{CapabilityHandler, ExecutionRuntime, SandboxContext};
pub use schema::SchemaValidator;
pub use secrets::{FileSecretStore, SecretMount, SecretMounts, SecretStore, SecretStoreError};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commonly used types
pub mod prelude {
    pub use crate::descriptor::{CapabilityDescriptor, CapabilityVersion};
    pub use crate::egress::EgressGate;
    pub use crate::error::{CapabilityError, CapabilityResult, ErrorKind, HandlerError};
    pub use crate::invocation::{CapabilityInvocation, ExecutionContext, SecretRef};
    pub use crate::registry::{CapabilityRegistry, RegisteredCapability};
    pub use crate::retry::{execute_with_retry, DurableSleep, RetryPolicy, TokioSleep};
    pub use crate::runtime::{CapabilityHandler, ExecutionRuntime, SandboxContext};
    pub use crate::secrets::SecretStore;
}
