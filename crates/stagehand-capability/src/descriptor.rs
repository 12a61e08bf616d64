//! Capability descriptors
//!
//! A descriptor is the static contract of a capability: typed schemas for
//! input, output, config and secrets, plus declared security and operational
//! metadata. It has no behavior beyond structural validation and is
//! immutable once built. Descriptors are identified by `(id, version)`.

use crate::egress::EgressPolicy;
use crate::error::{CapabilityError, Classification, DescriptorError, HandlerError};
use crate::invocation::{CapabilityInvocation, ValidatedInvocation};
use crate::retry::RetryPolicy;
use crate::schema::SchemaValidator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// `MAJOR.MINOR.PATCH` capability version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapabilityVersion {
    /// Breaking changes
    pub major: u64,
    /// Additive changes
    pub minor: u64,
    /// Fixes
    pub patch: u64,
}

impl CapabilityVersion {
    /// Create a version
    #[inline]
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for CapabilityVersion {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DescriptorError::InvalidVersion(s.to_string());
        let mut parts = s.trim().split('.');
        let mut next = || -> Result<u64, DescriptorError> {
            parts
                .next()
                .ok_or_else(invalid)?
                .parse::<u64>()
                .map_err(|_| invalid())
        };
        let version = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

impl TryFrom<String> for CapabilityVersion {
    type Error = DescriptorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CapabilityVersion> for String {
    fn from(value: CapabilityVersion) -> Self {
        value.to_string()
    }
}

impl fmt::Display for CapabilityVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Sensitivity of the data a capability touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataClassification {
    /// Publicly shareable
    Public,
    /// Internal use only
    #[default]
    Internal,
    /// Confidential business data
    Confidential,
    /// Regulated or credential-bearing data
    Restricted,
}

/// Declared security metadata
#[derive(Debug, Clone, Default)]
pub struct SecurityPolicy {
    /// Scopes the caller must hold
    pub required_scopes: Vec<String>,
    /// Data sensitivity
    pub data_classification: DataClassification,
    /// Outbound host allowlist
    pub egress: EgressPolicy,
}

/// Error classifier declared by a capability
pub type Classifier = Arc<dyn Fn(&HandlerError) -> Classification + Send + Sync>;

/// Default classifier
///
/// Explicit labels win (`TRANSIENT` counts as retryable). Unlabelled
/// failures are retryable when their message looks like a network,
/// connection, timeout or rate-limit failure; everything else is fatal.
#[must_use]
pub fn default_classifier(error: &HandlerError) -> Classification {
    match error {
        HandlerError::Policy(e) if e.retryable => Classification::Retryable,
        HandlerError::Policy(_) => Classification::Fatal,
        HandlerError::Failed {
            label: Some(label), ..
        } => Classification::from_label(label),
        HandlerError::Failed { message, label: None } => {
            const TRANSIENT_MARKERS: &[&str] = &[
                "network",
                "connection",
                "timeout",
                "timed out",
                "rate limit",
                "rate-limit",
                "too many requests",
                "429",
                "503",
                "temporarily unavailable",
                "econnreset",
            ];
            let lower = message.to_ascii_lowercase();
            if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
                Classification::Retryable
            } else {
                Classification::Fatal
            }
        }
    }
}

/// Declared operational metadata
#[derive(Clone)]
pub struct Operations {
    /// Advisory: whether blind retries of the side effect are safe
    pub is_idempotent: bool,
    /// Bounded retry schedule
    pub retry_policy: RetryPolicy,
    /// Error classifier
    pub classifier: Classifier,
    /// Relative cost weight
    pub cost_factor: f64,
    /// Optional per-capability execution timeout
    pub timeout_secs: Option<u64>,
}

impl Operations {
    /// Classify a handler failure
    #[inline]
    #[must_use]
    pub fn classify(&self, error: &HandlerError) -> Classification {
        (self.classifier)(error)
    }
}

impl Default for Operations {
    fn default() -> Self {
        Self {
            is_idempotent: false,
            retry_policy: RetryPolicy::default(),
            classifier: Arc::new(default_classifier),
            cost_factor: 1.0,
            timeout_secs: None,
        }
    }
}

impl fmt::Debug for Operations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operations")
            .field("is_idempotent", &self.is_idempotent)
            .field("retry_policy", &self.retry_policy)
            .field("cost_factor", &self.cost_factor)
            .field("timeout_secs", &self.timeout_secs)
            .finish_non_exhaustive()
    }
}

/// Compiled schemas of a capability
#[derive(Debug, Clone)]
pub struct Schemas {
    /// Invocation arguments
    pub input: SchemaValidator,
    /// Successful output
    pub output: SchemaValidator,
    /// Per-deployment configuration
    pub config: SchemaValidator,
    /// Secret names (`properties`) and which are mandatory (`required`)
    pub secrets: SchemaValidator,
}

impl Default for Schemas {
    fn default() -> Self {
        Self {
            input: SchemaValidator::permissive(),
            output: SchemaValidator::permissive(),
            config: SchemaValidator::permissive(),
            secrets: SchemaValidator::permissive(),
        }
    }
}

/// Static capability contract
#[derive(Debug, Clone)]
pub struct CapabilityDescriptor {
    id: String,
    version: CapabilityVersion,
    schemas: Schemas,
    security: SecurityPolicy,
    operations: Operations,
}

impl CapabilityDescriptor {
    /// Start building a descriptor
    #[must_use]
    pub fn builder(id: impl Into<String>, version: CapabilityVersion) -> DescriptorBuilder {
        DescriptorBuilder::new(id.into(), version)
    }

    /// Namespaced id
    #[inline]
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Published version
    #[inline]
    #[must_use]
    pub fn version(&self) -> CapabilityVersion {
        self.version
    }

    /// Compiled schemas
    #[inline]
    #[must_use]
    pub fn schemas(&self) -> &Schemas {
        &self.schemas
    }

    /// Security metadata
    #[inline]
    #[must_use]
    pub fn security(&self) -> &SecurityPolicy {
        &self.security
    }

    /// Operational metadata
    #[inline]
    #[must_use]
    pub fn operations(&self) -> &Operations {
        &self.operations
    }

    /// Secrets the capability cannot run without
    #[must_use]
    pub fn required_secrets(&self) -> Vec<String> {
        self.schemas.secrets.required_properties()
    }

    /// Every secret name the capability may receive
    #[must_use]
    pub fn declared_secrets(&self) -> Vec<String> {
        let mut names = self.schemas.secrets.declared_properties();
        for required in self.required_secrets() {
            if !names.contains(&required) {
                names.push(required);
            }
        }
        names
    }

    /// Structural check of invocation arguments
    ///
    /// # Errors
    /// `VALIDATION_FAILED` listing the offending fields.
    pub fn validate_input(&self, args: &Value) -> Result<(), CapabilityError> {
        self.schemas
            .input
            .validate(args)
            .map_err(|v| CapabilityError::validation("input", v))
    }

    /// Structural check of a successful output
    ///
    /// # Errors
    /// `VALIDATION_FAILED` listing the offending fields.
    pub fn validate_output(&self, output: &Value) -> Result<(), CapabilityError> {
        self.schemas
            .output
            .validate(output)
            .map_err(|v| CapabilityError::validation("output", v))
    }

    /// Structural check of capability configuration
    ///
    /// # Errors
    /// `VALIDATION_FAILED` listing the offending fields.
    pub fn validate_config(&self, config: &Value) -> Result<(), CapabilityError> {
        self.schemas
            .config
            .validate(config)
            .map_err(|v| CapabilityError::validation("config", v))
    }

    /// Validate an invocation once, before it may enter the runtime
    ///
    /// This is the only way to obtain a [`ValidatedInvocation`].
    ///
    /// # Errors
    /// `UNKNOWN_CAPABILITY` if the invocation targets another id,
    /// `VALIDATION_FAILED` if args or config do not match their schemas.
    pub fn validate_invocation(
        &self,
        invocation: CapabilityInvocation,
    ) -> Result<ValidatedInvocation, CapabilityError> {
        if invocation.cap_id != self.id {
            return Err(CapabilityError::unknown_capability(&invocation.cap_id));
        }
        self.validate_input(&invocation.args)?;
        self.validate_config(&invocation.context.config)?;
        tracing::debug!(
            capability = %self.id,
            version = %self.version,
            trace_id = %invocation.context.trace_id,
            "invocation validated"
        );
        Ok(ValidatedInvocation::new(invocation))
    }
}

/// Builder for [`CapabilityDescriptor`]
#[derive(Debug)]
pub struct DescriptorBuilder {
    id: String,
    version: CapabilityVersion,
    input: Option<Value>,
    output: Option<Value>,
    config: Option<Value>,
    secrets: Option<Value>,
    security: SecurityPolicy,
    operations: Operations,
}

impl DescriptorBuilder {
    fn new(id: String, version: CapabilityVersion) -> Self {
        Self {
            id,
            version,
            input: None,
            output: None,
            config: None,
            secrets: None,
            security: SecurityPolicy::default(),
            operations: Operations::default(),
        }
    }

    /// Input schema
    #[must_use]
    pub fn input_schema(mut self, schema: Value) -> Self {
        self.input = Some(schema);
        self
    }

    /// Output schema
    #[must_use]
    pub fn output_schema(mut self, schema: Value) -> Self {
        self.output = Some(schema);
        self
    }

    /// Config schema
    #[must_use]
    pub fn config_schema(mut self, schema: Value) -> Self {
        self.config = Some(schema);
        self
    }

    /// Secrets schema
    #[must_use]
    pub fn secrets_schema(mut self, schema: Value) -> Self {
        self.secrets = Some(schema);
        self
    }

    /// Require secrets by name, without a full schema
    #[must_use]
    pub fn required_secrets(mut self, names: &[&str]) -> Self {
        let properties: serde_json::Map<String, Value> = names
            .iter()
            .map(|n| ((*n).to_string(), serde_json::json!({ "type": "string" })))
            .collect();
        self.secrets = Some(serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": names,
        }));
        self
    }

    /// Outbound host allowlist
    #[must_use]
    pub fn allow_outbound<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.security.egress = EgressPolicy::new(patterns.into_iter().map(Into::into).collect());
        self
    }

    /// Required caller scopes
    #[must_use]
    pub fn required_scopes(mut self, scopes: &[&str]) -> Self {
        self.security.required_scopes = scopes.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Data classification
    #[must_use]
    pub fn data_classification(mut self, classification: DataClassification) -> Self {
        self.security.data_classification = classification;
        self
    }

    /// Idempotency flag (advisory)
    #[must_use]
    pub fn idempotent(mut self, is_idempotent: bool) -> Self {
        self.operations.is_idempotent = is_idempotent;
        self
    }

    /// Retry schedule
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.operations.retry_policy = policy;
        self
    }

    /// Custom error classifier
    #[must_use]
    pub fn classifier<F>(mut self, classify: F) -> Self
    where
        F: Fn(&HandlerError) -> Classification + Send + Sync + 'static,
    {
        self.operations.classifier = Arc::new(classify);
        self
    }

    /// Cost weight
    #[must_use]
    pub fn cost_factor(mut self, cost: f64) -> Self {
        self.operations.cost_factor = cost;
        self
    }

    /// Execution timeout
    #[must_use]
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.operations.timeout_secs = Some(secs);
        self
    }

    /// Compile schemas and freeze the descriptor
    ///
    /// # Errors
    /// Invalid id, uncompilable schema, out-of-range retry policy or a zero
    /// execution timeout.
    pub fn build(self) -> Result<CapabilityDescriptor, DescriptorError> {
        let namespaced = self
            .id
            .split_once('.')
            .is_some_and(|(ns, name)| !ns.is_empty() && !name.is_empty());
        if !namespaced || self.id.chars().any(char::is_whitespace) {
            return Err(DescriptorError::InvalidId(self.id));
        }
        self.operations.retry_policy.validate()?;
        if self.operations.timeout_secs == Some(0) {
            return Err(DescriptorError::InvalidTimeout);
        }

        let compile = |which: &'static str, schema: Option<Value>| match schema {
            None => Ok(SchemaValidator::permissive()),
            Some(schema) => SchemaValidator::compile(schema)
                .map_err(|reason| DescriptorError::InvalidSchema { which, reason }),
        };

        let schemas = Schemas {
            input: compile("input", self.input)?,
            output: compile("output", self.output)?,
            config: compile("config", self.config)?,
            secrets: compile("secrets", self.secrets)?,
        };

        Ok(CapabilityDescriptor {
            id: self.id,
            version: self.version,
            schemas,
            security: self.security,
            operations: self.operations,
        })
    }
}
