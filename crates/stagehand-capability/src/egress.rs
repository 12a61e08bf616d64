//! Default-deny outbound host allowlist
//!
//! Patterns:
//! - exact literal: `api.github.com`
//! - wildcard-all: `*`
//! - subdomain wildcard: `*.example.com` matches `api.example.com` and
//!   `a.b.example.com`, but never `example.com` itself
//!
//! Matching is case-insensitive. A host that matches no pattern is refused
//! before any I/O happens.

use crate::error::CapabilityError;
use std::sync::Arc;
use url::Url;

/// Check a single pattern against a host
#[must_use]
pub fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim().to_ascii_lowercase();
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();

    if host.is_empty() {
        return false;
    }
    if pattern == "*" {
        return true;
    }
    if let Some(domain) = pattern.strip_prefix('*') {
        // `domain` keeps its leading dot: ".example.com"
        return domain.starts_with('.') && host.len() > domain.len() && host.ends_with(domain);
    }
    pattern == host
}

/// Outbound allowlist declared by a capability
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EgressPolicy {
    patterns: Vec<String>,
}

impl EgressPolicy {
    /// Create from patterns
    #[must_use]
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    /// Policy that refuses every host
    #[inline]
    #[must_use]
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// Declared patterns
    #[inline]
    #[must_use]
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether any pattern admits `host`
    #[must_use]
    pub fn allows(&self, host: &str) -> bool {
        self.patterns.iter().any(|p| host_matches(p, host))
    }
}

/// Gate handed to a capability's unit of work
///
/// Handlers must call [`EgressGate::authorize`] (or
/// [`EgressGate::authorize_host`]) before every outbound call and propagate
/// the error with `?` when it fails.
#[derive(Debug, Clone)]
pub struct EgressGate {
    capability: Arc<str>,
    policy: EgressPolicy,
}

impl EgressGate {
    /// Create a gate for `capability`
    #[must_use]
    pub fn new(capability: &str, policy: EgressPolicy) -> Self {
        Self {
            capability: Arc::from(capability),
            policy,
        }
    }

    /// Authorize a call to `url`, returning the parsed URL
    ///
    /// # Errors
    /// `OUTBOUND_HOST_NOT_ALLOWED` if the URL has no host or the host is not
    /// on the allowlist.
    pub fn authorize(&self, url: &str) -> Result<Url, CapabilityError> {
        let parsed = Url::parse(url)
            .map_err(|_| CapabilityError::outbound_denied(&self.capability, url))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| CapabilityError::outbound_denied(&self.capability, url))?
            .to_string();
        self.authorize_host(&host)?;
        Ok(parsed)
    }

    /// Authorize a call to a bare host name
    ///
    /// # Errors
    /// `OUTBOUND_HOST_NOT_ALLOWED` if the host is not on the allowlist.
    pub fn authorize_host(&self, host: &str) -> Result<(), CapabilityError> {
        if self.policy.allows(host) {
            tracing::debug!(capability = %self.capability, host, "outbound host allowed");
            Ok(())
        } else {
            tracing::warn!(capability = %self.capability, host, "outbound host refused");
            Err(CapabilityError::outbound_denied(&self.capability, host))
        }
    }
}
