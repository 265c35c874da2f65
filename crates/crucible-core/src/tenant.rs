//! Tenant identity threaded through every unit of work.
//!
//! A [`TenantContext`] is built once per run and cloned into each task
//! envelope. Its fields are private, so neither the queue nor a retry can
//! rewrite the identity a unit was submitted with.

use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantContext {
    org_id: String,
    user_id: String,
    correlation_id: String,
}

impl TenantContext {
    /// New context with a fresh correlation id.
    pub fn new(org_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::with_correlation_id(org_id, user_id, uuid::Uuid::new_v4().to_string())
    }

    pub fn with_correlation_id(
        org_id: impl Into<String>,
        user_id: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            org_id: org_id.into(),
            user_id: user_id.into(),
            correlation_id: correlation_id.into(),
        }
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.org_id.trim().is_empty() {
            return Err(ConfigurationError::InvalidTenant("org_id is empty".into()));
        }
        if self.user_id.trim().is_empty() {
            return Err(ConfigurationError::InvalidTenant("user_id is empty".into()));
        }
        Ok(())
    }
}

impl fmt::Display for TenantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "org={} user={} correlation={}",
            self.org_id, self.user_id, self.correlation_id
        )
    }
}
