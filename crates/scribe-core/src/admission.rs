//! Admission of connections.
//!
//! Authentication happens outside the core and yields an [`Identity`]. Before
//! a session is created the identity is checked against an [`AccessPolicy`]
//! for the requested document. Rejections never reach the hub.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::room::validate_document_id;

/// A verified caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable user identifier.
    pub user_id: String,
    /// Display name, if known.
    pub display_name: Option<String>,
    /// Workspace the caller is currently operating in.
    pub workspace_id: Option<String>,
}

impl Identity {
    /// Create an identity with only a user ID.
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            workspace_id: None,
        }
    }

    /// Attach a display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Attach the current workspace.
    #[must_use]
    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }
}

/// Admission errors.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// No verified identity.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// The identity may not open this document.
    #[error("User {user} may not access document {document}")]
    Forbidden {
        /// Rejected user.
        user: String,
        /// Requested document.
        document: String,
    },

    /// The document identifier is malformed.
    #[error("Invalid document id: {0}")]
    InvalidDocument(&'static str),
}

impl AdmissionError {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::Unauthenticated(_) => "unauthenticated",
            AdmissionError::Forbidden { .. } => "forbidden",
            AdmissionError::InvalidDocument(_) => "invalid_document",
        }
    }
}

/// Decides whether an identity may open a document.
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    /// Allow or deny access.
    async fn authorize(&self, identity: &Identity, document_id: &str) -> Result<(), AdmissionError>;
}

/// Admits every authenticated identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAuthenticated;

#[async_trait]
impl AccessPolicy for AllowAuthenticated {
    async fn authorize(&self, identity: &Identity, _document_id: &str) -> Result<(), AdmissionError> {
        if identity.user_id.is_empty() {
            return Err(AdmissionError::Unauthenticated("empty user id".into()));
        }
        Ok(())
    }
}

/// Validate the document identifier and consult the policy.
///
/// # Errors
///
/// Returns the reason the connection must be rejected.
pub async fn admit(
    policy: &dyn AccessPolicy,
    identity: &Identity,
    document_id: &str,
) -> Result<(), AdmissionError> {
    validate_document_id(document_id).map_err(AdmissionError::InvalidDocument)?;
    policy.authorize(identity, document_id).await?;
    debug!(user = %identity.user_id, document = %document_id, "Admitted");
    Ok(())
}
