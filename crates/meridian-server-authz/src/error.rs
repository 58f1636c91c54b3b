// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use meridian_authz_core::{CoreError, PolicyVersionId, TenantId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthzError {
	#[error("Database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("Serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("Policy version {policy_version_id} not found for tenant {tenant_id}")]
	PolicyVersionNotFound {
		tenant_id: TenantId,
		policy_version_id: PolicyVersionId,
	},

	#[error("Subject resolution failed: {0}")]
	SubjectResolution(String),

	#[error("Store error: {0}")]
	Store(String),

	#[error("Collaborator error: {0}")]
	Collaborator(String),

	#[error("Internal: {0}")]
	Internal(String),

	/// A failure observed by more than one caller of a shared compilation.
	#[error(transparent)]
	Shared(Arc<AuthzError>),

	#[error(transparent)]
	Core(#[from] CoreError),
}

impl AuthzError {
	/// Recovers the owned error when this caller is the last holder.
	pub fn from_shared(error: Arc<AuthzError>) -> Self {
		Arc::try_unwrap(error).unwrap_or_else(AuthzError::Shared)
	}
}

pub type Result<T> = std::result::Result<T, AuthzError>;
