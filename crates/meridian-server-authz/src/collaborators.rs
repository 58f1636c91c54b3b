// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Host-supplied collaborators the evaluator depends on.
//!
//! The engine does not know how principals are looked up, how operation codes
//! map to ids, or how a resource's applicable policies are chosen. The host
//! implements these traits over its own identity, catalog and scope-resolution
//! services. The `Static*` implementations back embedded deployments and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use meridian_authz_core::{
	PolicyId, PolicyVersionId, ResourceDescriptor, ScopeType, SubjectSnapshot, TenantId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{AuthzError, Result};

/// An entry of the operation catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
	pub id: String,
	pub code: String,
	pub name: Option<String>,
}

impl Operation {
	pub fn new(id: impl Into<String>, code: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			code: code.into(),
			name: None,
		}
	}
}

/// A policy that applies to a resource, with its currently active version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicablePolicy {
	pub policy_id: PolicyId,
	pub active_version_id: PolicyVersionId,
	pub scope_type: ScopeType,
	pub scope_key: Option<String>,
}

/// Resolves the requesting principal.
#[async_trait]
pub trait SubjectResolver: Send + Sync {
	async fn resolve_subject(&self, principal_id: &str, tenant_id: TenantId) -> Result<SubjectSnapshot>;

	/// Subject-index keys the principal matches. The wildcard key is probed by
	/// the evaluator regardless.
	fn build_subject_keys(&self, subject: &SubjectSnapshot) -> Vec<String> {
		subject.default_subject_keys()
	}
}

/// Maps operation codes to catalog entries.
#[async_trait]
pub trait OperationCatalog: Send + Sync {
	async fn get_operation(&self, operation_code: &str) -> Result<Option<Operation>>;
}

/// Chooses the policies that govern a resource.
#[async_trait]
pub trait PolicyResolution: Send + Sync {
	async fn resolve_policies(
		&self,
		tenant_id: TenantId,
		resource: &ResourceDescriptor,
	) -> Result<Vec<ApplicablePolicy>>;
}

/// Subject resolver over a fixed set of snapshots.
#[derive(Debug, Default)]
pub struct StaticSubjectResolver {
	subjects: RwLock<HashMap<(TenantId, String), SubjectSnapshot>>,
}

impl StaticSubjectResolver {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn insert(&self, subject: SubjectSnapshot) {
		self
			.subjects
			.write()
			.await
			.insert((subject.tenant_id, subject.principal_id.clone()), subject);
	}
}

#[async_trait]
impl SubjectResolver for StaticSubjectResolver {
	async fn resolve_subject(&self, principal_id: &str, tenant_id: TenantId) -> Result<SubjectSnapshot> {
		self
			.subjects
			.read()
			.await
			.get(&(tenant_id, principal_id.to_string()))
			.cloned()
			.ok_or_else(|| {
				AuthzError::SubjectResolution(format!(
					"principal {principal_id} not found in tenant {tenant_id}"
				))
			})
	}
}

/// Operation catalog over a fixed list.
#[derive(Debug, Default)]
pub struct StaticOperationCatalog {
	operations: RwLock<HashMap<String, Operation>>,
}

impl StaticOperationCatalog {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn insert(&self, operation: Operation) {
		self
			.operations
			.write()
			.await
			.insert(operation.code.clone(), operation);
	}
}

#[async_trait]
impl OperationCatalog for StaticOperationCatalog {
	async fn get_operation(&self, operation_code: &str) -> Result<Option<Operation>> {
		Ok(self.operations.read().await.get(operation_code).cloned())
	}
}

/// Policy resolution that returns every registered policy of the tenant whose
/// scope covers the resource.
///
/// A policy keyed to a scope instance applies when the resource's scope key at
/// that level matches; an unkeyed policy applies to every resource.
#[derive(Debug, Default)]
pub struct StaticPolicyResolution {
	policies: RwLock<HashMap<TenantId, Vec<ApplicablePolicy>>>,
}

impl StaticPolicyResolution {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn insert(&self, tenant_id: TenantId, policy: ApplicablePolicy) {
		self
			.policies
			.write()
			.await
			.entry(tenant_id)
			.or_default()
			.push(policy);
	}
}

#[async_trait]
impl PolicyResolution for StaticPolicyResolution {
	async fn resolve_policies(
		&self,
		tenant_id: TenantId,
		resource: &ResourceDescriptor,
	) -> Result<Vec<ApplicablePolicy>> {
		let policies = self.policies.read().await;
		let applicable = policies
			.get(&tenant_id)
			.map(|list| {
				list
					.iter()
					.filter(|p| policy_covers(p, resource))
					.cloned()
					.collect()
			})
			.unwrap_or_default();
		Ok(applicable)
	}
}

fn policy_covers(policy: &ApplicablePolicy, resource: &ResourceDescriptor) -> bool {
	match &policy.scope_key {
		None => true,
		Some(key) => {
			let wanted = meridian_authz_core::scope_index_key(policy.scope_type, Some(key));
			wanted == resource.scope_key_for(policy.scope_type)
		}
	}
}
