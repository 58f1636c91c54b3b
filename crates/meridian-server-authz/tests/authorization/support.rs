// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared fixtures for engine tests.

use std::sync::Arc;

use meridian_server_authz::{
	ApplicablePolicy, AuthorizationRequest, EvaluatorConfig, InMemoryPolicyStore, Operation,
	PolicyCompiler, PolicyId, PolicyRule, PolicyVersionId, PolicyVersionMeta, ResourceDescriptor,
	RuleEvaluator, ScopeType, StaticOperationCatalog, StaticPolicyResolution,
	StaticSubjectResolver, SubjectSnapshot, TenantId,
};

pub const READ: &str = "invoice.read";
pub const APPROVE: &str = "invoice.approve";

/// One tenant with an operation catalog, a policy resolution and an
/// evaluator over an in-memory store.
pub struct World {
	pub tenant: TenantId,
	pub store: Arc<InMemoryPolicyStore>,
	pub subjects: Arc<StaticSubjectResolver>,
	pub policies: Arc<StaticPolicyResolution>,
	pub compiler: PolicyCompiler,
	pub evaluator: RuleEvaluator,
}

impl World {
	pub async fn new() -> Self {
		Self::with_store(InMemoryPolicyStore::new()).await
	}

	pub async fn with_store(store: InMemoryPolicyStore) -> Self {
		let store = Arc::new(store);
		let compiler = PolicyCompiler::new(store.clone(), store.clone());
		Self::assemble(
			TenantId::generate(),
			store,
			Arc::new(StaticSubjectResolver::new()),
			Arc::new(StaticPolicyResolution::new()),
			compiler,
		)
		.await
	}

	/// Another evaluator over the same tenant, store, subjects and policies,
	/// driven by its own compiler.
	pub async fn sibling(&self, compiler: PolicyCompiler) -> Self {
		Self::assemble(
			self.tenant,
			self.store.clone(),
			self.subjects.clone(),
			self.policies.clone(),
			compiler,
		)
		.await
	}

	async fn assemble(
		tenant: TenantId,
		store: Arc<InMemoryPolicyStore>,
		subjects: Arc<StaticSubjectResolver>,
		policies: Arc<StaticPolicyResolution>,
		compiler: PolicyCompiler,
	) -> Self {
		let operations = Arc::new(StaticOperationCatalog::new());
		operations.insert(Operation::new("op-read", READ)).await;
		operations.insert(Operation::new("op-approve", APPROVE)).await;

		let evaluator = RuleEvaluator::new(
			subjects.clone(),
			operations,
			policies.clone(),
			compiler.clone(),
			EvaluatorConfig::default(),
		);

		Self {
			tenant,
			store,
			subjects,
			policies,
			compiler,
			evaluator,
		}
	}

	/// Registers a policy with one version and makes it applicable.
	pub async fn policy(&self, scope_type: ScopeType, scope_key: Option<&str>) -> PolicyVersionMeta {
		let meta = PolicyVersionMeta {
			tenant_id: self.tenant,
			policy_id: PolicyId::generate(),
			policy_version_id: PolicyVersionId::generate(),
			name: format!("{}-policy", scope_type),
			scope_type,
			scope_key: scope_key.map(str::to_string),
		};
		self.store.put_policy_version(meta.clone()).await;
		self
			.policies
			.insert(
				self.tenant,
				ApplicablePolicy {
					policy_id: meta.policy_id,
					active_version_id: meta.policy_version_id,
					scope_type,
					scope_key: meta.scope_key.clone(),
				},
			)
			.await;
		meta
	}

	pub async fn rule(&self, rule: PolicyRule) -> PolicyRule {
		self.store.put_rule(self.tenant, rule.clone()).await;
		rule
	}

	pub async fn subject(&self, subject: SubjectSnapshot) {
		self.subjects.insert(subject).await;
	}

	pub fn user(&self, principal_id: &str) -> SubjectSnapshot {
		SubjectSnapshot::new(principal_id, self.tenant)
	}

	pub fn request(&self, principal_id: &str, operation: &str, resource: ResourceDescriptor) -> AuthorizationRequest {
		AuthorizationRequest::new(principal_id, self.tenant, operation, resource)
	}
}

pub fn invoice() -> ResourceDescriptor {
	ResourceDescriptor::entity("invoice").in_module("billing")
}

pub fn invoice_record(record_id: &str) -> ResourceDescriptor {
	invoice().with_record(record_id)
}
