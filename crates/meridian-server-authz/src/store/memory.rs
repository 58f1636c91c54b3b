// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use meridian_authz_core::{
	CompiledPolicy, PolicyRule, PolicyVersionId, PolicyVersionMeta, RuleId, RuleOperationLink,
	TenantId,
};
use tokio::sync::RwLock;
use tracing::instrument;

use super::{CompiledPolicyStore, PolicyRuleStore};
use crate::error::{AuthzError, Result};

type VersionKey = (TenantId, PolicyVersionId);

/// Storage traffic observed by an [`InMemoryPolicyStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadCounts {
	/// Calls to `list_active_rules`.
	pub rule_loads: usize,
	/// Artifacts actually written by `insert_if_hash_absent`.
	pub artifact_writes: usize,
}

/// Process-local implementation of both stores.
///
/// Counts rule loads and artifact writes so callers can observe how often the
/// compiler actually touched storage.
#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
	versions: RwLock<HashMap<VersionKey, PolicyVersionMeta>>,
	rules: RwLock<HashMap<VersionKey, Vec<PolicyRule>>>,
	links: RwLock<HashMap<RuleId, Vec<RuleOperationLink>>>,
	compiled: RwLock<HashMap<VersionKey, Vec<CompiledPolicy>>>,
	rule_loads: AtomicUsize,
	artifact_writes: AtomicUsize,
	fail_rule_loads: AtomicBool,
	load_delay: Option<Duration>,
}

impl InMemoryPolicyStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Builder: sleep before every rule load, widening the window in which
	/// concurrent compilations overlap.
	pub fn with_load_delay(mut self, delay: Duration) -> Self {
		self.load_delay = Some(delay);
		self
	}

	pub async fn put_policy_version(&self, meta: PolicyVersionMeta) {
		self
			.versions
			.write()
			.await
			.insert((meta.tenant_id, meta.policy_version_id), meta);
	}

	pub async fn put_rule(&self, tenant_id: TenantId, rule: PolicyRule) {
		let mut rules = self.rules.write().await;
		let version_rules = rules.entry((tenant_id, rule.policy_version_id)).or_default();
		version_rules.retain(|r| r.id != rule.id);
		version_rules.push(rule);
	}

	pub async fn link_operation(&self, link: RuleOperationLink) {
		self
			.links
			.write()
			.await
			.entry(link.rule_id)
			.or_default()
			.push(link);
	}

	/// Flips a rule's active flag. Returns false if the rule does not exist.
	pub async fn set_rule_active(
		&self,
		tenant_id: TenantId,
		policy_version_id: PolicyVersionId,
		rule_id: RuleId,
		is_active: bool,
	) -> bool {
		let mut rules = self.rules.write().await;
		match rules
			.get_mut(&(tenant_id, policy_version_id))
			.and_then(|list| list.iter_mut().find(|r| r.id == rule_id))
		{
			Some(rule) => {
				rule.is_active = is_active;
				true
			}
			None => false,
		}
	}

	/// Makes every subsequent rule load fail until reset.
	pub fn set_fail_rule_loads(&self, fail: bool) {
		self.fail_rule_loads.store(fail, Ordering::SeqCst);
	}

	pub fn load_counts(&self) -> LoadCounts {
		LoadCounts {
			rule_loads: self.rule_loads.load(Ordering::SeqCst),
			artifact_writes: self.artifact_writes.load(Ordering::SeqCst),
		}
	}

	pub async fn compiled_versions(&self, tenant_id: TenantId, policy_version_id: PolicyVersionId) -> usize {
		self
			.compiled
			.read()
			.await
			.get(&(tenant_id, policy_version_id))
			.map_or(0, Vec::len)
	}
}

#[async_trait]
impl PolicyRuleStore for InMemoryPolicyStore {
	async fn get_policy_version(
		&self,
		tenant_id: TenantId,
		policy_version_id: PolicyVersionId,
	) -> Result<Option<PolicyVersionMeta>> {
		Ok(self
			.versions
			.read()
			.await
			.get(&(tenant_id, policy_version_id))
			.cloned())
	}

	#[instrument(skip(self), fields(tenant_id = %tenant_id, policy_version_id = %policy_version_id))]
	async fn list_active_rules(
		&self,
		tenant_id: TenantId,
		policy_version_id: PolicyVersionId,
	) -> Result<Vec<PolicyRule>> {
		self.rule_loads.fetch_add(1, Ordering::SeqCst);
		if let Some(delay) = self.load_delay {
			tokio::time::sleep(delay).await;
		}
		if self.fail_rule_loads.load(Ordering::SeqCst) {
			return Err(AuthzError::Store("rule load failed".to_string()));
		}

		let mut active: Vec<PolicyRule> = self
			.rules
			.read()
			.await
			.get(&(tenant_id, policy_version_id))
			.map(|list| list.iter().filter(|r| r.is_active).cloned().collect())
			.unwrap_or_default();
		active.sort_by_key(|r| r.priority);
		Ok(active)
	}

	async fn list_rule_operations(
		&self,
		_tenant_id: TenantId,
		rule_ids: &[RuleId],
	) -> Result<Vec<RuleOperationLink>> {
		let links = self.links.read().await;
		Ok(rule_ids
			.iter()
			.filter_map(|id| links.get(id))
			.flatten()
			.cloned()
			.collect())
	}
}

#[async_trait]
impl CompiledPolicyStore for InMemoryPolicyStore {
	async fn get_latest_compiled(
		&self,
		tenant_id: TenantId,
		policy_version_id: PolicyVersionId,
	) -> Result<Option<CompiledPolicy>> {
		Ok(self
			.compiled
			.read()
			.await
			.get(&(tenant_id, policy_version_id))
			.and_then(|list| list.last())
			.cloned())
	}

	async fn insert_if_hash_absent(&self, compiled: &CompiledPolicy) -> Result<bool> {
		let mut store = self.compiled.write().await;
		let versions = store
			.entry((compiled.tenant_id, compiled.policy_version_id))
			.or_default();
		if let Some(pos) = versions.iter().position(|c| c.hash == compiled.hash) {
			// Same content again: it becomes the latest artifact without a write.
			let mut existing = versions.remove(pos);
			existing.compiled_at = compiled.compiled_at;
			versions.push(existing);
			return Ok(false);
		}
		versions.push(compiled.clone());
		self.artifact_writes.fetch_add(1, Ordering::SeqCst);
		Ok(true)
	}
}
