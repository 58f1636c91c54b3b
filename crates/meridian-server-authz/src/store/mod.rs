// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Storage seams of the policy compiler.
//!
//! - [`PolicyRuleStore`]: the authored source of truth (policy versions, rules
//!   and rule→operation links)
//! - [`CompiledPolicyStore`]: append-only, hash-deduplicated compiled artifacts
//!
//! Both are implemented in memory ([`InMemoryPolicyStore`]) and over SQLite
//! ([`SqlitePolicyStore`]).

mod memory;
mod sqlite;

pub use memory::{InMemoryPolicyStore, LoadCounts};
pub use sqlite::{create_memory_pool, create_pool, run_migrations, SqlitePolicyStore};

use async_trait::async_trait;
use meridian_authz_core::{
	CompiledPolicy, PolicyRule, PolicyVersionId, PolicyVersionMeta, RuleId, RuleOperationLink,
	TenantId,
};

use crate::error::Result;

/// Read access to authored policy rules.
#[async_trait]
pub trait PolicyRuleStore: Send + Sync {
	async fn get_policy_version(
		&self,
		tenant_id: TenantId,
		policy_version_id: PolicyVersionId,
	) -> Result<Option<PolicyVersionMeta>>;

	/// Active rules of a version, priority ascending.
	async fn list_active_rules(
		&self,
		tenant_id: TenantId,
		policy_version_id: PolicyVersionId,
	) -> Result<Vec<PolicyRule>>;

	async fn list_rule_operations(
		&self,
		tenant_id: TenantId,
		rule_ids: &[RuleId],
	) -> Result<Vec<RuleOperationLink>>;
}

/// Persistence of compiled artifacts.
#[async_trait]
pub trait CompiledPolicyStore: Send + Sync {
	/// The most recently compiled artifact of a version.
	async fn get_latest_compiled(
		&self,
		tenant_id: TenantId,
		policy_version_id: PolicyVersionId,
	) -> Result<Option<CompiledPolicy>>;

	/// Stores the artifact unless one with the same hash already exists for the
	/// version, in which case the existing artifact takes the new `compiled_at`
	/// and becomes the latest. Returns whether a row was written.
	async fn insert_if_hash_absent(&self, compiled: &CompiledPolicy) -> Result<bool>;
}
