// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use meridian_authz_core::{
	CompiledPolicy, ConditionExpr, Effect, PolicyRule, PolicyVersionId, PolicyVersionMeta,
	RuleId, RuleIndex, RuleOperationLink, ScopeType, SubjectType, TenantId,
};
use sqlx::sqlite::{
	SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Sqlite};
use tracing::instrument;

use super::{CompiledPolicyStore, PolicyRuleStore};
use crate::error::{AuthzError, Result};

const SCHEMA: &[&str] = &[
	r#"
	CREATE TABLE IF NOT EXISTS policies (
		id TEXT PRIMARY KEY,
		tenant_id TEXT NOT NULL,
		name TEXT NOT NULL,
		scope_type TEXT NOT NULL,
		scope_key TEXT,
		created_at TEXT NOT NULL
	)
	"#,
	r#"
	CREATE TABLE IF NOT EXISTS policy_versions (
		id TEXT PRIMARY KEY,
		tenant_id TEXT NOT NULL,
		policy_id TEXT NOT NULL REFERENCES policies(id),
		created_at TEXT NOT NULL
	)
	"#,
	r#"
	CREATE TABLE IF NOT EXISTS policy_rules (
		id TEXT PRIMARY KEY,
		tenant_id TEXT NOT NULL,
		policy_version_id TEXT NOT NULL REFERENCES policy_versions(id),
		scope_type TEXT NOT NULL,
		scope_key TEXT,
		subject_type TEXT NOT NULL,
		subject_key TEXT NOT NULL,
		effect TEXT NOT NULL,
		priority INTEGER NOT NULL,
		conditions TEXT,
		is_active INTEGER NOT NULL DEFAULT 1,
		created_at TEXT NOT NULL,
		updated_at TEXT NOT NULL
	)
	"#,
	"CREATE INDEX IF NOT EXISTS idx_policy_rules_version ON policy_rules(tenant_id, policy_version_id, is_active)",
	r#"
	CREATE TABLE IF NOT EXISTS policy_rule_operations (
		rule_id TEXT NOT NULL REFERENCES policy_rules(id),
		operation_id TEXT NOT NULL,
		operation_constraints TEXT,
		PRIMARY KEY (rule_id, operation_id)
	)
	"#,
	r#"
	CREATE TABLE IF NOT EXISTS compiled_policies (
		id TEXT PRIMARY KEY,
		tenant_id TEXT NOT NULL,
		policy_version_id TEXT NOT NULL,
		policy_id TEXT NOT NULL,
		scope_type TEXT NOT NULL,
		rule_index TEXT NOT NULL,
		hash TEXT NOT NULL,
		rule_count INTEGER NOT NULL,
		compiled_at TEXT NOT NULL,
		compiled_by TEXT NOT NULL,
		UNIQUE (tenant_id, policy_version_id, hash)
	)
	"#,
];

/// Create a SqlitePool with WAL mode and common settings.
#[instrument(skip(database_url))]
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
	let options = SqliteConnectOptions::from_str(database_url)
		.map_err(|e| AuthzError::Internal(format!("Invalid database URL: {e}")))?
		.journal_mode(SqliteJournalMode::Wal)
		.synchronous(SqliteSynchronous::Normal)
		.create_if_missing(true);

	let pool = SqlitePool::connect_with(options).await?;

	tracing::debug!("database pool created");
	Ok(pool)
}

/// A single-connection in-memory pool with the schema applied.
///
/// Every connection to `sqlite::memory:` opens a distinct database, so the
/// pool is capped at one.
pub async fn create_memory_pool() -> Result<SqlitePool> {
	let pool = SqlitePoolOptions::new()
		.max_connections(1)
		.connect("sqlite::memory:")
		.await?;
	run_migrations(&pool).await?;
	Ok(pool)
}

#[instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
	for statement in SCHEMA {
		sqlx::query(statement).execute(pool).await?;
	}
	tracing::debug!("authorization schema applied");
	Ok(())
}

fn timestamp(at: DateTime<Utc>) -> String {
	at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SQLite implementation of both policy stores.
#[derive(Clone)]
pub struct SqlitePolicyStore {
	pool: SqlitePool,
}

impl SqlitePolicyStore {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	/// Creates or renames a policy and registers the version under it.
	#[instrument(skip(self, meta), fields(tenant_id = %meta.tenant_id, policy_version_id = %meta.policy_version_id))]
	pub async fn upsert_policy_version(&self, meta: &PolicyVersionMeta) -> Result<()> {
		let now = timestamp(Utc::now());
		sqlx::query(
			r#"
			INSERT INTO policies (id, tenant_id, name, scope_type, scope_key, created_at)
			VALUES (?, ?, ?, ?, ?, ?)
			ON CONFLICT(id) DO UPDATE SET
				name = excluded.name,
				scope_type = excluded.scope_type,
				scope_key = excluded.scope_key
			"#,
		)
		.bind(meta.policy_id.to_string())
		.bind(meta.tenant_id.to_string())
		.bind(&meta.name)
		.bind(meta.scope_type.as_str())
		.bind(&meta.scope_key)
		.bind(&now)
		.execute(&self.pool)
		.await?;

		sqlx::query(
			r#"
			INSERT OR IGNORE INTO policy_versions (id, tenant_id, policy_id, created_at)
			VALUES (?, ?, ?, ?)
			"#,
		)
		.bind(meta.policy_version_id.to_string())
		.bind(meta.tenant_id.to_string())
		.bind(meta.policy_id.to_string())
		.bind(&now)
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	#[instrument(skip(self, rule), fields(rule_id = %rule.id, policy_version_id = %rule.policy_version_id))]
	pub async fn insert_rule(&self, tenant_id: TenantId, rule: &PolicyRule) -> Result<()> {
		let conditions = rule
			.conditions
			.as_ref()
			.map(serde_json::to_string)
			.transpose()?;
		let now = timestamp(Utc::now());

		sqlx::query(
			r#"
			INSERT INTO policy_rules (
				id, tenant_id, policy_version_id, scope_type, scope_key, subject_type,
				subject_key, effect, priority, conditions, is_active, created_at, updated_at
			)
			VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
			"#,
		)
		.bind(rule.id.to_string())
		.bind(tenant_id.to_string())
		.bind(rule.policy_version_id.to_string())
		.bind(rule.scope_type.as_str())
		.bind(&rule.scope_key)
		.bind(rule.subject_type.as_str())
		.bind(&rule.subject_key)
		.bind(rule.effect.as_str())
		.bind(rule.priority)
		.bind(conditions)
		.bind(rule.is_active)
		.bind(&now)
		.bind(&now)
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	#[instrument(skip(self, link), fields(rule_id = %link.rule_id, operation_id = %link.operation_id))]
	pub async fn link_operation(&self, link: &RuleOperationLink) -> Result<()> {
		let constraints = link
			.operation_constraints
			.as_ref()
			.map(serde_json::to_string)
			.transpose()?;

		sqlx::query(
			r#"
			INSERT INTO policy_rule_operations (rule_id, operation_id, operation_constraints)
			VALUES (?, ?, ?)
			ON CONFLICT(rule_id, operation_id) DO UPDATE SET
				operation_constraints = excluded.operation_constraints
			"#,
		)
		.bind(link.rule_id.to_string())
		.bind(&link.operation_id)
		.bind(constraints)
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	/// Returns false if no such rule exists in the tenant.
	#[instrument(skip(self), fields(rule_id = %rule_id))]
	pub async fn set_rule_active(&self, tenant_id: TenantId, rule_id: RuleId, is_active: bool) -> Result<bool> {
		let result = sqlx::query(
			r#"
			UPDATE policy_rules
			SET is_active = ?, updated_at = ?
			WHERE id = ? AND tenant_id = ?
			"#,
		)
		.bind(is_active)
		.bind(timestamp(Utc::now()))
		.bind(rule_id.to_string())
		.bind(tenant_id.to_string())
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected() > 0)
	}
}

#[async_trait]
impl PolicyRuleStore for SqlitePolicyStore {
	#[instrument(skip(self), fields(tenant_id = %tenant_id, policy_version_id = %policy_version_id))]
	async fn get_policy_version(
		&self,
		tenant_id: TenantId,
		policy_version_id: PolicyVersionId,
	) -> Result<Option<PolicyVersionMeta>> {
		let row = sqlx::query_as::<_, PolicyVersionRow>(
			r#"
			SELECT v.id, v.tenant_id, v.policy_id, p.name, p.scope_type, p.scope_key
			FROM policy_versions v
			JOIN policies p ON p.id = v.policy_id
			WHERE v.id = ? AND v.tenant_id = ?
			"#,
		)
		.bind(policy_version_id.to_string())
		.bind(tenant_id.to_string())
		.fetch_optional(&self.pool)
		.await?;

		row.map(TryInto::try_into).transpose()
	}

	#[instrument(skip(self), fields(tenant_id = %tenant_id, policy_version_id = %policy_version_id))]
	async fn list_active_rules(
		&self,
		tenant_id: TenantId,
		policy_version_id: PolicyVersionId,
	) -> Result<Vec<PolicyRule>> {
		let rows = sqlx::query_as::<_, PolicyRuleRow>(
			r#"
			SELECT id, policy_version_id, scope_type, scope_key, subject_type, subject_key,
				effect, priority, conditions, is_active
			FROM policy_rules
			WHERE tenant_id = ? AND policy_version_id = ? AND is_active = 1
			ORDER BY priority ASC, id ASC
			"#,
		)
		.bind(tenant_id.to_string())
		.bind(policy_version_id.to_string())
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(TryInto::try_into).collect()
	}

	#[instrument(skip(self, rule_ids), fields(tenant_id = %tenant_id, rules = rule_ids.len()))]
	async fn list_rule_operations(
		&self,
		tenant_id: TenantId,
		rule_ids: &[RuleId],
	) -> Result<Vec<RuleOperationLink>> {
		if rule_ids.is_empty() {
			return Ok(Vec::new());
		}

		let mut query = QueryBuilder::<Sqlite>::new(
			r#"
			SELECT o.rule_id, o.operation_id, o.operation_constraints
			FROM policy_rule_operations o
			JOIN policy_rules r ON r.id = o.rule_id
			WHERE r.tenant_id = "#,
		);
		query.push_bind(tenant_id.to_string());
		query.push(" AND o.rule_id IN (");
		let mut ids = query.separated(", ");
		for id in rule_ids {
			ids.push_bind(id.to_string());
		}
		ids.push_unseparated(") ORDER BY o.rule_id, o.operation_id");

		let rows = query
			.build_query_as::<RuleOperationRow>()
			.fetch_all(&self.pool)
			.await?;

		rows.into_iter().map(TryInto::try_into).collect()
	}
}

#[async_trait]
impl CompiledPolicyStore for SqlitePolicyStore {
	#[instrument(skip(self), fields(tenant_id = %tenant_id, policy_version_id = %policy_version_id))]
	async fn get_latest_compiled(
		&self,
		tenant_id: TenantId,
		policy_version_id: PolicyVersionId,
	) -> Result<Option<CompiledPolicy>> {
		let row = sqlx::query_as::<_, CompiledPolicyRow>(
			r#"
			SELECT tenant_id, policy_version_id, policy_id, scope_type, rule_index, hash,
				rule_count, compiled_at, compiled_by
			FROM compiled_policies
			WHERE tenant_id = ? AND policy_version_id = ?
			ORDER BY compiled_at DESC, rowid DESC
			LIMIT 1
			"#,
		)
		.bind(tenant_id.to_string())
		.bind(policy_version_id.to_string())
		.fetch_optional(&self.pool)
		.await?;

		row.map(TryInto::try_into).transpose()
	}

	#[instrument(skip(self, compiled), fields(policy_version_id = %compiled.policy_version_id, hash = %compiled.hash))]
	async fn insert_if_hash_absent(&self, compiled: &CompiledPolicy) -> Result<bool> {
		let rule_index = serde_json::to_string(&compiled.rule_index)?;
		let rule_count = i64::try_from(compiled.rule_count)
			.map_err(|_| AuthzError::Internal("rule count overflow".to_string()))?;

		let id = uuid::Uuid::new_v4().to_string();

		// A known hash is not rewritten, only stamped as the latest compile.
		let (stored_id,): (String,) = sqlx::query_as(
			r#"
			INSERT INTO compiled_policies (
				id, tenant_id, policy_version_id, policy_id, scope_type, rule_index, hash,
				rule_count, compiled_at, compiled_by
			)
			VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
			ON CONFLICT(tenant_id, policy_version_id, hash) DO UPDATE SET
				compiled_at = excluded.compiled_at
			RETURNING id
			"#,
		)
		.bind(&id)
		.bind(compiled.tenant_id.to_string())
		.bind(compiled.policy_version_id.to_string())
		.bind(compiled.policy_id.to_string())
		.bind(compiled.scope_type.as_str())
		.bind(rule_index)
		.bind(&compiled.hash)
		.bind(rule_count)
		.bind(timestamp(compiled.compiled_at))
		.bind(&compiled.compiled_by)
		.fetch_one(&self.pool)
		.await?;

		Ok(stored_id == id)
	}
}

// Database row types for sqlx

fn parse_field<T: FromStr>(value: &str, what: &str) -> Result<T> {
	value
		.parse()
		.map_err(|_| AuthzError::Store(format!("Invalid {what}: {value}")))
}

#[derive(sqlx::FromRow)]
struct PolicyVersionRow {
	id: String,
	tenant_id: String,
	policy_id: String,
	name: String,
	scope_type: String,
	scope_key: Option<String>,
}

impl TryFrom<PolicyVersionRow> for PolicyVersionMeta {
	type Error = AuthzError;

	fn try_from(row: PolicyVersionRow) -> Result<Self> {
		Ok(PolicyVersionMeta {
			tenant_id: parse_field(&row.tenant_id, "tenant ID")?,
			policy_id: parse_field(&row.policy_id, "policy ID")?,
			policy_version_id: parse_field(&row.id, "policy version ID")?,
			name: row.name,
			scope_type: parse_field::<ScopeType>(&row.scope_type, "scope type")?,
			scope_key: row.scope_key,
		})
	}
}

#[derive(sqlx::FromRow)]
struct PolicyRuleRow {
	id: String,
	policy_version_id: String,
	scope_type: String,
	scope_key: Option<String>,
	subject_type: String,
	subject_key: String,
	effect: String,
	priority: i64,
	conditions: Option<String>,
	is_active: bool,
}

impl TryFrom<PolicyRuleRow> for PolicyRule {
	type Error = AuthzError;

	fn try_from(row: PolicyRuleRow) -> Result<Self> {
		let conditions = row
			.conditions
			.as_deref()
			.map(serde_json::from_str::<ConditionExpr>)
			.transpose()?;

		Ok(PolicyRule {
			id: parse_field(&row.id, "rule ID")?,
			policy_version_id: parse_field(&row.policy_version_id, "policy version ID")?,
			scope_type: parse_field::<ScopeType>(&row.scope_type, "scope type")?,
			scope_key: row.scope_key,
			subject_type: parse_field::<SubjectType>(&row.subject_type, "subject type")?,
			subject_key: row.subject_key,
			effect: parse_field::<Effect>(&row.effect, "effect")?,
			priority: i32::try_from(row.priority)
				.map_err(|_| AuthzError::Store(format!("Invalid priority: {}", row.priority)))?,
			conditions,
			is_active: row.is_active,
		})
	}
}

#[derive(sqlx::FromRow)]
struct RuleOperationRow {
	rule_id: String,
	operation_id: String,
	operation_constraints: Option<String>,
}

impl TryFrom<RuleOperationRow> for RuleOperationLink {
	type Error = AuthzError;

	fn try_from(row: RuleOperationRow) -> Result<Self> {
		Ok(RuleOperationLink {
			rule_id: parse_field(&row.rule_id, "rule ID")?,
			operation_id: row.operation_id,
			operation_constraints: row
				.operation_constraints
				.as_deref()
				.map(serde_json::from_str)
				.transpose()?,
		})
	}
}

#[derive(sqlx::FromRow)]
struct CompiledPolicyRow {
	tenant_id: String,
	policy_version_id: String,
	policy_id: String,
	scope_type: String,
	rule_index: String,
	hash: String,
	rule_count: i64,
	compiled_at: String,
	compiled_by: String,
}

impl TryFrom<CompiledPolicyRow> for CompiledPolicy {
	type Error = AuthzError;

	fn try_from(row: CompiledPolicyRow) -> Result<Self> {
		let rule_index: RuleIndex = serde_json::from_str(&row.rule_index)?;

		Ok(CompiledPolicy {
			tenant_id: parse_field(&row.tenant_id, "tenant ID")?,
			policy_version_id: parse_field(&row.policy_version_id, "policy version ID")?,
			policy_id: parse_field(&row.policy_id, "policy ID")?,
			scope_type: parse_field::<ScopeType>(&row.scope_type, "scope type")?,
			rule_index,
			hash: row.hash,
			rule_count: usize::try_from(row.rule_count)
				.map_err(|_| AuthzError::Store(format!("Invalid rule count: {}", row.rule_count)))?,
			compiled_at: DateTime::parse_from_rfc3339(&row.compiled_at)
				.map_err(|_| AuthzError::Store("Invalid compiled_at".to_string()))?
				.with_timezone(&Utc),
			compiled_by: row.compiled_by,
		})
	}
}
