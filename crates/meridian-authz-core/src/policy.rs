// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Raw policy rules and their compiled, indexed form.
//!
//! A [`CompiledPolicy`] is a pure derivation of one policy version's active
//! rules: a three-level [`RuleIndex`] (`scope key → subject key → operation id`)
//! whose leaves are pre-sorted by priority, stamped with a SHA-256 content
//! hash. The hash depends only on rule content, never on compilation time, so
//! two compilations of an unchanged rule set are interchangeable and stores
//! can deduplicate on it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::condition::ConditionExpr;
use crate::error::Result;
use crate::types::{
	scope_index_key, subject_index_key, Effect, PolicyId, PolicyVersionId, RuleId, ScopeType,
	SubjectType, TenantId, WILDCARD,
};

/// Metadata of the policy that owns a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyVersionMeta {
	pub tenant_id: TenantId,
	pub policy_id: PolicyId,
	pub policy_version_id: PolicyVersionId,
	pub name: String,
	pub scope_type: ScopeType,
	pub scope_key: Option<String>,
}

/// A rule as authored, belonging to one policy version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
	pub id: RuleId,
	pub policy_version_id: PolicyVersionId,
	pub scope_type: ScopeType,
	/// `None` applies the rule to every key at its scope.
	pub scope_key: Option<String>,
	pub subject_type: SubjectType,
	pub subject_key: String,
	pub effect: Effect,
	/// Lower wins.
	pub priority: i32,
	pub conditions: Option<ConditionExpr>,
	pub is_active: bool,
}

impl PolicyRule {
	/// Creates an active, unconditional rule.
	pub fn new(
		policy_version_id: PolicyVersionId,
		scope_type: ScopeType,
		subject_type: SubjectType,
		subject_key: impl Into<String>,
		effect: Effect,
		priority: i32,
	) -> Self {
		Self {
			id: RuleId::generate(),
			policy_version_id,
			scope_type,
			scope_key: None,
			subject_type,
			subject_key: subject_key.into(),
			effect,
			priority,
			conditions: None,
			is_active: true,
		}
	}

	/// Builder: set the scope key.
	pub fn with_scope_key(mut self, scope_key: impl Into<String>) -> Self {
		self.scope_key = Some(scope_key.into());
		self
	}

	/// Builder: set the conditions.
	pub fn with_conditions(mut self, conditions: ConditionExpr) -> Self {
		self.conditions = Some(conditions);
		self
	}

	/// Builder: set whether the rule is active.
	pub fn with_active(mut self, is_active: bool) -> Self {
		self.is_active = is_active;
		self
	}

	pub fn scope_index_key(&self) -> String {
		scope_index_key(self.scope_type, self.scope_key.as_deref())
	}

	pub fn subject_index_key(&self) -> String {
		subject_index_key(self.subject_type, &self.subject_key)
	}
}

/// Links a rule to one operation. A rule with no links applies to every
/// operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOperationLink {
	pub rule_id: RuleId,
	pub operation_id: String,
	/// Opaque to the engine; handed back to the caller with the decision.
	pub operation_constraints: Option<Value>,
}

/// One entry of the compiled index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledRule {
	pub rule_id: RuleId,
	pub policy_version_id: PolicyVersionId,
	pub scope_type: ScopeType,
	pub effect: Effect,
	pub priority: i32,
	pub conditions: Option<ConditionExpr>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub operation_constraints: Option<Value>,
}

type OperationMap = BTreeMap<String, Vec<CompiledRule>>;
type SubjectMap = BTreeMap<String, OperationMap>;

/// `scope key → subject key → operation id → rules`, leaves sorted by priority.
///
/// Backed by `BTreeMap`s so the serialized form is canonical.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleIndex(BTreeMap<String, SubjectMap>);

impl RuleIndex {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&mut self, scope_key: &str, subject_key: &str, operation_id: &str, rule: CompiledRule) {
		self
			.0
			.entry(scope_key.to_string())
			.or_default()
			.entry(subject_key.to_string())
			.or_default()
			.entry(operation_id.to_string())
			.or_default()
			.push(rule);
	}

	/// Rules registered for exactly this scope, subject and operation.
	pub fn lookup(&self, scope_key: &str, subject_key: &str, operation_id: &str) -> &[CompiledRule] {
		self
			.0
			.get(scope_key)
			.and_then(|subjects| subjects.get(subject_key))
			.and_then(|operations| operations.get(operation_id))
			.map(Vec::as_slice)
			.unwrap_or(&[])
	}

	/// Rules registered for the operation plus those registered for all
	/// operations.
	pub fn lookup_with_wildcard_operation(
		&self,
		scope_key: &str,
		subject_key: &str,
		operation_id: &str,
	) -> impl Iterator<Item = &CompiledRule> {
		let wildcard: &[CompiledRule] = if operation_id == WILDCARD {
			&[]
		} else {
			self.lookup(scope_key, subject_key, WILDCARD)
		};
		self
			.lookup(scope_key, subject_key, operation_id)
			.iter()
			.chain(wildcard.iter())
	}

	/// Sorts every leaf by priority ascending, rule id breaking ties so the
	/// order does not depend on how the rules were loaded.
	pub fn sort_by_priority(&mut self) {
		for subjects in self.0.values_mut() {
			for operations in subjects.values_mut() {
				for rules in operations.values_mut() {
					rules.sort_by(|a, b| {
						a.priority
							.cmp(&b.priority)
							.then_with(|| a.rule_id.cmp(&b.rule_id))
					});
				}
			}
		}
	}

	/// Number of distinct rules in the index.
	pub fn rule_count(&self) -> usize {
		self
			.0
			.values()
			.flat_map(|subjects| subjects.values())
			.flat_map(|operations| operations.values())
			.flatten()
			.map(|rule| rule.rule_id)
			.collect::<BTreeSet<_>>()
			.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Hex SHA-256 of the canonical JSON serialization.
	pub fn content_hash(&self) -> Result<String> {
		let canonical = serde_json::to_vec(self)?;
		Ok(hex::encode(Sha256::digest(&canonical)))
	}
}

/// Indexes the active rules of one policy version.
///
/// Inactive rules are skipped even if the caller passed them in; rules without
/// operation links are registered under the wildcard operation.
pub fn build_rule_index(rules: &[PolicyRule], links: &[RuleOperationLink]) -> RuleIndex {
	let mut links_by_rule: HashMap<RuleId, Vec<&RuleOperationLink>> = HashMap::new();
	for link in links {
		links_by_rule.entry(link.rule_id).or_default().push(link);
	}

	let mut index = RuleIndex::new();
	for rule in rules.iter().filter(|r| r.is_active) {
		let scope_key = rule.scope_index_key();
		let subject_key = rule.subject_index_key();
		let compiled = |operation_constraints: Option<Value>| CompiledRule {
			rule_id: rule.id,
			policy_version_id: rule.policy_version_id,
			scope_type: rule.scope_type,
			effect: rule.effect,
			priority: rule.priority,
			conditions: rule.conditions.clone(),
			operation_constraints,
		};

		match links_by_rule.get(&rule.id) {
			Some(rule_links) if !rule_links.is_empty() => {
				for link in rule_links {
					index.insert(
						&scope_key,
						&subject_key,
						&link.operation_id,
						compiled(link.operation_constraints.clone()),
					);
				}
			}
			_ => index.insert(&scope_key, &subject_key, WILDCARD, compiled(None)),
		}
	}

	index.sort_by_priority();
	index
}

/// The cacheable, hash-stamped compiled form of a policy version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledPolicy {
	pub tenant_id: TenantId,
	pub policy_version_id: PolicyVersionId,
	pub policy_id: PolicyId,
	pub scope_type: ScopeType,
	pub rule_index: RuleIndex,
	pub hash: String,
	pub rule_count: usize,
	pub compiled_at: DateTime<Utc>,
	pub compiled_by: String,
}

impl CompiledPolicy {
	/// Compiles a policy version from its rules and operation links.
	pub fn build(
		meta: &PolicyVersionMeta,
		rules: &[PolicyRule],
		links: &[RuleOperationLink],
		compiled_by: &str,
	) -> Result<Self> {
		let rule_index = build_rule_index(rules, links);
		let hash = rule_index.content_hash()?;
		let rule_count = rule_index.rule_count();

		Ok(Self {
			tenant_id: meta.tenant_id,
			policy_version_id: meta.policy_version_id,
			policy_id: meta.policy_id,
			scope_type: meta.scope_type,
			rule_index,
			hash,
			rule_count,
			compiled_at: Utc::now(),
			compiled_by: compiled_by.to_string(),
		})
	}
}
