// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Authorization requests, decisions and effect precedence.

use std::cmp::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::policy::CompiledRule;
use crate::types::{scope_index_key, Effect, PolicyVersionId, RuleId, ScopeType, TenantId};

pub const REASON_NO_POLICIES: &str = "No policies apply to this resource";
pub const REASON_NO_MATCHING_RULES: &str = "No matching rules found";

/// The resource an operation targets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
	pub entity_code: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub module_code: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub entity_version_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub record_id: Option<String>,
	/// Extra resource facts for conditions (`resource.attributes.*`).
	#[serde(default)]
	pub attributes: Map<String, Value>,
}

impl ResourceDescriptor {
	pub fn entity(entity_code: impl Into<String>) -> Self {
		Self {
			entity_code: entity_code.into(),
			..Default::default()
		}
	}

	/// Builder: set module code.
	pub fn in_module(mut self, module_code: impl Into<String>) -> Self {
		self.module_code = Some(module_code.into());
		self
	}

	/// Builder: set entity version.
	pub fn with_version(mut self, entity_version_id: impl Into<String>) -> Self {
		self.entity_version_id = Some(entity_version_id.into());
		self
	}

	/// Builder: set record id.
	pub fn with_record(mut self, record_id: impl Into<String>) -> Self {
		self.record_id = Some(record_id.into());
		self
	}

	/// Builder: set a resource attribute.
	pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
		self.attributes.insert(key.into(), value);
		self
	}

	/// The scope-index key this resource probes at the given scope.
	pub fn scope_key_for(&self, scope_type: ScopeType) -> String {
		let key = match scope_type {
			ScopeType::Global => None,
			ScopeType::Module => self.module_code.clone(),
			ScopeType::Entity => Some(self.entity_code.clone()),
			ScopeType::EntityVersion => Some(format!(
				"{}:{}",
				self.entity_code,
				self.entity_version_id.as_deref().unwrap_or("*")
			)),
			ScopeType::Record => Some(format!(
				"{}:{}",
				self.entity_code,
				self.record_id.as_deref().unwrap_or("*")
			)),
		};
		scope_index_key(scope_type, key.as_deref())
	}

	/// Human-readable key: `entity[:version][:record]`.
	pub fn resource_key(&self) -> String {
		let mut key = self.entity_code.clone();
		for part in [&self.entity_version_id, &self.record_id].into_iter().flatten() {
			key.push(':');
			key.push_str(part);
		}
		key
	}
}

/// A caller's question: may this principal perform this operation here?
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
	pub principal_id: String,
	pub tenant_id: TenantId,
	pub operation_code: String,
	pub resource: ResourceDescriptor,
	/// Request-time facts for the `environment.*` namespace.
	#[serde(default)]
	pub environment: Map<String, Value>,
}

impl AuthorizationRequest {
	pub fn new(
		principal_id: impl Into<String>,
		tenant_id: TenantId,
		operation_code: impl Into<String>,
		resource: ResourceDescriptor,
	) -> Self {
		Self {
			principal_id: principal_id.into(),
			tenant_id,
			operation_code: operation_code.into(),
			resource,
			environment: Map::new(),
		}
	}

	/// Builder: set an environment fact.
	pub fn with_environment(mut self, key: impl Into<String>, value: Value) -> Self {
		self.environment.insert(key.into(), value);
		self
	}
}

/// The engine's answer. `reason` is populated on every branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationDecision {
	pub effect: Effect,
	pub principal_id: String,
	pub operation_code: String,
	pub resource_key: String,
	pub matched_rule_id: Option<RuleId>,
	pub matched_policy_version_id: Option<PolicyVersionId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub operation_constraints: Option<Value>,
	pub reason: String,
	pub evaluation_time_ms: f64,
}

impl AuthorizationDecision {
	/// A deny that no rule produced.
	pub fn deny(request: &AuthorizationRequest, reason: impl Into<String>) -> Self {
		Self {
			effect: Effect::Deny,
			principal_id: request.principal_id.clone(),
			operation_code: request.operation_code.clone(),
			resource_key: request.resource.resource_key(),
			matched_rule_id: None,
			matched_policy_version_id: None,
			operation_constraints: None,
			reason: reason.into(),
			evaluation_time_ms: 0.0,
		}
	}

	/// The decision carried by a winning rule.
	pub fn from_rule(request: &AuthorizationRequest, rule: &CompiledRule) -> Self {
		let verb = match rule.effect {
			Effect::Allow => "Allowed",
			Effect::Deny => "Denied",
		};
		Self {
			effect: rule.effect,
			principal_id: request.principal_id.clone(),
			operation_code: request.operation_code.clone(),
			resource_key: request.resource.resource_key(),
			matched_rule_id: Some(rule.rule_id),
			matched_policy_version_id: Some(rule.policy_version_id),
			operation_constraints: rule.operation_constraints.clone(),
			reason: format!(
				"{verb} by rule {} (policy version {})",
				rule.rule_id, rule.policy_version_id
			),
			evaluation_time_ms: 0.0,
		}
	}

	/// Builder: stamp wall-clock evaluation time.
	pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
		self.evaluation_time_ms = elapsed.as_secs_f64() * 1000.0;
		self
	}

	pub fn is_allowed(&self) -> bool {
		self.effect == Effect::Allow
	}
}

/// Total order used to pick the winning rule: more specific scope first, then
/// lower priority, then deny before allow. Rule id settles exact ties so the
/// reported winner is stable.
pub fn precedence_order(a: &CompiledRule, b: &CompiledRule) -> Ordering {
	b.scope_type
		.specificity()
		.cmp(&a.scope_type.specificity())
		.then_with(|| a.priority.cmp(&b.priority))
		.then_with(|| effect_rank(a.effect).cmp(&effect_rank(b.effect)))
		.then_with(|| a.rule_id.cmp(&b.rule_id))
}

fn effect_rank(effect: Effect) -> u8 {
	match effect {
		Effect::Deny => 0,
		Effect::Allow => 1,
	}
}

/// Picks the winning rule among matched rules, independent of input order.
pub fn resolve_precedence<I>(rules: I) -> Option<CompiledRule>
where
	I: IntoIterator<Item = CompiledRule>,
{
	rules.into_iter().min_by(precedence_order)
}
