// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The authorization entry point.
//!
//! [`RuleEvaluator::authorize`] never fails: every error, and any panic raised
//! by a collaborator, becomes a deny decision whose reason names the failure.
//!
//! # Evaluation
//!
//! 1. Resolve the subject and its subject keys (the wildcard key is always
//!    added).
//! 2. Resolve the operation code; unknown codes are denied before any rule is
//!    looked at.
//! 3. Resolve the applicable policies; none means deny.
//! 4. For each policy, get or compile its index and probe every scope level
//!    with the resource-derived key and the scope-wide wildcard key.
//! 5. Keep the candidates whose conditions hold and pick the winner by
//!    precedence: most specific scope, then lowest priority, then deny.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use meridian_authz_core::{
	evaluate_optional, resolve_precedence, scope_index_key, AuthorizationDecision,
	AuthorizationRequest, CompiledPolicy, CompiledRule, EvaluationContext, ResourceDescriptor,
	ScopeType, TenantId, REASON_NO_MATCHING_RULES, REASON_NO_POLICIES, WILDCARD,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::collaborators::{ApplicablePolicy, OperationCatalog, PolicyResolution, SubjectResolver};
use crate::compiler::PolicyCompiler;
use crate::error::Result;

pub(crate) const DEFAULT_COMPILED_BY: &str = "rule-evaluator";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatorConfig {
	/// Compile independent applicable policies concurrently.
	pub parallel_compilation: bool,
	/// Actor recorded on artifacts compiled on demand.
	pub compiled_by: String,
}

impl Default for EvaluatorConfig {
	fn default() -> Self {
		Self {
			parallel_compilation: true,
			compiled_by: DEFAULT_COMPILED_BY.to_string(),
		}
	}
}

/// Answers authorization requests against compiled policies.
pub struct RuleEvaluator {
	subjects: Arc<dyn SubjectResolver>,
	operations: Arc<dyn OperationCatalog>,
	policies: Arc<dyn PolicyResolution>,
	compiler: PolicyCompiler,
	config: EvaluatorConfig,
}

impl RuleEvaluator {
	pub fn new(
		subjects: Arc<dyn SubjectResolver>,
		operations: Arc<dyn OperationCatalog>,
		policies: Arc<dyn PolicyResolution>,
		compiler: PolicyCompiler,
		config: EvaluatorConfig,
	) -> Self {
		Self {
			subjects,
			operations,
			policies,
			compiler,
			config,
		}
	}

	pub fn compiler(&self) -> &PolicyCompiler {
		&self.compiler
	}

	/// Decides a request. Always returns a decision; internal failures deny.
	#[instrument(
		skip(self, request),
		fields(
			principal_id = %request.principal_id,
			tenant_id = %request.tenant_id,
			operation = %request.operation_code,
			resource = %request.resource.resource_key(),
		)
	)]
	pub async fn authorize(&self, request: &AuthorizationRequest) -> AuthorizationDecision {
		let started = Instant::now();

		let outcome = AssertUnwindSafe(self.evaluate(request)).catch_unwind().await;
		let decision = match outcome {
			Ok(Ok(decision)) => decision,
			Ok(Err(e)) => {
				warn!(
					principal_id = %request.principal_id,
					operation = %request.operation_code,
					error = %e,
					"authorization failed, denying"
				);
				AuthorizationDecision::deny(request, format!("Authorization failed: {e}"))
			}
			Err(_) => {
				warn!(
					principal_id = %request.principal_id,
					operation = %request.operation_code,
					"authorization panicked, denying"
				);
				AuthorizationDecision::deny(request, "Authorization failed: evaluation panicked")
			}
		};

		let decision = decision.with_elapsed(started.elapsed());
		debug!(
			effect = %decision.effect,
			matched_rule_id = ?decision.matched_rule_id,
			reason = %decision.reason,
			evaluation_time_ms = decision.evaluation_time_ms,
			"authorization decided"
		);
		decision
	}

	pub async fn has_permission(
		&self,
		principal_id: &str,
		tenant_id: TenantId,
		operation_code: &str,
		resource: ResourceDescriptor,
	) -> bool {
		let request = AuthorizationRequest::new(principal_id, tenant_id, operation_code, resource);
		self.authorize(&request).await.is_allowed()
	}

	async fn evaluate(&self, request: &AuthorizationRequest) -> Result<AuthorizationDecision> {
		let subject = self
			.subjects
			.resolve_subject(&request.principal_id, request.tenant_id)
			.await?;
		let mut subject_keys = self.subjects.build_subject_keys(&subject);
		if !subject_keys.iter().any(|key| key == WILDCARD) {
			subject_keys.push(WILDCARD.to_string());
		}

		let Some(operation) = self.operations.get_operation(&request.operation_code).await? else {
			return Ok(AuthorizationDecision::deny(
				request,
				format!("Unknown operation: {}", request.operation_code),
			));
		};

		let applicable = self
			.policies
			.resolve_policies(request.tenant_id, &request.resource)
			.await?;
		if applicable.is_empty() {
			return Ok(AuthorizationDecision::deny(request, REASON_NO_POLICIES));
		}

		let compiled = self.load_compiled(request.tenant_id, &applicable).await;
		let scope_keys = probe_scope_keys(&request.resource);

		let mut candidates = Vec::new();
		for (policy, compiled) in applicable.iter().zip(compiled) {
			let Some(compiled) = compiled else {
				debug!(
					policy_version_id = %policy.active_version_id,
					"no compiled policy available, skipping"
				);
				continue;
			};
			candidates.extend(collect_candidates(
				&compiled,
				&scope_keys,
				&subject_keys,
				&operation.id,
			));
		}

		let context = EvaluationContext::build(
			&subject,
			&request.resource,
			environment_for(request),
		)?;
		let matched = candidates
			.into_iter()
			.filter(|rule| evaluate_optional(rule.conditions.as_ref(), &context));

		Ok(match resolve_precedence(matched) {
			Some(winner) => AuthorizationDecision::from_rule(request, &winner),
			None => AuthorizationDecision::deny(request, REASON_NO_MATCHING_RULES),
		})
	}

	async fn load_compiled(
		&self,
		tenant_id: TenantId,
		applicable: &[ApplicablePolicy],
	) -> Vec<Option<Arc<CompiledPolicy>>> {
		let compiled_by = self.config.compiled_by.as_str();
		let loads = applicable.iter().map(|policy| {
			self
				.compiler
				.get_or_compile(tenant_id, policy.active_version_id, compiled_by)
		});

		if self.config.parallel_compilation {
			join_all(loads).await
		} else {
			let mut compiled = Vec::with_capacity(applicable.len());
			for load in loads {
				compiled.push(load.await);
			}
			compiled
		}
	}
}

/// Scope-index keys a resource can match: the resource-derived key at every
/// level, plus the level's wildcard key for rules with no scope key.
fn probe_scope_keys(resource: &ResourceDescriptor) -> Vec<String> {
	let mut keys = Vec::new();
	for &scope_type in ScopeType::all() {
		let derived = resource.scope_key_for(scope_type);
		let wildcard = scope_index_key(scope_type, None);
		if derived != wildcard {
			keys.push(wildcard);
		}
		keys.push(derived);
	}
	keys
}

fn collect_candidates(
	compiled: &CompiledPolicy,
	scope_keys: &[String],
	subject_keys: &[String],
	operation_id: &str,
) -> Vec<CompiledRule> {
	let mut seen = HashSet::new();
	let mut candidates = Vec::new();
	for scope_key in scope_keys {
		for subject_key in subject_keys {
			for rule in compiled
				.rule_index
				.lookup_with_wildcard_operation(scope_key, subject_key, operation_id)
			{
				if seen.insert(rule.rule_id) {
					candidates.push(rule.clone());
				}
			}
		}
	}
	candidates
}

/// The request environment plus `timestamp` and `tenant_id` unless the caller
/// supplied them.
fn environment_for(request: &AuthorizationRequest) -> Map<String, Value> {
	let mut environment = request.environment.clone();
	environment
		.entry("timestamp")
		.or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
	environment
		.entry("tenant_id")
		.or_insert_with(|| Value::String(request.tenant_id.to_string()));
	environment
}
