// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Every failure path ends in a deny with a reason.

use meridian_server_authz::{
	ApplicablePolicy, Effect, PolicyId, PolicyRule, PolicyVersionId, ResourceDescriptor, ScopeType,
	SubjectType, REASON_NO_MATCHING_RULES, REASON_NO_POLICIES,
};

use super::support::{invoice, World, READ};

async fn world_with_open_policy() -> World {
	let world = World::new().await;
	world.subject(world.user("u-1").with_role("clerk")).await;
	let policy = world.policy(ScopeType::Entity, Some("invoice")).await;
	world
		.rule(PolicyRule::new(
			policy.policy_version_id,
			ScopeType::Entity,
			SubjectType::Wildcard,
			"*",
			Effect::Allow,
			1,
		))
		.await;
	world
}

#[tokio::test]
async fn unknown_operation_denies_without_loading_rules() {
	let world = world_with_open_policy().await;
	let decision = world
		.evaluator
		.authorize(&world.request("u-1", "invoice.shred", invoice()))
		.await;

	assert_eq!(decision.effect, Effect::Deny);
	assert_eq!(decision.reason, "Unknown operation: invoice.shred");
	assert_eq!(world.store.load_counts().rule_loads, 0);
	assert_eq!(world.compiler.stats().await.cached, 0);
}

#[tokio::test]
async fn resource_without_policies_is_denied() {
	let world = world_with_open_policy().await;
	let decision = world
		.evaluator
		.authorize(&world.request("u-1", READ, ResourceDescriptor::entity("purchase_order")))
		.await;
	assert_eq!(decision.effect, Effect::Deny);
	assert_eq!(decision.reason, REASON_NO_POLICIES);
	assert_eq!(decision.resource_key, "purchase_order");
}

#[tokio::test]
async fn unknown_principal_is_denied_with_the_error() {
	let world = world_with_open_policy().await;
	let decision = world
		.evaluator
		.authorize(&world.request("intruder", READ, invoice()))
		.await;
	assert_eq!(decision.effect, Effect::Deny);
	assert!(decision.reason.starts_with("Authorization failed: "));
	assert!(decision.reason.contains("intruder"));
}

#[tokio::test]
async fn other_tenant_cannot_use_the_policy() {
	let world = world_with_open_policy().await;
	let stranger = meridian_server_authz::TenantId::generate();
	assert!(!world
		.evaluator
		.has_permission("u-1", stranger, READ, invoice())
		.await);
}

#[tokio::test]
async fn missing_policy_version_is_skipped_not_fatal() {
	let world = world_with_open_policy().await;
	world
		.policies
		.insert(
			world.tenant,
			ApplicablePolicy {
				policy_id: PolicyId::generate(),
				active_version_id: PolicyVersionId::generate(),
				scope_type: ScopeType::Global,
				scope_key: None,
			},
		)
		.await;

	let decision = world
		.evaluator
		.authorize(&world.request("u-1", READ, invoice()))
		.await;
	assert!(decision.is_allowed());
}

#[tokio::test]
async fn only_broken_policies_means_no_matching_rules() {
	let world = World::new().await;
	world.subject(world.user("u-1")).await;
	world
		.policies
		.insert(
			world.tenant,
			ApplicablePolicy {
				policy_id: PolicyId::generate(),
				active_version_id: PolicyVersionId::generate(),
				scope_type: ScopeType::Global,
				scope_key: None,
			},
		)
		.await;

	let decision = world
		.evaluator
		.authorize(&world.request("u-1", READ, invoice()))
		.await;
	assert_eq!(decision.effect, Effect::Deny);
	assert_eq!(decision.reason, REASON_NO_MATCHING_RULES);
}

#[tokio::test]
async fn store_outage_denies() {
	let world = world_with_open_policy().await;
	world.store.set_fail_rule_loads(true);
	let decision = world
		.evaluator
		.authorize(&world.request("u-1", READ, invoice()))
		.await;
	assert_eq!(decision.effect, Effect::Deny);

	world.store.set_fail_rule_loads(false);
	assert!(world
		.evaluator
		.has_permission("u-1", world.tenant, READ, invoice())
		.await);
}

#[tokio::test]
async fn every_decision_is_timed_and_explained() {
	let world = world_with_open_policy().await;
	let requests = [
		world.request("u-1", READ, invoice()),
		world.request("u-1", "nope", invoice()),
		world.request("ghost", READ, invoice()),
		world.request("u-1", READ, ResourceDescriptor::entity("ledger")),
	];
	for request in &requests {
		let decision = world.evaluator.authorize(request).await;
		assert!(!decision.reason.is_empty());
		assert!(decision.evaluation_time_ms >= 0.0);
		assert_eq!(decision.principal_id, request.principal_id);
		assert_eq!(decision.operation_code, request.operation_code);
	}
}
