// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Effect precedence: scope specificity, then priority, then deny.

use meridian_server_authz::{Effect, PolicyRule, ScopeType, SubjectType, REASON_NO_MATCHING_RULES};

use super::support::{invoice, invoice_record, World, APPROVE, READ};

#[tokio::test]
async fn record_scope_beats_entity_scope_despite_priority() {
	let world = World::new().await;
	world.subject(world.user("u-1").with_role("admin")).await;
	let policy = world.policy(ScopeType::Entity, Some("invoice")).await;

	world
		.rule(
			PolicyRule::new(
				policy.policy_version_id,
				ScopeType::Entity,
				SubjectType::Role,
				"admin",
				Effect::Allow,
				10,
			)
			.with_scope_key("invoice"),
		)
		.await;
	let record_deny = world
		.rule(
			PolicyRule::new(
				policy.policy_version_id,
				ScopeType::Record,
				SubjectType::Wildcard,
				"*",
				Effect::Deny,
				999,
			)
			.with_scope_key("invoice:inv-42"),
		)
		.await;

	let decision = world
		.evaluator
		.authorize(&world.request("u-1", READ, invoice_record("inv-42")))
		.await;
	assert_eq!(decision.effect, Effect::Deny);
	assert_eq!(decision.matched_rule_id, Some(record_deny.id));
	assert_eq!(
		decision.reason,
		format!(
			"Denied by rule {} (policy version {})",
			record_deny.id, policy.policy_version_id
		)
	);

	// Other records only see the entity rule.
	let other = world
		.evaluator
		.authorize(&world.request("u-1", READ, invoice_record("inv-7")))
		.await;
	assert!(other.is_allowed());
}

#[tokio::test]
async fn deny_wins_a_tie() {
	let world = World::new().await;
	world.subject(world.user("u-1").with_role("editor")).await;
	let policy = world.policy(ScopeType::Module, Some("billing")).await;

	for effect in [Effect::Allow, Effect::Deny] {
		world
			.rule(
				PolicyRule::new(
					policy.policy_version_id,
					ScopeType::Module,
					SubjectType::Role,
					"editor",
					effect,
					5,
				)
				.with_scope_key("billing"),
			)
			.await;
	}

	let decision = world
		.evaluator
		.authorize(&world.request("u-1", READ, invoice()))
		.await;
	assert_eq!(decision.effect, Effect::Deny);
	assert!(decision.reason.starts_with("Denied by rule"));
}

#[tokio::test]
async fn lower_priority_wins_regardless_of_effect() {
	let world = World::new().await;
	world.subject(world.user("u-1").with_role("editor")).await;
	let policy = world.policy(ScopeType::Module, Some("billing")).await;

	let allow = world
		.rule(
			PolicyRule::new(
				policy.policy_version_id,
				ScopeType::Module,
				SubjectType::Role,
				"editor",
				Effect::Allow,
				1,
			)
			.with_scope_key("billing"),
		)
		.await;
	world
		.rule(
			PolicyRule::new(
				policy.policy_version_id,
				ScopeType::Module,
				SubjectType::Role,
				"editor",
				Effect::Deny,
				2,
			)
			.with_scope_key("billing"),
		)
		.await;

	let decision = world
		.evaluator
		.authorize(&world.request("u-1", READ, invoice()))
		.await;
	assert!(decision.is_allowed());
	assert_eq!(decision.matched_rule_id, Some(allow.id));
}

#[tokio::test]
async fn wildcard_subject_matches_every_requester() {
	let world = World::new().await;
	world.subject(world.user("u-1")).await;
	world.subject(world.user("u-2").with_group("auditors")).await;
	let policy = world.policy(ScopeType::Entity, Some("invoice")).await;

	world
		.rule(PolicyRule::new(
			policy.policy_version_id,
			ScopeType::Entity,
			SubjectType::Wildcard,
			"*",
			Effect::Allow,
			50,
		))
		.await;
	let auditors_deny = world
		.rule(PolicyRule::new(
			policy.policy_version_id,
			ScopeType::Entity,
			SubjectType::Group,
			"auditors",
			Effect::Deny,
			10,
		))
		.await;

	assert!(world
		.evaluator
		.has_permission("u-1", world.tenant, READ, invoice())
		.await);

	let auditor = world
		.evaluator
		.authorize(&world.request("u-2", READ, invoice()))
		.await;
	assert_eq!(auditor.effect, Effect::Deny);
	assert_eq!(auditor.matched_rule_id, Some(auditors_deny.id));
}

#[tokio::test]
async fn precedence_spans_policies() {
	let world = World::new().await;
	world.subject(world.user("u-1").with_role("clerk")).await;
	let module_policy = world.policy(ScopeType::Module, Some("billing")).await;
	let entity_policy = world.policy(ScopeType::Entity, Some("invoice")).await;

	world
		.rule(
			PolicyRule::new(
				module_policy.policy_version_id,
				ScopeType::Module,
				SubjectType::Role,
				"clerk",
				Effect::Deny,
				1,
			)
			.with_scope_key("billing"),
		)
		.await;
	let entity_allow = world
		.rule(
			PolicyRule::new(
				entity_policy.policy_version_id,
				ScopeType::Entity,
				SubjectType::Role,
				"clerk",
				Effect::Allow,
				100,
			)
			.with_scope_key("invoice"),
		)
		.await;

	let decision = world
		.evaluator
		.authorize(&world.request("u-1", READ, invoice()))
		.await;
	assert!(decision.is_allowed());
	assert_eq!(decision.matched_policy_version_id, Some(entity_policy.policy_version_id));
	assert_eq!(decision.matched_rule_id, Some(entity_allow.id));
}

#[tokio::test]
async fn unlinked_rule_applies_to_every_operation_but_linked_rule_does_not() {
	let world = World::new().await;
	world.subject(world.user("u-1").with_role("clerk")).await;
	let policy = world.policy(ScopeType::Entity, Some("invoice")).await;

	let read_only = world
		.rule(PolicyRule::new(
			policy.policy_version_id,
			ScopeType::Entity,
			SubjectType::Role,
			"clerk",
			Effect::Allow,
			10,
		))
		.await;
	world
		.store
		.link_operation(meridian_server_authz::RuleOperationLink {
			rule_id: read_only.id,
			operation_id: "op-read".to_string(),
			operation_constraints: None,
		})
		.await;

	assert!(world
		.evaluator
		.has_permission("u-1", world.tenant, READ, invoice())
		.await);
	let approve = world
		.evaluator
		.authorize(&world.request("u-1", APPROVE, invoice()))
		.await;
	assert_eq!(approve.reason, REASON_NO_MATCHING_RULES);

	world
		.rule(PolicyRule::new(
			policy.policy_version_id,
			ScopeType::Entity,
			SubjectType::User,
			"u-1",
			Effect::Allow,
			10,
		))
		.await;
	world.compiler.invalidate_cache(world.tenant, policy.policy_version_id).await;
	assert!(world
		.evaluator
		.has_permission("u-1", world.tenant, APPROVE, invoice())
		.await);
}
