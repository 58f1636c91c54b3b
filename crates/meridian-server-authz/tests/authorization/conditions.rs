// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use meridian_server_authz::{
	ConditionExpr, Effect, PolicyRule, ScopeType, SubjectType, REASON_NO_MATCHING_RULES,
};
use serde_json::json;

use super::support::{invoice, World, READ};

fn finance_only() -> ConditionExpr {
	serde_json::from_value(json!({
		"field": "subject.attributes.department",
		"operator": "eq",
		"value": "finance"
	}))
	.unwrap()
}

#[tokio::test]
async fn failing_condition_excludes_the_rule() {
	let world = World::new().await;
	world
		.subject(world.user("u-1").with_role("clerk").with_attribute("department", json!("hr")))
		.await;
	world
		.subject(world.user("u-2").with_role("clerk").with_attribute("department", json!("finance")))
		.await;
	let policy = world.policy(ScopeType::Entity, Some("invoice")).await;
	world
		.rule(
			PolicyRule::new(
				policy.policy_version_id,
				ScopeType::Entity,
				SubjectType::Role,
				"clerk",
				Effect::Allow,
				10,
			)
			.with_conditions(finance_only()),
		)
		.await;

	let hr = world
		.evaluator
		.authorize(&world.request("u-1", READ, invoice()))
		.await;
	assert_eq!(hr.effect, Effect::Deny);
	assert_eq!(hr.reason, REASON_NO_MATCHING_RULES);
	assert!(hr.matched_rule_id.is_none());

	assert!(world
		.evaluator
		.has_permission("u-2", world.tenant, READ, invoice())
		.await);
}

#[tokio::test]
async fn non_matching_deny_does_not_affect_the_decision() {
	let world = World::new().await;
	world
		.subject(world.user("u-1").with_role("clerk").with_attribute("department", json!("hr")))
		.await;
	let policy = world.policy(ScopeType::Entity, Some("invoice")).await;

	world
		.rule(
			PolicyRule::new(
				policy.policy_version_id,
				ScopeType::Entity,
				SubjectType::Wildcard,
				"*",
				Effect::Deny,
				1,
			)
			.with_conditions(finance_only()),
		)
		.await;
	let allow = world
		.rule(PolicyRule::new(
			policy.policy_version_id,
			ScopeType::Entity,
			SubjectType::Role,
			"clerk",
			Effect::Allow,
			100,
		))
		.await;

	let decision = world
		.evaluator
		.authorize(&world.request("u-1", READ, invoice()))
		.await;
	assert!(decision.is_allowed());
	assert_eq!(decision.matched_rule_id, Some(allow.id));
}

#[tokio::test]
async fn stored_condition_trees_are_evaluated() {
	let world = World::new().await;
	world
		.subject(
			world
				.user("u-1")
				.with_role("approver")
				.with_attribute("approval_limit", json!(5000))
				.with_attribute("regions", json!(["emea", "apac"])),
		)
		.await;
	let policy = world.policy(ScopeType::Entity, Some("invoice")).await;

	let tree: ConditionExpr = serde_json::from_value(json!({
		"operator": "and",
		"conditions": [
			{ "field": "approval_limit", "comparison": "gte", "value": 1000 },
			{ "field": "resource.attributes.region", "operator": "in", "value": ["emea", "amer"] },
			{
				"operator": "not",
				"conditions": [
					{ "field": "resource.attributes.status", "operator": "eq", "value": "void" }
				]
			}
		]
	}))
	.unwrap();
	world
		.rule(
			PolicyRule::new(
				policy.policy_version_id,
				ScopeType::Entity,
				SubjectType::Role,
				"approver",
				Effect::Allow,
				10,
			)
			.with_conditions(tree),
		)
		.await;

	let open_emea = invoice()
		.with_attribute("region", json!("emea"))
		.with_attribute("status", json!("open"));
	assert!(world
		.evaluator
		.has_permission("u-1", world.tenant, READ, open_emea)
		.await);

	let void_emea = invoice()
		.with_attribute("region", json!("emea"))
		.with_attribute("status", json!("void"));
	assert!(!world
		.evaluator
		.has_permission("u-1", world.tenant, READ, void_emea)
		.await);

	let open_apac = invoice()
		.with_attribute("region", json!("apac"))
		.with_attribute("status", json!("open"));
	assert!(!world
		.evaluator
		.has_permission("u-1", world.tenant, READ, open_apac)
		.await);
}

#[tokio::test]
async fn malformed_regex_only_disables_its_own_rule() {
	let world = World::new().await;
	world
		.subject(world.user("u-1").with_attribute("email", json!("a@corp.example")))
		.await;
	let policy = world.policy(ScopeType::Entity, Some("invoice")).await;

	world
		.rule(
			PolicyRule::new(
				policy.policy_version_id,
				ScopeType::Entity,
				SubjectType::Wildcard,
				"*",
				Effect::Deny,
				1,
			)
			.with_conditions(
				serde_json::from_value(json!({
					"field": "subject.attributes.email",
					"operator": "matches",
					"value": "(unclosed"
				}))
				.unwrap(),
			),
		)
		.await;
	world
		.rule(
			PolicyRule::new(
				policy.policy_version_id,
				ScopeType::Entity,
				SubjectType::User,
				"u-1",
				Effect::Allow,
				5,
			)
			.with_conditions(
				serde_json::from_value(json!({
					"field": "subject.attributes.email",
					"operator": "ends_with",
					"value": "@corp.example"
				}))
				.unwrap(),
			),
		)
		.await;

	assert!(world
		.evaluator
		.has_permission("u-1", world.tenant, READ, invoice())
		.await);
}
