// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Cache invalidation fanned out between evaluator instances.

use std::sync::Arc;
use std::time::Duration;

use meridian_server_authz::{
	Effect, InvalidationBus, PolicyCompiler, PolicyRule, ScopeType, SubjectType,
};

use super::support::{invoice, World, READ};

async fn eventually<F, Fut>(mut check: F) -> bool
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = bool>,
{
	for _ in 0..100 {
		if check().await {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	false
}

#[tokio::test]
async fn invalidation_on_one_instance_reaches_the_other() {
	let base = World::new().await;
	let bus = Arc::new(InvalidationBus::new(16));
	let a = base
		.sibling(PolicyCompiler::new(base.store.clone(), base.store.clone()).with_invalidation_bus(bus.clone()))
		.await;
	let b = base
		.sibling(PolicyCompiler::new(base.store.clone(), base.store.clone()).with_invalidation_bus(bus.clone()))
		.await;
	let listener_a = a.compiler.spawn_invalidation_listener().unwrap();
	let listener_b = b.compiler.spawn_invalidation_listener().unwrap();

	base.subject(base.user("u-1").with_role("clerk")).await;
	let policy = base.policy(ScopeType::Entity, Some("invoice")).await;
	let rule = base
		.rule(PolicyRule::new(
			policy.policy_version_id,
			ScopeType::Entity,
			SubjectType::Role,
			"clerk",
			Effect::Allow,
			1,
		))
		.await;

	assert!(a.evaluator.has_permission("u-1", a.tenant, READ, invoice()).await);
	assert_eq!(a.compiler.stats().await.cached, 1);

	base.store
		.set_rule_active(base.tenant, policy.policy_version_id, rule.id, false)
		.await;
	// A still serves its cached allow.
	assert!(a.evaluator.has_permission("u-1", a.tenant, READ, invoice()).await);

	b.compiler
		.invalidate_cache(b.tenant, policy.policy_version_id)
		.await;
	assert_eq!(bus.published_count(), 1);

	let denied = eventually(|| async {
		!a.evaluator.has_permission("u-1", a.tenant, READ, invoice()).await
	})
	.await;
	assert!(denied);

	listener_a.abort();
	listener_b.abort();
}

#[tokio::test]
async fn clear_cache_reaches_every_instance() {
	let base = World::new().await;
	let bus = Arc::new(InvalidationBus::new(16));
	let a = base
		.sibling(PolicyCompiler::new(base.store.clone(), base.store.clone()).with_invalidation_bus(bus.clone()))
		.await;
	let b = base
		.sibling(PolicyCompiler::new(base.store.clone(), base.store.clone()).with_invalidation_bus(bus.clone()))
		.await;
	let listener = a.compiler.spawn_invalidation_listener().unwrap();

	base.subject(base.user("u-1")).await;
	for scope in ["billing", "payroll"] {
		let policy = base.policy(ScopeType::Module, Some(scope)).await;
		base.rule(
			PolicyRule::new(
				policy.policy_version_id,
				ScopeType::Module,
				SubjectType::Wildcard,
				"*",
				Effect::Allow,
				1,
			)
			.with_scope_key(scope),
		)
		.await;
		a.compiler
			.get_or_compile(a.tenant, policy.policy_version_id, "warmup")
			.await
			.unwrap();
	}
	assert_eq!(a.compiler.stats().await.cached, 2);

	b.compiler.clear_cache().await;
	let cleared = eventually(|| async { a.compiler.stats().await.cached == 0 }).await;
	assert!(cleared);

	// Persisted artifacts are stale after a clear, so A recompiles from rules.
	let loads = base.store.load_counts().rule_loads;
	assert!(a.evaluator.has_permission("u-1", a.tenant, READ, invoice()).await);
	assert!(base.store.load_counts().rule_loads > loads);

	listener.abort();
}

#[tokio::test]
async fn invalidation_events_carry_the_publisher_origin() {
	let base = World::new().await;
	let bus = Arc::new(InvalidationBus::new(16));
	let a = base
		.sibling(base.compiler.clone().with_invalidation_bus(bus.clone()))
		.await;
	let mut events = bus.subscribe();
	let listener = a.compiler.spawn_invalidation_listener().unwrap();

	let policy = base.policy(ScopeType::Global, None).await;
	a.compiler
		.invalidate_cache(a.tenant, policy.policy_version_id)
		.await;

	let event = events.recv().await.unwrap();
	assert_eq!(event.origin, a.compiler.origin());
	assert_eq!(event.policy_version_id, Some(policy.policy_version_id));
	assert_eq!(event.tenant_id, Some(a.tenant));
	assert!(!event.is_clear_all());

	listener.abort();
}
