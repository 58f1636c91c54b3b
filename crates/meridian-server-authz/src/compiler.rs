// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Policy compiler with an in-memory cache and single-flight compilation.
//!
//! # Read path
//!
//! [`PolicyCompiler::get_compiled_policy`] checks the in-memory cache, then the
//! latest persisted artifact. It never compiles.
//!
//! # Compilation
//!
//! [`PolicyCompiler::compile`] always rebuilds the index from the authored
//! rules. Concurrent calls for the same `(tenant, version)` share one
//! in-flight future, so rules are loaded once per burst. The in-flight entry
//! is removed when the compile finishes, successfully or not, and the next
//! call starts over. A panic while compiling is reported to the waiters as an
//! error like any other failure.
//!
//! # Invalidation
//!
//! Invalidating a key evicts it from the cache, detaches any in-flight
//! compile (its result is still returned to its waiters but is not cached),
//! and marks the key stale so persisted artifacts are ignored until the next
//! successful compile.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use meridian_authz_core::{CompiledPolicy, PolicyVersionId, RuleId, TenantId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::AuthzConfig;
use crate::error::{AuthzError, Result};
use crate::invalidation::{InvalidationBus, InvalidationEvent};
use crate::store::{CompiledPolicyStore, PolicyRuleStore};

type CacheKey = (TenantId, PolicyVersionId);
type CompileOutcome = std::result::Result<Arc<CompiledPolicy>, Arc<AuthzError>>;
type SharedCompile = Shared<BoxFuture<'static, CompileOutcome>>;

/// Compiler behaviour switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerConfig {
	/// Keep compiled policies in process memory.
	pub cache_enabled: bool,
	/// Write compiled artifacts to the compiled-policy store and read them back
	/// on cache misses.
	pub persist_compiled: bool,
}

impl Default for CompilerConfig {
	fn default() -> Self {
		Self {
			cache_enabled: true,
			persist_compiled: true,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerStats {
	pub cached: usize,
	pub in_flight: usize,
}

struct InFlight {
	ticket: u64,
	future: SharedCompile,
}

/// Keys whose persisted artifacts must not be trusted.
///
/// After a full clear every key is stale except those compiled since.
#[derive(Default)]
struct Staleness {
	all: bool,
	keys: HashSet<CacheKey>,
	fresh: HashSet<CacheKey>,
}

impl Staleness {
	fn mark(&mut self, key: CacheKey) {
		if self.all {
			self.fresh.remove(&key);
		} else {
			self.keys.insert(key);
		}
	}

	fn mark_all(&mut self) {
		self.all = true;
		self.keys.clear();
		self.fresh.clear();
	}

	fn refresh(&mut self, key: CacheKey) {
		if self.all {
			self.fresh.insert(key);
		} else {
			self.keys.remove(&key);
		}
	}

	fn is_stale(&self, key: &CacheKey) -> bool {
		if self.all {
			!self.fresh.contains(key)
		} else {
			self.keys.contains(key)
		}
	}
}

#[derive(Default)]
struct FlightState {
	in_flight: HashMap<CacheKey, InFlight>,
	staleness: Staleness,
}

struct Inner {
	rules: Arc<dyn PolicyRuleStore>,
	artifacts: Arc<dyn CompiledPolicyStore>,
	config: CompilerConfig,
	cache: RwLock<HashMap<CacheKey, Arc<CompiledPolicy>>>,
	// Lock order: `state` before `cache`.
	state: Mutex<FlightState>,
	next_ticket: AtomicU64,
	bus: Option<Arc<InvalidationBus>>,
	origin: Uuid,
}

/// Compiles policy versions into cached, hash-stamped rule indexes.
///
/// Cloning is cheap; clones share the cache and the in-flight map.
#[derive(Clone)]
pub struct PolicyCompiler {
	inner: Arc<Inner>,
}

impl PolicyCompiler {
	pub fn new(rules: Arc<dyn PolicyRuleStore>, artifacts: Arc<dyn CompiledPolicyStore>) -> Self {
		Self::with_config(rules, artifacts, CompilerConfig::default())
	}

	pub fn with_config(
		rules: Arc<dyn PolicyRuleStore>,
		artifacts: Arc<dyn CompiledPolicyStore>,
		config: CompilerConfig,
	) -> Self {
		Self::build(rules, artifacts, config, None)
	}

	/// Uses the `[compiler]` section of a loaded configuration.
	pub fn from_config(
		rules: Arc<dyn PolicyRuleStore>,
		artifacts: Arc<dyn CompiledPolicyStore>,
		config: &AuthzConfig,
	) -> Self {
		Self::with_config(rules, artifacts, config.compiler.clone())
	}

	/// Builder: publish invalidations on `bus`. Must be called before the
	/// compiler is shared; the returned compiler starts with an empty cache.
	pub fn with_invalidation_bus(self, bus: Arc<InvalidationBus>) -> Self {
		Self::build(
			Arc::clone(&self.inner.rules),
			Arc::clone(&self.inner.artifacts),
			self.inner.config.clone(),
			Some(bus),
		)
	}

	fn build(
		rules: Arc<dyn PolicyRuleStore>,
		artifacts: Arc<dyn CompiledPolicyStore>,
		config: CompilerConfig,
		bus: Option<Arc<InvalidationBus>>,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				rules,
				artifacts,
				config,
				cache: RwLock::new(HashMap::new()),
				state: Mutex::new(FlightState::default()),
				next_ticket: AtomicU64::new(0),
				bus,
				origin: Uuid::new_v4(),
			}),
		}
	}

	pub fn config(&self) -> &CompilerConfig {
		&self.inner.config
	}

	/// Identifies this compiler on the invalidation bus.
	pub fn origin(&self) -> Uuid {
		self.inner.origin
	}

	/// Read path: cache, then the latest persisted artifact.
	#[instrument(skip(self), fields(tenant_id = %tenant_id, policy_version_id = %policy_version_id))]
	pub async fn get_compiled_policy(
		&self,
		tenant_id: TenantId,
		policy_version_id: PolicyVersionId,
	) -> Result<Option<Arc<CompiledPolicy>>> {
		let key = (tenant_id, policy_version_id);
		let inner = &self.inner;

		if inner.config.cache_enabled {
			if let Some(hit) = inner.cache.read().await.get(&key) {
				return Ok(Some(Arc::clone(hit)));
			}
		}

		if !inner.config.persist_compiled || inner.state.lock().await.staleness.is_stale(&key) {
			return Ok(None);
		}

		let Some(stored) = inner
			.artifacts
			.get_latest_compiled(tenant_id, policy_version_id)
			.await?
		else {
			return Ok(None);
		};
		let stored = Arc::new(stored);

		if inner.config.cache_enabled {
			let state = inner.state.lock().await;
			// An invalidation may have landed while the artifact was loading.
			if !state.staleness.is_stale(&key) {
				inner.cache.write().await.insert(key, Arc::clone(&stored));
			}
		}

		debug!(hash = %stored.hash, "loaded persisted compiled policy");
		Ok(Some(stored))
	}

	/// Recompiles a policy version from its authored rules.
	///
	/// Joins the in-flight compile for the key if there is one.
	#[instrument(skip(self), fields(tenant_id = %tenant_id, policy_version_id = %policy_version_id))]
	pub async fn compile(
		&self,
		tenant_id: TenantId,
		policy_version_id: PolicyVersionId,
		compiled_by: &str,
	) -> Result<Arc<CompiledPolicy>> {
		let key = (tenant_id, policy_version_id);

		let future = {
			let mut state = self.inner.state.lock().await;
			match state.in_flight.get(&key) {
				Some(existing) => {
					debug!("joining in-flight compilation");
					existing.future.clone()
				}
				None => {
					let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
					let future = Self::start(Arc::clone(&self.inner), key, ticket, compiled_by.to_string());
					state.in_flight.insert(
						key,
						InFlight {
							ticket,
							future: future.clone(),
						},
					);
					future
				}
			}
		};

		future.await.map_err(AuthzError::from_shared)
	}

	fn start(inner: Arc<Inner>, key: CacheKey, ticket: u64, compiled_by: String) -> SharedCompile {
		async move {
			let outcome = AssertUnwindSafe(inner.compile_from_source(key.0, key.1, &compiled_by))
				.catch_unwind()
				.await
				.unwrap_or_else(|_| {
					warn!(tenant_id = %key.0, policy_version_id = %key.1, "policy compilation panicked");
					Err(AuthzError::Internal("policy compilation panicked".to_string()))
				})
				.map(Arc::new);
			inner.finish(key, ticket, &outcome).await;
			outcome.map_err(Arc::new)
		}
		.boxed()
		.shared()
	}

	/// Read path first, compile on miss. Failures are logged and reported as
	/// `None` so the caller can treat the policy as absent.
	#[instrument(skip(self), fields(tenant_id = %tenant_id, policy_version_id = %policy_version_id))]
	pub async fn get_or_compile(
		&self,
		tenant_id: TenantId,
		policy_version_id: PolicyVersionId,
		compiled_by: &str,
	) -> Option<Arc<CompiledPolicy>> {
		match self.get_compiled_policy(tenant_id, policy_version_id).await {
			Ok(Some(compiled)) => return Some(compiled),
			Ok(None) => {}
			Err(e) => warn!(error = %e, "compiled policy lookup failed, compiling from source"),
		}

		match self.compile(tenant_id, policy_version_id, compiled_by).await {
			Ok(compiled) => Some(compiled),
			Err(e) => {
				warn!(error = %e, "policy compilation failed, skipping policy");
				None
			}
		}
	}

	/// Evicts one policy version here and, when a bus is attached, on every
	/// other subscribed compiler.
	#[instrument(skip(self), fields(tenant_id = %tenant_id, policy_version_id = %policy_version_id))]
	pub async fn invalidate_cache(&self, tenant_id: TenantId, policy_version_id: PolicyVersionId) {
		self.inner.evict((tenant_id, policy_version_id)).await;
		self.inner.publish(InvalidationEvent::version(
			self.inner.origin,
			tenant_id,
			policy_version_id,
		));
	}

	/// Evicts everything, locally and on the bus.
	#[instrument(skip(self))]
	pub async fn clear_cache(&self) {
		self.inner.evict_all().await;
		self.inner.publish(InvalidationEvent::clear_all(self.inner.origin));
	}

	/// Publish hook: drop whatever is cached for the version and compile it
	/// afresh.
	#[instrument(skip(self), fields(tenant_id = %tenant_id, policy_version_id = %policy_version_id))]
	pub async fn compile_on_publish(
		&self,
		tenant_id: TenantId,
		policy_version_id: PolicyVersionId,
		published_by: &str,
	) -> Result<()> {
		self.invalidate_cache(tenant_id, policy_version_id).await;
		let compiled = self.compile(tenant_id, policy_version_id, published_by).await?;
		info!(hash = %compiled.hash, rule_count = compiled.rule_count, "policy version published");
		Ok(())
	}

	pub async fn stats(&self) -> CompilerStats {
		let in_flight = self.inner.state.lock().await.in_flight.len();
		let cached = self.inner.cache.read().await.len();
		CompilerStats { cached, in_flight }
	}

	/// Applies invalidations published by other compilers on the attached bus.
	///
	/// Returns `None` when no bus is attached. The task ends when the bus
	/// closes or this compiler is dropped; events from this compiler are
	/// ignored and a lagged receiver clears the whole cache.
	pub fn spawn_invalidation_listener(&self) -> Option<JoinHandle<()>> {
		let bus = self.inner.bus.as_ref()?;
		let mut receiver = bus.subscribe();
		let origin = self.inner.origin;
		let inner: Weak<Inner> = Arc::downgrade(&self.inner);

		Some(tokio::spawn(async move {
			loop {
				let received = receiver.recv().await;
				let Some(inner) = inner.upgrade() else {
					break;
				};
				match received {
					Ok(event) if event.origin == origin => {}
					Ok(event) => {
						debug!(
							origin = %event.origin,
							policy_version_id = ?event.policy_version_id,
							"applying remote invalidation"
						);
						match (event.tenant_id, event.policy_version_id) {
							(Some(tenant_id), Some(policy_version_id)) => {
								inner.evict((tenant_id, policy_version_id)).await
							}
							_ => inner.evict_all().await,
						}
					}
					Err(RecvError::Lagged(skipped)) => {
						warn!(skipped, "invalidation listener lagged, clearing cache");
						inner.evict_all().await;
					}
					Err(RecvError::Closed) => break,
				}
			}
			debug!("invalidation listener stopped");
		}))
	}
}

impl Inner {
	async fn compile_from_source(
		&self,
		tenant_id: TenantId,
		policy_version_id: PolicyVersionId,
		compiled_by: &str,
	) -> Result<CompiledPolicy> {
		let meta = self
			.rules
			.get_policy_version(tenant_id, policy_version_id)
			.await?
			.ok_or(AuthzError::PolicyVersionNotFound {
				tenant_id,
				policy_version_id,
			})?;

		let rules = self.rules.list_active_rules(tenant_id, policy_version_id).await?;
		let rule_ids: Vec<RuleId> = rules.iter().map(|r| r.id).collect();
		let links = self.rules.list_rule_operations(tenant_id, &rule_ids).await?;

		let compiled = CompiledPolicy::build(&meta, &rules, &links, compiled_by)?;

		if self.config.persist_compiled {
			let written = self.artifacts.insert_if_hash_absent(&compiled).await?;
			if !written {
				debug!(hash = %compiled.hash, "identical compiled policy already stored");
			}
		}

		info!(
			policy = %meta.name,
			hash = %compiled.hash,
			rule_count = compiled.rule_count,
			"compiled policy version"
		);
		Ok(compiled)
	}

	async fn finish(&self, key: CacheKey, ticket: u64, outcome: &Result<Arc<CompiledPolicy>>) {
		let mut state = self.state.lock().await;
		let current = state
			.in_flight
			.get(&key)
			.is_some_and(|flight| flight.ticket == ticket);
		if !current {
			debug!("compilation was invalidated while running, result not cached");
			return;
		}
		state.in_flight.remove(&key);

		if let Ok(compiled) = outcome {
			state.staleness.refresh(key);
			if self.config.cache_enabled {
				self.cache.write().await.insert(key, Arc::clone(compiled));
			}
		}
	}

	async fn evict(&self, key: CacheKey) {
		let mut state = self.state.lock().await;
		state.in_flight.remove(&key);
		state.staleness.mark(key);
		self.cache.write().await.remove(&key);
	}

	async fn evict_all(&self) {
		let mut state = self.state.lock().await;
		state.in_flight.clear();
		state.staleness.mark_all();
		self.cache.write().await.clear();
	}

	fn publish(&self, event: InvalidationEvent) {
		if let Some(bus) = &self.bus {
			let receivers = bus.publish(event);
			debug!(receivers, "published cache invalidation");
		}
	}
}
