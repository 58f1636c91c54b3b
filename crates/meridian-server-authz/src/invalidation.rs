// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Cache invalidation signals between compiler instances.
//!
//! Each [`PolicyCompiler`](crate::PolicyCompiler) keeps a process-local cache.
//! When several instances serve the same tenants, a rule mutation on one must
//! evict the others. The [`InvalidationBus`] carries those evictions over a
//! `tokio::sync::broadcast` channel; a host bridges it to its own pub/sub
//! transport by subscribing on one side and publishing received events on the
//! other.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use meridian_authz_core::{PolicyVersionId, TenantId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::config::AuthzConfig;

/// Default capacity of the invalidation channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// One eviction. `policy_version_id: None` clears the whole cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
	/// Identifies the compiler that emitted the event.
	pub origin: Uuid,
	pub tenant_id: Option<TenantId>,
	pub policy_version_id: Option<PolicyVersionId>,
	pub emitted_at: DateTime<Utc>,
}

impl InvalidationEvent {
	pub fn version(origin: Uuid, tenant_id: TenantId, policy_version_id: PolicyVersionId) -> Self {
		Self {
			origin,
			tenant_id: Some(tenant_id),
			policy_version_id: Some(policy_version_id),
			emitted_at: Utc::now(),
		}
	}

	pub fn clear_all(origin: Uuid) -> Self {
		Self {
			origin,
			tenant_id: None,
			policy_version_id: None,
			emitted_at: Utc::now(),
		}
	}

	pub fn is_clear_all(&self) -> bool {
		self.policy_version_id.is_none()
	}
}

/// Fan-out of [`InvalidationEvent`]s to every subscribed compiler.
#[derive(Debug)]
pub struct InvalidationBus {
	sender: broadcast::Sender<InvalidationEvent>,
	published: AtomicU64,
}

impl InvalidationBus {
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity.max(1));
		Self {
			sender,
			published: AtomicU64::new(0),
		}
	}

	/// A bus sized by `invalidation_channel_capacity`.
	pub fn from_config(config: &AuthzConfig) -> Self {
		Self::new(config.invalidation_channel_capacity)
	}

	/// Publishes an event. Returns the number of receivers it reached.
	pub fn publish(&self, event: InvalidationEvent) -> usize {
		self.published.fetch_add(1, Ordering::Relaxed);
		match self.sender.send(event) {
			Ok(receivers) => receivers,
			Err(_) => {
				debug!("invalidation published with no subscribers");
				0
			}
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
		self.sender.subscribe()
	}

	pub fn receiver_count(&self) -> usize {
		self.sender.receiver_count()
	}

	pub fn published_count(&self) -> u64 {
		self.published.load(Ordering::Relaxed)
	}
}

impl Default for InvalidationBus {
	fn default() -> Self {
		Self::new(DEFAULT_CHANNEL_CAPACITY)
	}
}
