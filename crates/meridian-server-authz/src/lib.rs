// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Policy-based authorization engine for Meridian.
//!
//! This crate compiles policy versions into indexed rule sets and answers
//! authorization requests against them, failing closed on every error.
//!
//! # Architecture
//!
//! - `collaborators` - Host-supplied subject, operation and policy resolution
//! - `store` - Authored rules and compiled artifacts (in-memory and SQLite)
//! - `compiler` - Cached, single-flight policy compilation
//! - `evaluator` - `authorize` / `has_permission`
//! - `invalidation` - Cache eviction fan-out between compiler instances
//! - `config` / `logging` - Layered configuration and tracing setup
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use meridian_server_authz::*;
//!
//! let config = load_config("authz.toml")?;
//! init_tracing(&config.logging);
//!
//! let pool = create_pool("sqlite:./authz.db").await?;
//! run_migrations(&pool).await?;
//! let store = Arc::new(SqlitePolicyStore::new(pool));
//!
//! let bus = Arc::new(InvalidationBus::from_config(&config));
//! let compiler = PolicyCompiler::from_config(store.clone(), store, &config).with_invalidation_bus(bus);
//! compiler.spawn_invalidation_listener();
//! let evaluator = RuleEvaluator::new(subjects, operations, policies, compiler, config.evaluator.clone());
//!
//! let request = AuthorizationRequest::new("u-1", tenant_id, "invoice.read", ResourceDescriptor::entity("invoice"));
//! let decision = evaluator.authorize(&request).await;
//! ```

pub mod collaborators;
pub mod compiler;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod invalidation;
pub mod logging;
pub mod store;

pub use collaborators::{
	ApplicablePolicy, Operation, OperationCatalog, PolicyResolution, StaticOperationCatalog,
	StaticPolicyResolution, StaticSubjectResolver, SubjectResolver,
};
pub use compiler::{CompilerConfig, CompilerStats, PolicyCompiler};
pub use config::{load_config, load_config_from_env, AuthzConfig, AuthzConfigLayer, ConfigError};
pub use error::{AuthzError, Result};
pub use evaluator::{EvaluatorConfig, RuleEvaluator};
pub use invalidation::{InvalidationBus, InvalidationEvent};
pub use logging::{init_tracing, LoggingConfig};
pub use store::{
	create_memory_pool, create_pool, run_migrations, CompiledPolicyStore, InMemoryPolicyStore,
	LoadCounts, PolicyRuleStore, SqlitePolicyStore,
};

// Re-export core types for convenience
pub use meridian_authz_core::*;
