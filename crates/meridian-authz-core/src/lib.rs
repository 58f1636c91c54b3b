// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Meridian policy-based authorization engine.
//!
//! This crate holds everything about an authorization decision that does not
//! need I/O. It is used by the server-side engine (`meridian-server-authz`),
//! which adds stores, caching and the async entry points.
//!
//! # Overview
//!
//! - [`condition`]: ABAC condition trees and their evaluator
//! - [`policy`]: raw rules, the compiled three-level rule index and its hash
//! - [`subject`]: the read-only snapshot of the requesting principal
//! - [`decision`]: requests, decisions and effect precedence
//! - [`types`]: identifiers and the scope/effect/subject vocabularies
//!
//! # Example
//!
//! ```
//! use meridian_authz_core::{evaluate, ConditionExpr, EvaluationContext};
//! use serde_json::json;
//!
//! let expr: ConditionExpr = serde_json::from_value(json!({
//!     "field": "subject.attributes.department",
//!     "operator": "eq",
//!     "value": "finance"
//! }))
//! .unwrap();
//!
//! let ctx = EvaluationContext::from_parts(
//!     json!({ "attributes": { "department": "finance" } }),
//!     json!({}),
//!     json!({}),
//! );
//! assert!(evaluate(&expr, &ctx));
//! ```

pub mod condition;
pub mod decision;
pub mod error;
pub mod policy;
pub mod subject;
pub mod types;

pub use condition::{
	evaluate, evaluate_optional, ComparisonOperator, Condition, ConditionExpr, ConditionGroup,
	EvaluationContext, LogicalOperator,
};
pub use decision::{
	resolve_precedence, AuthorizationDecision, AuthorizationRequest, ResourceDescriptor,
	REASON_NO_MATCHING_RULES, REASON_NO_POLICIES,
};
pub use error::{CoreError, Result};
pub use policy::{
	build_rule_index, CompiledPolicy, CompiledRule, PolicyRule, PolicyVersionMeta, RuleIndex,
	RuleOperationLink,
};
pub use subject::SubjectSnapshot;
pub use types::{
	scope_index_key, subject_index_key, Effect, PolicyId, PolicyVersionId, RuleId, ScopeType,
	SubjectType, TenantId, WILDCARD,
};
