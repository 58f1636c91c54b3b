// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! ABAC condition trees and their evaluator.
//!
//! A rule's `conditions` is either a boolean group (`and` / `or` / `not` over
//! child expressions) or a leaf comparison of one context field against a
//! literal value. Fields are dot paths into one of three namespaces:
//!
//! - `subject.*`: the [`SubjectSnapshot`](crate::SubjectSnapshot) of the requester
//! - `resource.*`: the [`ResourceDescriptor`](crate::ResourceDescriptor) being accessed
//! - `environment.*`: request-time facts such as `environment.timestamp`
//!
//! A path whose first segment names none of them is looked up as a flat ABAC
//! attribute, `subject.attributes[field]`.
//!
//! Evaluation is total: type mismatches, unknown operators and malformed
//! regular expressions all yield `false`. One malformed rule must never take
//! down evaluation of the others.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::decision::ResourceDescriptor;
use crate::error::Result;
use crate::subject::SubjectSnapshot;

/// A condition tree: either a boolean group or a leaf comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionExpr {
	Group(ConditionGroup),
	Leaf(Condition),
}

impl ConditionExpr {
	/// Builds an `and` group.
	pub fn all(conditions: Vec<ConditionExpr>) -> Self {
		ConditionExpr::Group(ConditionGroup {
			operator: LogicalOperator::And,
			conditions,
		})
	}

	/// Builds an `or` group.
	pub fn any(conditions: Vec<ConditionExpr>) -> Self {
		ConditionExpr::Group(ConditionGroup {
			operator: LogicalOperator::Or,
			conditions,
		})
	}

	/// Builds a `not` group around a single child.
	pub fn negate(condition: ConditionExpr) -> Self {
		ConditionExpr::Group(ConditionGroup {
			operator: LogicalOperator::Not,
			conditions: vec![condition],
		})
	}

	/// Builds a leaf comparison.
	pub fn leaf(field: impl Into<String>, operator: ComparisonOperator, value: Value) -> Self {
		ConditionExpr::Leaf(Condition {
			field: field.into(),
			operator,
			value,
		})
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
	pub operator: LogicalOperator,
	pub conditions: Vec<ConditionExpr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
	And,
	Or,
	Not,
}

/// A single comparison of a context field against a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
	pub field: String,
	#[serde(alias = "comparison")]
	pub operator: ComparisonOperator,
	/// Ignored by `exists` / `not_exists`.
	#[serde(default, skip_serializing_if = "Value::is_null")]
	pub value: Value,
}

/// Leaf comparison operators.
///
/// Unrecognised operator names deserialize into [`ComparisonOperator::Unknown`]
/// instead of failing, so a policy authored against a newer operator set still
/// loads and the offending leaf simply never matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ComparisonOperator {
	Eq,
	Ne,
	Gt,
	Gte,
	Lt,
	Lte,
	In,
	NotIn,
	Contains,
	StartsWith,
	EndsWith,
	Matches,
	Exists,
	NotExists,
	Unknown(String),
}

impl ComparisonOperator {
	pub fn as_str(&self) -> &str {
		match self {
			ComparisonOperator::Eq => "eq",
			ComparisonOperator::Ne => "ne",
			ComparisonOperator::Gt => "gt",
			ComparisonOperator::Gte => "gte",
			ComparisonOperator::Lt => "lt",
			ComparisonOperator::Lte => "lte",
			ComparisonOperator::In => "in",
			ComparisonOperator::NotIn => "not_in",
			ComparisonOperator::Contains => "contains",
			ComparisonOperator::StartsWith => "starts_with",
			ComparisonOperator::EndsWith => "ends_with",
			ComparisonOperator::Matches => "matches",
			ComparisonOperator::Exists => "exists",
			ComparisonOperator::NotExists => "not_exists",
			ComparisonOperator::Unknown(name) => name,
		}
	}
}

impl From<String> for ComparisonOperator {
	fn from(name: String) -> Self {
		match name.as_str() {
			"eq" => ComparisonOperator::Eq,
			"ne" => ComparisonOperator::Ne,
			"gt" => ComparisonOperator::Gt,
			"gte" => ComparisonOperator::Gte,
			"lt" => ComparisonOperator::Lt,
			"lte" => ComparisonOperator::Lte,
			"in" => ComparisonOperator::In,
			"not_in" => ComparisonOperator::NotIn,
			"contains" => ComparisonOperator::Contains,
			"starts_with" => ComparisonOperator::StartsWith,
			"ends_with" => ComparisonOperator::EndsWith,
			"matches" => ComparisonOperator::Matches,
			"exists" => ComparisonOperator::Exists,
			"not_exists" => ComparisonOperator::NotExists,
			_ => ComparisonOperator::Unknown(name),
		}
	}
}

impl From<ComparisonOperator> for String {
	fn from(op: ComparisonOperator) -> Self {
		match op {
			ComparisonOperator::Unknown(name) => name,
			other => other.as_str().to_string(),
		}
	}
}

impl fmt::Display for ComparisonOperator {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// The three namespaces a condition can read from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationContext {
	pub subject: Value,
	pub resource: Value,
	pub environment: Value,
}

impl EvaluationContext {
	/// Builds a context directly from JSON documents.
	pub fn from_parts(subject: Value, resource: Value, environment: Value) -> Self {
		Self {
			subject,
			resource,
			environment,
		}
	}

	/// Projects the typed request inputs into the JSON namespaces conditions
	/// address.
	pub fn build(
		subject: &SubjectSnapshot,
		resource: &ResourceDescriptor,
		environment: Map<String, Value>,
	) -> Result<Self> {
		Ok(Self {
			subject: serde_json::to_value(subject)?,
			resource: serde_json::to_value(resource)?,
			environment: Value::Object(environment),
		})
	}

	/// Resolves a dot-notation field.
	///
	/// Returns `None` for unresolvable paths, which is distinct from a path that
	/// resolves to JSON `null`.
	pub fn resolve(&self, field: &str) -> Option<&Value> {
		let mut segments = field.split('.');
		let root = match segments.next()? {
			"subject" => &self.subject,
			"resource" => &self.resource,
			"environment" => &self.environment,
			_ => return self.subject.get("attributes")?.get(field),
		};

		segments.try_fold(root, |current, segment| match current {
			Value::Object(map) => map.get(segment),
			Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
			_ => None,
		})
	}
}

/// Evaluates a condition tree against a context.
pub fn evaluate(expr: &ConditionExpr, ctx: &EvaluationContext) -> bool {
	match expr {
		ConditionExpr::Group(group) => evaluate_group(group, ctx),
		ConditionExpr::Leaf(condition) => evaluate_condition(condition, ctx),
	}
}

/// Evaluates a rule's optional conditions; a rule without conditions is
/// unconstrained.
pub fn evaluate_optional(expr: Option<&ConditionExpr>, ctx: &EvaluationContext) -> bool {
	expr.map_or(true, |e| evaluate(e, ctx))
}

fn evaluate_group(group: &ConditionGroup, ctx: &EvaluationContext) -> bool {
	match group.operator {
		LogicalOperator::And => group.conditions.iter().all(|c| evaluate(c, ctx)),
		LogicalOperator::Or => group.conditions.iter().any(|c| evaluate(c, ctx)),
		// An empty `not` is false rather than vacuously true.
		LogicalOperator::Not => group
			.conditions
			.first()
			.map_or(false, |c| !evaluate(c, ctx)),
	}
}

fn evaluate_condition(condition: &Condition, ctx: &EvaluationContext) -> bool {
	let actual = ctx.resolve(&condition.field);
	let expected = &condition.value;

	match &condition.operator {
		ComparisonOperator::Eq => actual.is_some_and(|a| values_equal(a, expected)),
		ComparisonOperator::Ne => !actual.is_some_and(|a| values_equal(a, expected)),
		ComparisonOperator::Gt => compare_numbers(actual, expected, |a, b| a > b),
		ComparisonOperator::Gte => compare_numbers(actual, expected, |a, b| a >= b),
		ComparisonOperator::Lt => compare_numbers(actual, expected, |a, b| a < b),
		ComparisonOperator::Lte => compare_numbers(actual, expected, |a, b| a <= b),
		ComparisonOperator::In => match expected {
			Value::Array(items) => actual.is_some_and(|a| contains_value(items, a)),
			_ => false,
		},
		ComparisonOperator::NotIn => match expected {
			Value::Array(items) => !actual.is_some_and(|a| contains_value(items, a)),
			_ => false,
		},
		ComparisonOperator::Contains => match actual {
			Some(Value::String(haystack)) => expected
				.as_str()
				.is_some_and(|needle| haystack.contains(needle)),
			Some(Value::Array(items)) => contains_value(items, expected),
			_ => false,
		},
		ComparisonOperator::StartsWith => match (actual, expected) {
			(Some(Value::String(a)), Value::String(prefix)) => a.starts_with(prefix.as_str()),
			_ => false,
		},
		ComparisonOperator::EndsWith => match (actual, expected) {
			(Some(Value::String(a)), Value::String(suffix)) => a.ends_with(suffix.as_str()),
			_ => false,
		},
		ComparisonOperator::Matches => match (actual, expected) {
			(Some(Value::String(a)), Value::String(pattern)) => match Regex::new(pattern) {
				Ok(re) => re.is_match(a),
				Err(e) => {
					debug!(field = %condition.field, pattern = %pattern, error = %e, "invalid condition pattern");
					false
				}
			},
			_ => false,
		},
		ComparisonOperator::Exists => actual.is_some_and(|a| !a.is_null()),
		ComparisonOperator::NotExists => actual.map_or(true, Value::is_null),
		ComparisonOperator::Unknown(name) => {
			warn!(field = %condition.field, operator = %name, "unknown condition operator");
			false
		}
	}
}

/// Strict equality, except that numbers compare by value so `1` equals `1.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
	match (a, b) {
		(Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
		_ => a == b,
	}
}

fn contains_value(items: &[Value], needle: &Value) -> bool {
	items.iter().any(|item| values_equal(item, needle))
}

fn compare_numbers(actual: Option<&Value>, expected: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
	match (actual.and_then(Value::as_f64), expected.as_f64()) {
		(Some(a), Some(b)) => cmp(a, b),
		_ => false,
	}
}
