// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Identifier newtypes and the vocabularies shared by rules and requests.
//!
//! - **ID newtypes**: type-safe wrappers around UUIDs ([`TenantId`],
//!   [`PolicyId`], [`PolicyVersionId`], [`RuleId`]) so a policy version can
//!   never be passed where a rule is expected
//! - **Scopes**: the five-level hierarchy a rule applies at ([`ScopeType`])
//! - **Effects**: what a matched rule decides ([`Effect`])
//! - **Subjects**: how a rule names who it applies to ([`SubjectType`])
//!
//! The index-key helpers at the bottom are the single definition of how scope
//! and subject keys are spelled; the compiler and the evaluator both go through
//! them so a probe can never drift from what was indexed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Wildcard used for scope keys, subject keys and operation ids.
pub const WILDCARD: &str = "*";

// =============================================================================
// ID Newtypes
// =============================================================================

macro_rules! define_id_type {
	($name:ident, $doc:expr) => {
		#[doc = $doc]
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(Uuid);

		impl $name {
			/// Create a new ID from a UUID.
			pub fn new(id: Uuid) -> Self {
				Self(id)
			}

			/// Generate a new random ID.
			pub fn generate() -> Self {
				Self(Uuid::new_v4())
			}

			/// Get the inner UUID value.
			pub fn into_inner(self) -> Uuid {
				self.0
			}

			/// Get a reference to the inner UUID.
			pub fn as_uuid(&self) -> &Uuid {
				&self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = uuid::Error;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Ok(Self(Uuid::parse_str(s)?))
			}
		}

		impl From<Uuid> for $name {
			fn from(id: Uuid) -> Self {
				Self(id)
			}
		}

		impl From<$name> for Uuid {
			fn from(id: $name) -> Self {
				id.0
			}
		}
	};
}

define_id_type!(TenantId, "Unique identifier for a tenant.");
define_id_type!(PolicyId, "Unique identifier for a policy.");
define_id_type!(
	PolicyVersionId,
	"Unique identifier for one version of a policy."
);
define_id_type!(RuleId, "Unique identifier for a rule.");

// =============================================================================
// Scopes
// =============================================================================

/// The hierarchy level a policy or rule applies at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
	Global,
	Module,
	Entity,
	EntityVersion,
	Record,
}

impl ScopeType {
	/// Returns all scope types, least specific first.
	pub fn all() -> &'static [ScopeType] {
		&[
			ScopeType::Global,
			ScopeType::Module,
			ScopeType::Entity,
			ScopeType::EntityVersion,
			ScopeType::Record,
		]
	}

	/// Precedence weight of the scope: `record` (5) beats `entity_version` (4)
	/// beats `entity` (3) beats `module` (2) beats `global` (1).
	pub fn specificity(self) -> u8 {
		match self {
			ScopeType::Global => 1,
			ScopeType::Module => 2,
			ScopeType::Entity => 3,
			ScopeType::EntityVersion => 4,
			ScopeType::Record => 5,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			ScopeType::Global => "global",
			ScopeType::Module => "module",
			ScopeType::Entity => "entity",
			ScopeType::EntityVersion => "entity_version",
			ScopeType::Record => "record",
		}
	}
}

impl fmt::Display for ScopeType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ScopeType {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"global" => Ok(ScopeType::Global),
			"module" => Ok(ScopeType::Module),
			"entity" => Ok(ScopeType::Entity),
			"entity_version" => Ok(ScopeType::EntityVersion),
			"record" => Ok(ScopeType::Record),
			other => Err(format!("unknown scope type: {other}")),
		}
	}
}

// =============================================================================
// Effects
// =============================================================================

/// The outcome a rule produces when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
	Allow,
	Deny,
}

impl Effect {
	pub fn as_str(self) -> &'static str {
		match self {
			Effect::Allow => "allow",
			Effect::Deny => "deny",
		}
	}
}

impl fmt::Display for Effect {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Effect {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"allow" => Ok(Effect::Allow),
			"deny" => Ok(Effect::Deny),
			other => Err(format!("unknown effect: {other}")),
		}
	}
}

// =============================================================================
// Subjects
// =============================================================================

/// How a rule identifies the principals it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
	User,
	Role,
	Group,
	OrgUnit,
	#[serde(rename = "*")]
	Wildcard,
}

impl SubjectType {
	pub fn as_str(self) -> &'static str {
		match self {
			SubjectType::User => "user",
			SubjectType::Role => "role",
			SubjectType::Group => "group",
			SubjectType::OrgUnit => "org_unit",
			SubjectType::Wildcard => WILDCARD,
		}
	}
}

impl fmt::Display for SubjectType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for SubjectType {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"user" => Ok(SubjectType::User),
			"role" => Ok(SubjectType::Role),
			"group" => Ok(SubjectType::Group),
			"org_unit" => Ok(SubjectType::OrgUnit),
			"*" | "wildcard" => Ok(SubjectType::Wildcard),
			other => Err(format!("unknown subject type: {other}")),
		}
	}
}

// =============================================================================
// Index keys
// =============================================================================

/// Scope dimension key of the rule index: `"{scope_type}:{scope_key}"`, with a
/// missing scope key spelled as the wildcard.
pub fn scope_index_key(scope_type: ScopeType, scope_key: Option<&str>) -> String {
	format!("{}:{}", scope_type, scope_key.unwrap_or(WILDCARD))
}

/// Subject dimension key of the rule index: `"{subject_type}:{subject_key}"`.
///
/// Wildcard rules are indexed under the bare `"*"` so every requester can probe
/// them without knowing the rule's subject key.
pub fn subject_index_key(subject_type: SubjectType, subject_key: &str) -> String {
	match subject_type {
		SubjectType::Wildcard => WILDCARD.to_string(),
		other => format!("{other}:{subject_key}"),
	}
}
