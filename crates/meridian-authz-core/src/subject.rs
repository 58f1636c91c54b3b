// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The requesting principal as seen at decision time.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{subject_index_key, SubjectType, TenantId};

/// Read-only picture of the requesting principal.
///
/// Produced by the host's subject resolver; the engine never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectSnapshot {
	pub principal_id: String,
	pub principal_type: String,
	pub tenant_id: TenantId,
	#[serde(default)]
	pub roles: Vec<String>,
	#[serde(default)]
	pub groups: Vec<String>,
	#[serde(default)]
	pub org_units: Vec<String>,
	#[serde(default)]
	pub attributes: Map<String, Value>,
}

impl SubjectSnapshot {
	/// Creates a user subject with no roles, groups or attributes.
	pub fn new(principal_id: impl Into<String>, tenant_id: TenantId) -> Self {
		Self {
			principal_id: principal_id.into(),
			principal_type: "user".to_string(),
			tenant_id,
			roles: Vec::new(),
			groups: Vec::new(),
			org_units: Vec::new(),
			attributes: Map::new(),
		}
	}

	/// Builder: add a role.
	pub fn with_role(mut self, role: impl Into<String>) -> Self {
		self.roles.push(role.into());
		self
	}

	/// Builder: add a group.
	pub fn with_group(mut self, group: impl Into<String>) -> Self {
		self.groups.push(group.into());
		self
	}

	/// Builder: add an organizational unit.
	pub fn with_org_unit(mut self, org_unit: impl Into<String>) -> Self {
		self.org_units.push(org_unit.into());
		self
	}

	/// Builder: set an ABAC attribute.
	pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
		self.attributes.insert(key.into(), value);
		self
	}

	pub fn has_role(&self, role: &str) -> bool {
		self.roles.iter().any(|r| r == role)
	}

	/// Every subject-index key this principal can be matched by: the user id,
	/// then each role, group and organizational unit.
	///
	/// The wildcard key is not included; the evaluator always probes it.
	pub fn default_subject_keys(&self) -> Vec<String> {
		let mut keys = Vec::with_capacity(
			1 + self.roles.len() + self.groups.len() + self.org_units.len(),
		);
		keys.push(subject_index_key(SubjectType::User, &self.principal_id));
		keys.extend(
			self
				.roles
				.iter()
				.map(|r| subject_index_key(SubjectType::Role, r)),
		);
		keys.extend(
			self
				.groups
				.iter()
				.map(|g| subject_index_key(SubjectType::Group, g)),
		);
		keys.extend(
			self
				.org_units
				.iter()
				.map(|ou| subject_index_key(SubjectType::OrgUnit, ou)),
		);
		keys
	}
}
