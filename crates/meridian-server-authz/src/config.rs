// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Layered engine configuration.
//!
//! Sources are merged lowest precedence first: built-in defaults, then a TOML
//! file, then environment variables.
//!
//! ```toml
//! invalidation_channel_capacity = 512
//!
//! [compiler]
//! cache_enabled = true
//! persist_compiled = true
//!
//! [evaluator]
//! parallel_compilation = false
//!
//! [logging]
//! level = "info,meridian_server_authz=debug"
//! json = true
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::compiler::CompilerConfig;
use crate::evaluator::{EvaluatorConfig, DEFAULT_COMPILED_BY};
use crate::invalidation::DEFAULT_CHANNEL_CAPACITY;
use crate::logging::{default_level, LoggingConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("Invalid value for {key}: {message}")]
	InvalidValue { key: String, message: String },

	#[error("Failed to parse TOML config at {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("Failed to read config file {path}: {source}")]
	FileRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

// Sections
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompilerConfigLayer {
	pub cache_enabled: Option<bool>,
	pub persist_compiled: Option<bool>,
}

impl CompilerConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.cache_enabled.is_some() {
			self.cache_enabled = other.cache_enabled;
		}
		if other.persist_compiled.is_some() {
			self.persist_compiled = other.persist_compiled;
		}
	}

	pub fn finalize(self) -> CompilerConfig {
		CompilerConfig {
			cache_enabled: self.cache_enabled.unwrap_or(true),
			persist_compiled: self.persist_compiled.unwrap_or(true),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvaluatorConfigLayer {
	pub parallel_compilation: Option<bool>,
	pub compiled_by: Option<String>,
}

impl EvaluatorConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.parallel_compilation.is_some() {
			self.parallel_compilation = other.parallel_compilation;
		}
		if other.compiled_by.is_some() {
			self.compiled_by = other.compiled_by;
		}
	}

	pub fn finalize(self) -> EvaluatorConfig {
		EvaluatorConfig {
			parallel_compilation: self.parallel_compilation.unwrap_or(true),
			compiled_by: self
				.compiled_by
				.unwrap_or_else(|| DEFAULT_COMPILED_BY.to_string()),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfigLayer {
	pub level: Option<String>,
	pub json: Option<bool>,
}

impl LoggingConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.level.is_some() {
			self.level = other.level;
		}
		if other.json.is_some() {
			self.json = other.json;
		}
	}

	pub fn finalize(self) -> LoggingConfig {
		LoggingConfig {
			level: self.level.unwrap_or_else(default_level),
			json: self.json.unwrap_or(false),
		}
	}
}

// Top level
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthzConfigLayer {
	pub compiler: Option<CompilerConfigLayer>,
	pub evaluator: Option<EvaluatorConfigLayer>,
	pub invalidation_channel_capacity: Option<usize>,
	pub logging: Option<LoggingConfigLayer>,
}

impl AuthzConfigLayer {
	pub fn merge(&mut self, other: Self) {
		merge_section(&mut self.compiler, other.compiler, CompilerConfigLayer::merge);
		merge_section(&mut self.evaluator, other.evaluator, EvaluatorConfigLayer::merge);
		merge_section(&mut self.logging, other.logging, LoggingConfigLayer::merge);
		if other.invalidation_channel_capacity.is_some() {
			self.invalidation_channel_capacity = other.invalidation_channel_capacity;
		}
	}

	pub fn finalize(self) -> Result<AuthzConfig, ConfigError> {
		let invalidation_channel_capacity = self
			.invalidation_channel_capacity
			.unwrap_or(DEFAULT_CHANNEL_CAPACITY);
		if invalidation_channel_capacity == 0 {
			return Err(ConfigError::InvalidValue {
				key: "invalidation_channel_capacity".to_string(),
				message: "must be greater than zero".to_string(),
			});
		}

		Ok(AuthzConfig {
			compiler: self.compiler.unwrap_or_default().finalize(),
			evaluator: self.evaluator.unwrap_or_default().finalize(),
			invalidation_channel_capacity,
			logging: self.logging.unwrap_or_default().finalize(),
		})
	}
}

fn merge_section<T>(base: &mut Option<T>, other: Option<T>, merge: fn(&mut T, T)) {
	let Some(other) = other else {
		return;
	};
	match base {
		Some(existing) => merge(existing, other),
		None => *base = Some(other),
	}
}

/// Fully resolved engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthzConfig {
	pub compiler: CompilerConfig,
	pub evaluator: EvaluatorConfig,
	pub invalidation_channel_capacity: usize,
	pub logging: LoggingConfig,
}

impl Default for AuthzConfig {
	fn default() -> Self {
		Self {
			compiler: CompilerConfig::default(),
			evaluator: EvaluatorConfig::default(),
			invalidation_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
			logging: LoggingConfig::default(),
		}
	}
}

// Sources
// =============================================================================

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
}

pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<AuthzConfigLayer, ConfigError>;
}

pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<AuthzConfigLayer, ConfigError> {
		debug!("loading defaults");
		Ok(AuthzConfigLayer::default())
	}
}

/// A TOML file. A missing file contributes nothing.
pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<AuthzConfigLayer, ConfigError> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(AuthzConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::FileRead {
			path: self.path.clone(),
			source: e,
		})?;

		let layer: AuthzConfigLayer =
			toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
				path: self.path.clone(),
				source: e,
			})?;

		trace!("parsed config layer from TOML");
		Ok(layer)
	}
}

/// Environment variable source.
///
/// Convention: MERIDIAN_AUTHZ_<FIELD>
pub struct EnvSource;

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<AuthzConfigLayer, ConfigError> {
		layer_from_vars(env_var)
	}
}

fn env_var(name: &str) -> Option<String> {
	std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn layer_from_vars(var: impl Fn(&str) -> Option<String>) -> Result<AuthzConfigLayer, ConfigError> {
	let compiler = CompilerConfigLayer {
		cache_enabled: parse_bool(&var, "MERIDIAN_AUTHZ_CACHE_ENABLED")?,
		persist_compiled: parse_bool(&var, "MERIDIAN_AUTHZ_PERSIST_COMPILED")?,
	};
	let evaluator = EvaluatorConfigLayer {
		parallel_compilation: parse_bool(&var, "MERIDIAN_AUTHZ_PARALLEL_COMPILATION")?,
		compiled_by: None,
	};
	let logging = LoggingConfigLayer {
		level: var("MERIDIAN_AUTHZ_LOG_LEVEL"),
		json: parse_bool(&var, "MERIDIAN_AUTHZ_LOG_JSON")?,
	};
	let invalidation_channel_capacity = match var("MERIDIAN_AUTHZ_INVALIDATION_CAPACITY") {
		Some(v) => Some(v.parse().map_err(|_| ConfigError::InvalidValue {
			key: "MERIDIAN_AUTHZ_INVALIDATION_CAPACITY".to_string(),
			message: format!("expected a positive integer, got {v:?}"),
		})?),
		None => None,
	};

	Ok(AuthzConfigLayer {
		compiler: Some(compiler),
		evaluator: Some(evaluator),
		invalidation_channel_capacity,
		logging: Some(logging),
	})
}

fn parse_bool(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<bool>, ConfigError> {
	match var(name) {
		None => Ok(None),
		Some(v) => match v.to_ascii_lowercase().as_str() {
			"true" | "1" | "yes" | "on" => Ok(Some(true)),
			"false" | "0" | "no" | "off" => Ok(Some(false)),
			_ => Err(ConfigError::InvalidValue {
				key: name.to_string(),
				message: format!("expected a boolean, got {v:?}"),
			}),
		},
	}
}

fn load_from(sources: Vec<Box<dyn ConfigSource>>) -> Result<AuthzConfig, ConfigError> {
	let mut sources = sources;
	sources.sort_by_key(|s| s.precedence());

	let mut merged = AuthzConfigLayer::default();
	for source in sources {
		debug!(source = source.name(), "loading configuration source");
		merged.merge(source.load()?);
	}

	merged.finalize()
}

/// Defaults, then the TOML file at `path`, then environment variables.
pub fn load_config(path: impl Into<PathBuf>) -> Result<AuthzConfig, ConfigError> {
	load_from(vec![
		Box::new(DefaultsSource),
		Box::new(TomlSource::new(path)),
		Box::new(EnvSource),
	])
}

/// Defaults overridden by environment variables only.
pub fn load_config_from_env() -> Result<AuthzConfig, ConfigError> {
	load_from(vec![Box::new(DefaultsSource), Box::new(EnvSource)])
}
