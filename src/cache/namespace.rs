use std::fmt;

use crate::config::CacheConfig;

/// Resource class a cache namespace holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
  /// Scripts, stylesheets, images, fonts and root documents
  Static,
  /// Pages outside the API namespace
  Dynamic,
  /// API responses
  Api,
}

impl ResourceClass {
  pub const ALL: [ResourceClass; 3] = [Self::Static, Self::Dynamic, Self::Api];

  fn as_str(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
      Self::Api => "api",
    }
  }
}

impl fmt::Display for ResourceClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Cache names of the current version: `{prefix}-{class}-{version}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespaces {
  prefix: String,
  version: String,
}

impl Namespaces {
  pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
      version: version.into(),
    }
  }

  pub fn from_config(config: &CacheConfig) -> Self {
    Self::new(&config.prefix, &config.version)
  }

  pub fn name(&self, class: ResourceClass) -> String {
    format!("{}-{}-{}", self.prefix, class, self.version)
  }

  pub fn current(&self) -> Vec<String> {
    ResourceClass::ALL.iter().map(|c| self.name(*c)).collect()
  }

  /// A cache of this family that belongs to another version.
  pub fn is_obsolete(&self, name: &str) -> bool {
    name.starts_with(&format!("{}-", self.prefix)) && !self.current().iter().any(|c| c == name)
  }
}
