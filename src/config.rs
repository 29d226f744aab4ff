//! Engine settings.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::value::{FastValueBuilderFactory, SimpleValueBuilderFactory, ValueBuilderFactory};

#[derive(Debug, thiserror::Error)]
#[error("invalid engine config: {0}")]
pub struct ConfigError(#[from] serde_json::Error);

/// Value backend used for intermediate and result values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Hashed sparse index.
    #[default]
    Fast,
    /// Linear address list; slow but easy to check.
    Simple,
}

impl Backend {
    pub fn factory(self) -> Arc<dyn ValueBuilderFactory> {
        match self {
            Backend::Fast => Arc::new(FastValueBuilderFactory),
            Backend::Simple => Arc::new(SimpleValueBuilderFactory),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Run the rewrite passes before compiling.
    pub optimize: bool,
    pub backend: Backend,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig { optimize: true, backend: Backend::Fast }
    }
}

impl EngineConfig {
    /// Parse `{"optimize": false, "backend": "simple"}`; missing keys keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn factory(&self) -> Arc<dyn ValueBuilderFactory> {
        self.backend.factory()
    }
}
