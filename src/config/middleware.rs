use serde::{Deserialize, Serialize};

/// Middleware definitions (`middleware.yaml`).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MiddlewareConfig {
    #[serde(default)]
    pub chain: Vec<MiddlewareDef>,
}

/// One named middleware instance. Kind-specific parameters stay opaque here
/// and are deserialized by the factory for the given kind.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MiddlewareDef {
    pub name: String,
    pub kind: MiddlewareKind,
    pub enabled: bool,
    /// Position in the global chain; must be unique across definitions.
    pub order: i32,
    #[serde(default)]
    pub config: serde_yaml::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MiddlewareKind {
    Logging,
    RateLimit,
    Auth,
    Compression,
}

impl MiddlewareDef {
    /// Kind-specific parameters, with an omitted `config` block reading as
    /// an empty mapping rather than YAML null.
    pub fn params_value(&self) -> serde_yaml::Value {
        match &self.config {
            serde_yaml::Value::Null => serde_yaml::Value::Mapping(Default::default()),
            value => value.clone(),
        }
    }
}

impl MiddlewareKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MiddlewareKind::Logging => "logging",
            MiddlewareKind::RateLimit => "rate_limit",
            MiddlewareKind::Auth => "auth",
            MiddlewareKind::Compression => "compression",
        }
    }
}
