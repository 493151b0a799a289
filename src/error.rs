use hyper::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the gatehouse proxy
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Configuration could not be read or parsed
    #[error("Config load error: {message}")]
    ConfigLoad { message: String },

    /// Configuration loaded but failed validation
    #[error("Config validation error: {message}")]
    ConfigValidation { message: String },

    /// No route rule matched the request
    #[error("No matching route for {host}{path}")]
    NoMatchingRoute { host: String, path: String },

    /// A route referenced an upstream that does not exist in the snapshot
    #[error("Unknown upstream: {name}")]
    UpstreamUnknown { name: String },

    /// Every target in the selected pool is unhealthy
    #[error("No healthy target in upstream {upstream}")]
    NoHealthyTarget { upstream: String },

    /// The backend could not be reached or broke the connection
    #[error("Backend transport error for {target}: {message}")]
    BackendTransport { target: String, message: String },

    /// Request-level deadline exceeded
    #[error("Operation timed out after {duration:?}: {operation}")]
    Timeout {
        duration: Duration,
        operation: String,
    },

    /// Authentication failed
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// Authenticated but not permitted
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    /// Rate limit exceeded for a key
    #[error("Rate limit exceeded for key {key}")]
    RateLimited { key: String },

    /// A rewrite rule could not be applied at request time
    #[error("Invalid rewrite: {message}")]
    InvalidRewrite { message: String },

    /// TLS setup or certificate errors
    #[error("TLS error: {message}")]
    Tls { message: String },

    /// Filesystem errors (config watching, certificate files)
    #[error("IO error: {message}")]
    Io { message: String },

    /// Catch-all for internal invariant breaks
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn config_load<S: Into<String>>(message: S) -> Self {
        Self::ConfigLoad {
            message: message.into(),
        }
    }

    pub fn config_validation<S: Into<String>>(message: S) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    pub fn no_healthy_target<S: Into<String>>(upstream: S) -> Self {
        Self::NoHealthyTarget {
            upstream: upstream.into(),
        }
    }

    pub fn transport<S: Into<String>, T: Into<String>>(target: T, message: S) -> Self {
        Self::BackendTransport {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(duration: Duration, operation: S) -> Self {
        Self::Timeout {
            duration,
            operation: operation.into(),
        }
    }

    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    pub fn invalid_rewrite<S: Into<String>>(message: S) -> Self {
        Self::InvalidRewrite {
            message: message.into(),
        }
    }

    pub fn tls<S: Into<String>>(message: S) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status a request-scoped error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NoMatchingRoute { .. } => StatusCode::NOT_FOUND,
            GatewayError::UpstreamUnknown { .. } | GatewayError::NoHealthyTarget { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::BackendTransport { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden { .. } => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable identifier used in log fields so operators can filter on it.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::ConfigLoad { .. } => "config_load",
            GatewayError::ConfigValidation { .. } => "config_validation",
            GatewayError::NoMatchingRoute { .. } => "no_matching_route",
            GatewayError::UpstreamUnknown { .. } => "upstream_unknown",
            GatewayError::NoHealthyTarget { .. } => "no_healthy_target",
            GatewayError::BackendTransport { .. } => "backend_transport",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::Unauthorized { .. } => "unauthorized",
            GatewayError::Forbidden { .. } => "forbidden",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::InvalidRewrite { .. } => "invalid_rewrite",
            GatewayError::Tls { .. } => "tls",
            GatewayError::Io { .. } => "io",
            GatewayError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for gatehouse operations
pub type GatewayResult<T> = Result<T, GatewayError>;

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::io(err.to_string())
    }
}

impl From<hyper::Error> for GatewayError {
    fn from(err: hyper::Error) -> Self {
        if err.is_timeout() {
            GatewayError::timeout(Duration::from_secs(30), "HTTP request")
        } else {
            GatewayError::transport("upstream", err.to_string())
        }
    }
}

impl From<hyper::http::Error> for GatewayError {
    fn from(err: hyper::http::Error) -> Self {
        GatewayError::internal(format!("HTTP error: {}", err))
    }
}

impl From<hyper::http::uri::InvalidUri> for GatewayError {
    fn from(err: hyper::http::uri::InvalidUri) -> Self {
        GatewayError::config_validation(format!("Invalid URI: {}", err))
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::config_load(format!("YAML parsing error: {}", err))
    }
}

impl From<notify::Error> for GatewayError {
    fn from(err: notify::Error) -> Self {
        GatewayError::io(format!("File watching error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        GatewayError::timeout(Duration::from_secs(30), "operation")
    }
}
