//! Full configuration validation, run at load time and again before every
//! snapshot publish. A configuration that fails here never becomes live.

use std::collections::HashSet;
use url::Url;

use super::{Config, MiddlewareDef, MiddlewareKind, TlsConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::middleware::{
    auth::AuthParams, compression::CompressionParams, logging::LoggingParams,
    rate_limit::RateLimitParams,
};

const VALID_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];
const VALID_LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error"];
const VALID_LOG_FORMATS: &[&str] = &["json", "text"];

pub fn validate(config: &Config) -> GatewayResult<()> {
    validate_global(config)?;
    validate_upstreams(config)?;
    validate_routes(config)?;
    validate_middleware(&config.middleware.chain)?;
    validate_tls(&config.tls)?;
    Ok(())
}

fn err<S: Into<String>>(message: S) -> GatewayError {
    GatewayError::config_validation(message)
}

fn validate_global(config: &Config) -> GatewayResult<()> {
    let server = &config.global.server;
    if server.http_port == 0 {
        return Err(err("invalid HTTP port: 0"));
    }
    if server.https_port == 0 {
        return Err(err("invalid HTTPS port: 0"));
    }
    if server.http_port == server.https_port {
        return Err(err("HTTP and HTTPS ports cannot be the same"));
    }
    if server.max_header_size < 1024 {
        return Err(err(format!(
            "max header size must be at least 1024 bytes, got {}",
            server.max_header_size
        )));
    }

    let log = &config.global.log;
    if !VALID_LOG_LEVELS.contains(&log.level.as_str()) {
        return Err(err(format!(
            "invalid log level '{}', must be one of: {}",
            log.level,
            VALID_LOG_LEVELS.join(", ")
        )));
    }
    if !VALID_LOG_FORMATS.contains(&log.format.as_str()) {
        return Err(err(format!(
            "invalid log format '{}', must be one of: {}",
            log.format,
            VALID_LOG_FORMATS.join(", ")
        )));
    }
    Ok(())
}

fn validate_upstreams(config: &Config) -> GatewayResult<()> {
    if config.upstreams.services.is_empty() {
        return Err(err("at least one upstream service must be defined"));
    }

    for (name, service) in &config.upstreams.services {
        if name.is_empty() {
            return Err(err("upstream service name cannot be empty"));
        }
        if service.targets.is_empty() {
            return Err(err(format!("upstream '{}' has no targets", name)));
        }
        for target in &service.targets {
            let parsed = Url::parse(&target.url).map_err(|e| {
                err(format!(
                    "upstream '{}' target '{}': invalid URL: {}",
                    name, target.url, e
                ))
            })?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(err(format!(
                    "upstream '{}' target '{}': scheme must be http or https",
                    name, target.url
                )));
            }
            if parsed.host_str().unwrap_or("").is_empty() {
                return Err(err(format!(
                    "upstream '{}' target '{}': URL must have a host",
                    name, target.url
                )));
            }
        }

        let hc = &service.health_check;
        if hc.enabled {
            if !hc.path.starts_with('/') {
                return Err(err(format!(
                    "upstream '{}': health check path must start with '/'",
                    name
                )));
            }
            if hc.interval.is_zero() {
                return Err(err(format!(
                    "upstream '{}': health check interval must be positive",
                    name
                )));
            }
            if hc.timeout.is_zero() {
                return Err(err(format!(
                    "upstream '{}': health check timeout must be positive",
                    name
                )));
            }
            if hc.failure_threshold < 1 || hc.success_threshold < 1 {
                return Err(err(format!(
                    "upstream '{}': health check thresholds must be at least 1",
                    name
                )));
            }
        }
    }
    Ok(())
}

fn validate_routes(config: &Config) -> GatewayResult<()> {
    if config.routes.rules.is_empty() {
        return Err(err("at least one route rule must be defined"));
    }

    let middleware_names: HashSet<&str> = config
        .middleware
        .chain
        .iter()
        .map(|m| m.name.as_str())
        .collect();

    for (i, rule) in config.routes.rules.iter().enumerate() {
        if rule.host.is_empty() {
            return Err(err(format!("route {}: host cannot be empty", i)));
        }
        if rule.path.is_empty() {
            return Err(err(format!("route {}: path cannot be empty", i)));
        }
        if !rule.path.starts_with('/') {
            return Err(err(format!("route {}: path must start with '/'", i)));
        }
        if !config.upstreams.services.contains_key(&rule.upstream) {
            return Err(err(format!(
                "route {}: unknown upstream '{}'",
                i, rule.upstream
            )));
        }
        for method in &rule.methods {
            if !VALID_METHODS.contains(&method.as_str()) {
                return Err(err(format!("route {}: invalid method '{}'", i, method)));
            }
        }

        let rewrite = &rule.rewrite;
        if let Some(prefix) = &rewrite.strip_prefix {
            if !prefix.starts_with('/') {
                return Err(err(format!(
                    "route {}: strip_prefix must start with '/'",
                    i
                )));
            }
        }
        if let Some(prefix) = &rewrite.add_prefix {
            if !prefix.starts_with('/') {
                return Err(err(format!("route {}: add_prefix must start with '/'", i)));
            }
        }
        match (&rewrite.regex, &rewrite.replacement) {
            (Some(pattern), Some(_)) => {
                regex::Regex::new(pattern).map_err(|e| {
                    err(format!("route {}: rewrite regex does not compile: {}", i, e))
                })?;
            }
            (Some(_), None) => {
                return Err(err(format!(
                    "route {}: rewrite replacement required when regex is set",
                    i
                )));
            }
            _ => {}
        }

        for name in &rule.middleware {
            if !middleware_names.contains(name.as_str()) {
                return Err(err(format!(
                    "route {}: unknown middleware '{}'",
                    i, name
                )));
            }
        }
    }
    Ok(())
}

fn validate_middleware(chain: &[MiddlewareDef]) -> GatewayResult<()> {
    let mut names = HashSet::new();
    let mut orders = HashSet::new();

    for def in chain {
        if def.name.is_empty() {
            return Err(err("middleware name cannot be empty"));
        }
        if !names.insert(def.name.as_str()) {
            return Err(err(format!("duplicate middleware name '{}'", def.name)));
        }
        if !orders.insert(def.order) {
            return Err(err(format!(
                "middleware '{}': duplicate order {}",
                def.name, def.order
            )));
        }
        validate_middleware_params(def)?;
    }
    Ok(())
}

fn validate_middleware_params(def: &MiddlewareDef) -> GatewayResult<()> {
    let context = |e: serde_yaml::Error| {
        err(format!(
            "middleware '{}' ({}): invalid config: {}",
            def.name,
            def.kind.as_str(),
            e
        ))
    };

    match def.kind {
        MiddlewareKind::Logging => {
            serde_yaml::from_value::<LoggingParams>(def.params_value()).map_err(context)?;
        }
        MiddlewareKind::RateLimit => {
            let params =
                serde_yaml::from_value::<RateLimitParams>(def.params_value()).map_err(context)?;
            params
                .validate()
                .map_err(|e| err(format!("middleware '{}': {}", def.name, e)))?;
        }
        MiddlewareKind::Auth => {
            let params =
                serde_yaml::from_value::<AuthParams>(def.params_value()).map_err(context)?;
            params
                .validate()
                .map_err(|e| err(format!("middleware '{}': {}", def.name, e)))?;
        }
        MiddlewareKind::Compression => {
            let params = serde_yaml::from_value::<CompressionParams>(def.params_value())
                .map_err(context)?;
            params
                .validate()
                .map_err(|e| err(format!("middleware '{}': {}", def.name, e)))?;
        }
    }
    Ok(())
}

fn validate_tls(tls: &TlsConfig) -> GatewayResult<()> {
    if !tls.enabled {
        return Ok(());
    }

    if tls.acme.enabled {
        if tls.acme.email.is_empty() {
            return Err(err("ACME enabled but no account email configured"));
        }
        if tls.acme.hosts.is_empty() {
            return Err(err("ACME enabled but no hosts configured"));
        }
    }

    for (i, entry) in tls.certificates.iter().enumerate() {
        if entry.hosts.is_empty() {
            return Err(err(format!("certificate {}: hosts cannot be empty", i)));
        }
        if entry.cert_file.is_empty() || entry.key_file.is_empty() {
            return Err(err(format!(
                "certificate {}: cert_file and key_file are required",
                i
            )));
        }
        if entry.auto_generate && !entry.self_signed {
            return Err(err(format!(
                "certificate {}: auto_generate requires self_signed",
                i
            )));
        }
    }
    Ok(())
}
