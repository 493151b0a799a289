use regex::Regex;

use crate::config::RewriteConfig;
use crate::error::{GatewayError, GatewayResult};

/// A rule's rewrite pipeline, with the regex compiled once at build time.
///
/// Rewrites apply to the path only; query string and fragment pass through
/// untouched. Order: strip_prefix, then add_prefix, then regex replacement.
pub struct Rewriter {
    config: RewriteConfig,
    // Validation rejects non-compiling patterns before a snapshot goes
    // live; the Err side covers the window where one slips through.
    regex: Option<Result<Regex, String>>,
}

impl Rewriter {
    pub fn compile(config: &RewriteConfig) -> Self {
        let regex = config
            .regex
            .as_ref()
            .map(|pattern| Regex::new(pattern).map_err(|e| e.to_string()));
        Self {
            config: config.clone(),
            regex,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.config.is_empty()
    }

    pub fn apply(&self, path: &str) -> GatewayResult<String> {
        let mut path = path.to_string();

        if let Some(prefix) = &self.config.strip_prefix {
            if let Some(rest) = path.strip_prefix(prefix.as_str()) {
                path = if rest.is_empty() {
                    "/".to_string()
                } else {
                    rest.to_string()
                };
            }
        }

        if let Some(prefix) = &self.config.add_prefix {
            if !path.starts_with('/') {
                path.insert(0, '/');
            }
            path = format!("{}{}", prefix, path);
        }

        if let (Some(compiled), Some(replacement)) = (&self.regex, &self.config.replacement) {
            let regex = compiled
                .as_ref()
                .map_err(|e| GatewayError::invalid_rewrite(format!("regex: {}", e)))?;
            path = regex.replace_all(&path, replacement.as_str()).into_owned();
        }

        Ok(path)
    }
}
