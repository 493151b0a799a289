//! Request routing: first-match rule evaluation and URL rewriting.

pub mod rewrite;
pub mod router;

pub use rewrite::Rewriter;
pub use router::{CompiledRoute, Router};

/// Strip any `:port` suffix from a Host header value.
pub fn strip_host_port(host: &str) -> &str {
    match host.rfind(':') {
        // Bracketed IPv6 hosts keep everything inside the brackets
        Some(idx) if !host[idx..].contains(']') => &host[..idx],
        _ => host,
    }
}
