use std::sync::OnceLock;

use regex::Regex;

use crate::error::ConnectionFailureKind;
use crate::mcp::transport::TransportConfig;

const RESOURCE_IN_USE_MARKERS: &[&str] = &[
    "address already in use",
    "eaddrinuse",
    "connection refused",
    "cannot bind",
    "failed to listen",
];

fn address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)((?:\d{1,3}\.){3}\d{1,3}|localhost|\[[0-9a-f:]*\]|::):(\d{2,5})")
            .unwrap_or_else(|e| panic!("invalid address pattern: {e}"))
    })
}

fn port_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bport\s*:?\s*(\d{2,5})\b").unwrap_or_else(|e| panic!("invalid port pattern: {e}"))
    })
}

/// Sorts a connect/IO failure into resource-in-use or generic.
pub fn classify_connection_error(message: &str, transport: Option<&TransportConfig>) -> ConnectionFailureKind {
    let lowered = message.to_lowercase();
    if !RESOURCE_IN_USE_MARKERS.iter().any(|m| lowered.contains(m)) {
        return ConnectionFailureKind::Generic;
    }
    let resource = resource_from_message(message).or_else(|| transport.and_then(resource_from_transport));
    ConnectionFailureKind::ResourceInUse { resource }
}

fn resource_from_message(message: &str) -> Option<String> {
    if let Some(c) = address_re().captures(message) {
        return Some(format!("{}:{}", &c[1], &c[2]));
    }
    port_re().captures(message).map(|c| format!("port {}", &c[1]))
}

fn resource_from_transport(transport: &TransportConfig) -> Option<String> {
    match transport {
        TransportConfig::Stdio { args, .. } => port_from_args(args).map(|p| format!("port {p}")),
        TransportConfig::Sse { url } => {
            let parsed = url::Url::parse(url).ok()?;
            let host = parsed.host_str()?;
            let port = parsed.port_or_known_default()?;
            Some(format!("{host}:{port}"))
        }
    }
}

fn port_from_args(args: &[String]) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(v) = arg.strip_prefix("--port=") {
            return Some(v.to_string());
        }
        if arg == "--port" || arg == "-p" {
            return iter.next().cloned();
        }
    }
    None
}

/// Human-readable explanation for a failed connect.
pub fn describe_failure(kind: &ConnectionFailureKind, detail: &str) -> String {
    match kind {
        ConnectionFailureKind::ResourceInUse { resource: Some(r) } => format!(
            "{r} is already in use by another process. Stop that process or configure the tool provider to use a different port. ({detail})"
        ),
        ConnectionFailureKind::ResourceInUse { resource: None } => format!(
            "The tool provider's address or port is already in use by another process. ({detail})"
        ),
        ConnectionFailureKind::Generic => format!("Failed to connect to the tool provider: {detail}"),
    }
}
