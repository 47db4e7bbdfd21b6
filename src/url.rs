//! Request-target parsing and cache-key normalization.
//!
//! Absolute-form targets (`http://host[:port]/path?query`) address origins
//! through the proxy; authority-form targets (`host:port`) are used only by
//! `CONNECT`. Parsing is done by hand because normalization needs precise
//! control over scheme case, default ports, and fragments.

use derive_more::Display;
use n0_error::e;

use crate::error::ProxyError;

/// A resolved origin endpoint extracted from an absolute-form target.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("{host}:{port}")]
pub struct RemoteTarget {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Origin-form path including any query; never empty.
    pub path: String,
}

impl RemoteTarget {
    /// Whether `port` is the default for `scheme`.
    pub fn is_default_port(&self) -> bool {
        matches!(
            (self.scheme.as_str(), self.port),
            ("http", 80) | ("https", 443)
        )
    }
}

fn default_port(scheme: &str) -> u16 {
    if scheme == "https" { 443 } else { 80 }
}

fn parse_port(s: &str) -> Result<u16, String> {
    s.parse().map_err(|_| format!("invalid port: {s}"))
}

/// Splits an authority into host and port, keeping IPv6 brackets intact.
fn split_host_port(authority: &str, default: u16) -> Result<(&str, u16), String> {
    if let Some(end) = authority.find(']') {
        let host = &authority[..=end];
        match authority[end + 1..].strip_prefix(':') {
            Some(port) => Ok((host, parse_port(port)?)),
            None if authority.len() == end + 1 => Ok((host, default)),
            None => Err(format!("invalid authority: {authority}")),
        }
    } else if let Some((host, port)) = authority.rsplit_once(':') {
        Ok((host, parse_port(port)?))
    } else {
        Ok((authority, default))
    }
}

fn split_after_scheme(scheme: &str, rest: &str) -> Result<RemoteTarget, String> {
    // Fragments are client-side only and never forwarded.
    let rest = rest.split('#').next().unwrap_or_default();
    let (authority, path) = match rest.find(['/', '?']) {
        Some(idx) if rest.as_bytes()[idx] == b'/' => (&rest[..idx], rest[idx..].to_string()),
        Some(idx) => (&rest[..idx], format!("/{}", &rest[idx..])),
        None => (rest, "/".to_string()),
    };
    let authority = authority
        .rsplit_once('@')
        .map(|(_, host)| host)
        .unwrap_or(authority);
    let (host, port) = split_host_port(authority, default_port(scheme))?;
    if host.is_empty() {
        return Err("no host in URL".into());
    }
    Ok(RemoteTarget {
        scheme: scheme.to_string(),
        host: host.to_string(),
        port,
        path,
    })
}

/// Parses an absolute-form request target.
///
/// The `http://` or `https://` prefix is matched case-sensitively; ports
/// default to 80/443 by scheme; an empty path becomes `/`; fragments are
/// stripped.
pub fn parse_absolute_url(target: &str) -> Result<RemoteTarget, ProxyError> {
    let (scheme, rest) = if let Some(rest) = target.strip_prefix("http://") {
        ("http", rest)
    } else if let Some(rest) = target.strip_prefix("https://") {
        ("https", rest)
    } else {
        return Err(e!(ProxyError::BadRequest {
            reason: format!("invalid absolute URL: {target}")
        }));
    };
    split_after_scheme(scheme, rest).map_err(|reason| e!(ProxyError::BadRequest { reason }))
}

/// Parses an authority-form target (`host:port`), as used by `CONNECT`.
///
/// A scheme prefix is rejected, the port is mandatory and numeric, and the
/// host must be non-empty.
pub fn parse_authority_form(target: &str) -> Result<(String, u16), ProxyError> {
    if target.starts_with("http://") || target.starts_with("https://") {
        return Err(e!(ProxyError::BadRequest {
            reason: format!("invalid authority form: {target}")
        }));
    }
    let Some((host, port)) = target.rsplit_once(':') else {
        return Err(e!(ProxyError::BadRequest {
            reason: format!("missing port in CONNECT target: {target}")
        }));
    };
    let port = port.parse::<u16>().map_err(|_| {
        e!(ProxyError::BadRequest {
            reason: format!("invalid port in CONNECT target: {target}")
        })
    })?;
    if host.is_empty() {
        return Err(e!(ProxyError::BadRequest {
            reason: format!("no host in CONNECT target: {target}")
        }));
    }
    Ok((host.to_string(), port))
}

/// Normalizes an absolute URL into a cache key.
///
/// Scheme and host are lowercased, default ports are dropped, an empty path
/// becomes `/`, the query is preserved verbatim, and fragments are dropped.
/// Targets that do not parse are returned unchanged so that every input has
/// a stable key.
pub fn normalize_url(target: &str) -> String {
    let (scheme, rest) = if target.len() >= 7 && target[..7].eq_ignore_ascii_case("http://") {
        ("http", &target[7..])
    } else if target.len() >= 8 && target[..8].eq_ignore_ascii_case("https://") {
        ("https", &target[8..])
    } else {
        return target.to_string();
    };
    match split_after_scheme(scheme, rest) {
        Err(_) => target.to_string(),
        Ok(parsed) => {
            let host = parsed.host.to_ascii_lowercase();
            if parsed.is_default_port() {
                format!("{scheme}://{host}{}", parsed.path)
            } else {
                format!("{scheme}://{host}:{}{}", parsed.port, parsed.path)
            }
        }
    }
}

/// Whether forwarding to `host:port` would loop back to this proxy.
pub fn is_self_loop(host: &str, port: u16, listen_port: u16) -> bool {
    port == listen_port && (host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1")
}
