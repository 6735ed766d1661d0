//! Security gate for outbound requests and local command execution.
//!
//! Two decisions live here:
//!
//! - **SSRF**: REST endpoints must be `http`/`https` and must not point at the
//!   host itself, a private network, a link-local range (which includes cloud
//!   metadata services such as `169.254.169.254`), or an unspecified address.
//!   Hostnames are resolved once, at validation time, and rejected if *any*
//!   resolved address is internal.
//! - **Exec gate**: `exec` sources are refused unless the runtime explicitly
//!   allows local command execution.
//!
//! ## Known gap: DNS rebinding
//!
//! Validation resolves the hostname once and then trusts it. A name served
//! with a zero TTL can resolve to a public address here and to an internal one
//! when the HTTP client connects. The connection itself is not re-validated.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

use thiserror::Error;
use url::{Host, Url};

use crate::error::{Result, SourceError};

/// Process-level security switches.
///
/// Both flags default to off. Neither is reachable from a source declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityPolicy {
    /// Permit `exec` sources to be constructed.
    pub allow_exec: bool,
    /// Skip SSRF validation entirely. Automated tests only.
    pub bypass_ssrf: bool,
}

/// Why a URL was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlRejection {
    /// The URL could not be parsed.
    #[error("invalid URL: {0}")]
    Invalid(String),

    /// Scheme other than http/https.
    #[error("URL scheme must be http or https, got {0:?}")]
    Scheme(String),

    /// No host component.
    #[error("URL must have a host")]
    MissingHost,

    /// `localhost` or one of its spellings.
    #[error("requests to localhost are not allowed")]
    Localhost,

    /// An internal address, given literally or via resolution.
    #[error("requests to {class} addresses are not allowed ({addr})")]
    Internal {
        /// Address class (loopback, private, link-local, unspecified).
        class: &'static str,
        /// The offending address.
        addr: IpAddr,
    },

    /// A hostname that resolves to an internal address.
    #[error("hostname {host:?} resolves to a blocked address: {reason}")]
    Resolved {
        /// The hostname as written.
        host: String,
        /// The rejection of the resolved address.
        reason: Box<UrlRejection>,
    },
}

/// Validate an outbound URL and return it parsed.
///
/// With `policy.bypass_ssrf` set, only parsing is performed.
pub fn validate_http_url(raw: &str, policy: &SecurityPolicy) -> std::result::Result<Url, UrlRejection> {
    let url = Url::parse(raw).map_err(|e| UrlRejection::Invalid(e.to_string()))?;
    if policy.bypass_ssrf {
        return Ok(url);
    }

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(UrlRejection::Scheme(other.to_string())),
    }

    match url.host() {
        None => return Err(UrlRejection::MissingHost),
        Some(Host::Ipv4(ip)) => check_ip(IpAddr::V4(ip))?,
        Some(Host::Ipv6(ip)) => check_ip(IpAddr::V6(ip))?,
        Some(Host::Domain(domain)) => {
            check_domain(domain, url.port_or_known_default().unwrap_or(80))?
        }
    }
    Ok(url)
}

/// Refuse to build an exec source unless the policy allows it.
pub fn ensure_exec_allowed(source_name: &str, policy: &SecurityPolicy) -> Result<()> {
    if policy.allow_exec {
        return Ok(());
    }
    Err(SourceError::security(
        source_name,
        "exec sources are disabled; enable local command execution to use them",
    ))
}

fn check_domain(domain: &str, port: u16) -> std::result::Result<(), UrlRejection> {
    let lower = domain.trim_end_matches('.').to_ascii_lowercase();
    if lower == "localhost" || lower == "localhost.localdomain" || lower.ends_with(".localhost") {
        return Err(UrlRejection::Localhost);
    }

    // Unresolvable names are let through; the request itself will fail.
    let Ok(addrs) = (lower.as_str(), port).to_socket_addrs() else {
        tracing::debug!(host = %lower, "hostname did not resolve during validation");
        return Ok(());
    };

    for addr in addrs {
        if let Err(reason) = check_ip(addr.ip()) {
            return Err(UrlRejection::Resolved {
                host: domain.to_string(),
                reason: Box::new(reason),
            });
        }
    }
    Ok(())
}

/// Check a single address against the blocked ranges.
pub fn check_ip(addr: IpAddr) -> std::result::Result<(), UrlRejection> {
    let class = match addr {
        IpAddr::V4(ip) => classify_v4(ip),
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => classify_v4(v4),
            None => classify_v6(ip),
        },
    };
    match class {
        Some(class) => Err(UrlRejection::Internal { class, addr }),
        None => Ok(()),
    }
}

fn classify_v4(ip: Ipv4Addr) -> Option<&'static str> {
    if ip.is_loopback() {
        Some("loopback")
    } else if ip.is_private() {
        Some("private network")
    } else if ip.is_link_local() || is_link_local_multicast_v4(ip) {
        Some("link-local")
    } else if ip.is_unspecified() {
        Some("unspecified")
    } else {
        None
    }
}

fn classify_v6(ip: Ipv6Addr) -> Option<&'static str> {
    let first = ip.segments()[0];
    if ip.is_loopback() {
        Some("loopback")
    } else if first & 0xfe00 == 0xfc00 {
        Some("private network")
    } else if first & 0xffc0 == 0xfe80 || first == 0xff02 {
        Some("link-local")
    } else if ip.is_unspecified() {
        Some("unspecified")
    } else {
        None
    }
}

fn is_link_local_multicast_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    a == 224 && b == 0 && c == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict() -> SecurityPolicy {
        SecurityPolicy::default()
    }

    #[test]
    fn test_rejects_non_http_schemes() {
        assert!(matches!(
            validate_http_url("file:///etc/passwd", &strict()),
            Err(UrlRejection::Scheme(s)) if s == "file"
        ));
        assert!(matches!(
            validate_http_url("ftp://example.com/", &strict()),
            Err(UrlRejection::Scheme(_))
        ));
    }

    #[test]
    fn test_rejects_localhost_spellings() {
        for url in [
            "http://localhost/",
            "http://LOCALHOST:8080/x",
            "http://localhost.localdomain/",
            "http://app.localhost/",
        ] {
            assert_eq!(validate_http_url(url, &strict()), Err(UrlRejection::Localhost), "{url}");
        }
    }

    #[test]
    fn test_rejects_internal_literals() {
        for url in [
            "http://127.0.0.1/",
            "http://10.0.0.1/",
            "http://192.168.1.1/",
            "http://172.16.0.1/",
            "http://169.254.169.254/latest/meta-data",
            "http://0.0.0.0/",
            "http://[::1]/",
            "http://[fe80::1]/",
            "http://[fd00::1]/",
            "http://[::ffff:127.0.0.1]/",
        ] {
            assert!(
                matches!(validate_http_url(url, &strict()), Err(UrlRejection::Internal { .. })),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn test_accepts_public_literal() {
        assert!(validate_http_url("https://93.184.216.34/", &strict()).is_ok());
    }

    #[test]
    fn test_bypass_skips_checks() {
        let policy = SecurityPolicy {
            bypass_ssrf: true,
            ..Default::default()
        };
        assert!(validate_http_url("http://127.0.0.1:9999/", &policy).is_ok());
        assert!(validate_http_url("not a url", &policy).is_err());
    }

    #[test]
    fn test_exec_gate() {
        let err = ensure_exec_allowed("tasks", &strict()).unwrap_err();
        assert!(err.is_security());

        let policy = SecurityPolicy {
            allow_exec: true,
            ..Default::default()
        };
        assert!(ensure_exec_allowed("tasks", &policy).is_ok());
    }
}
