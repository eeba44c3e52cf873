use ipnetwork::Ipv6Network;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::OnceLock;

/// Outcome of SSRF validation. Rejections are never failover-eligible —
/// they surface as 400 before any attempt is recorded.
#[derive(Debug, thiserror::Error)]
pub enum SsrfError {
    #[error("unsupported scheme: {0}")]
    Scheme(String),

    #[error("url has no host")]
    MissingHost,

    #[error("invalid url: {0}")]
    Invalid(String),

    #[error("blocked host: {0}")]
    BlockedHost(String),

    #[error("blocked address: {0}")]
    BlockedAddress(IpAddr),

    #[error("hostname did not resolve: {0}")]
    Resolve(String),
}

/// Syntactic check only — scheme and host presence. Used when control-plane
/// snapshots are ingested; address-range checks run per outbound attempt.
pub fn validate_base_url_syntax(url: &str) -> Result<(), SsrfError> {
    let uri: http::Uri = url.parse().map_err(|e| SsrfError::Invalid(format!("{e}")))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        Some(other) => return Err(SsrfError::Scheme(other.to_string())),
        None => return Err(SsrfError::Scheme("none".to_string())),
    }
    if uri.host().map(|h| h.is_empty()).unwrap_or(true) {
        return Err(SsrfError::MissingHost);
    }
    Ok(())
}

/// Address-range policy applied to every outbound attempt.
///
/// `allow_private_networks` relaxes loopback/private classes for development
/// and integration tests. Link-local (incl. the cloud metadata endpoint),
/// multicast, unspecified, and IPv4-mapped/compatible IPv6 stay blocked
/// unconditionally.
#[derive(Debug, Clone, Copy)]
pub struct SsrfPolicy {
    pub allow_private_networks: bool,
}

fn ula_net() -> &'static Ipv6Network {
    static NET: OnceLock<Ipv6Network> = OnceLock::new();
    NET.get_or_init(|| "fc00::/7".parse().expect("ula network"))
}

fn v6_link_local_net() -> &'static Ipv6Network {
    static NET: OnceLock<Ipv6Network> = OnceLock::new();
    NET.get_or_init(|| "fe80::/10".parse().expect("v6 link-local network"))
}

impl SsrfPolicy {
    pub fn new(allow_private_networks: bool) -> Self {
        Self {
            allow_private_networks,
        }
    }

    /// Full validation of an outbound URI: scheme, host class, and — for
    /// hostnames — a fresh DNS resolution where *every* returned address
    /// must pass. Resolution is redone for each attempt; cached results are
    /// not trusted across the selection/dispatch boundary.
    pub async fn validate_uri(&self, uri: &http::Uri) -> Result<(), SsrfError> {
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            Some(other) => return Err(SsrfError::Scheme(other.to_string())),
            None => return Err(SsrfError::Scheme("none".to_string())),
        }

        let host = uri.host().ok_or(SsrfError::MissingHost)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        if host.eq_ignore_ascii_case("localhost") {
            if self.allow_private_networks {
                return Ok(());
            }
            return Err(SsrfError::BlockedHost("localhost".to_string()));
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.check_ip(ip);
        }

        let port = uri
            .port_u16()
            .unwrap_or(if uri.scheme_str() == Some("https") { 443 } else { 80 });

        let addrs: Vec<std::net::SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| SsrfError::Resolve(format!("{host}: {e}")))?
            .collect();

        if addrs.is_empty() {
            return Err(SsrfError::Resolve(format!("{host}: no addresses")));
        }
        for addr in addrs {
            self.check_ip(addr.ip())?;
        }
        Ok(())
    }

    pub fn check_ip(&self, ip: IpAddr) -> Result<(), SsrfError> {
        match ip {
            IpAddr::V4(v4) => {
                if v4.is_unspecified() || v4.is_link_local() || v4.is_multicast() {
                    return Err(SsrfError::BlockedAddress(ip));
                }
                if (v4.is_loopback() || v4.is_private()) && !self.allow_private_networks {
                    return Err(SsrfError::BlockedAddress(ip));
                }
                Ok(())
            }
            IpAddr::V6(v6) => {
                // IPv4 smuggled through mapped/compatible forms is rejected
                // outright rather than unwrapped.
                if is_v4_in_v6(&v6) {
                    return Err(SsrfError::BlockedAddress(ip));
                }
                if v6.is_unspecified()
                    || v6.is_multicast()
                    || v6_link_local_net().contains(v6)
                {
                    return Err(SsrfError::BlockedAddress(ip));
                }
                if (v6.is_loopback() || ula_net().contains(v6)) && !self.allow_private_networks {
                    return Err(SsrfError::BlockedAddress(ip));
                }
                Ok(())
            }
        }
    }
}

/// IPv4-mapped (`::ffff:a.b.c.d`) or IPv4-compatible (`::a.b.c.d`) forms.
fn is_v4_in_v6(v6: &Ipv6Addr) -> bool {
    let seg = v6.segments();
    if seg[..5] == [0, 0, 0, 0, 0] && seg[5] == 0xffff {
        return true;
    }
    // Compatible form: high 96 bits zero, but not :: or ::1 themselves.
    seg[..6] == [0, 0, 0, 0, 0, 0] && (seg[6] != 0 || seg[7] > 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict() -> SsrfPolicy {
        SsrfPolicy::new(false)
    }

    fn relaxed() -> SsrfPolicy {
        SsrfPolicy::new(true)
    }

    #[test]
    fn test_syntax_rejects_non_http() {
        assert!(validate_base_url_syntax("https://api.example.com/v1").is_ok());
        assert!(validate_base_url_syntax("ftp://api.example.com").is_err());
        assert!(validate_base_url_syntax("not a url").is_err());
    }

    #[test]
    fn test_blocked_v4_ranges() {
        let p = strict();
        for ip in ["127.0.0.1", "10.1.2.3", "172.16.0.1", "192.168.1.1"] {
            assert!(p.check_ip(ip.parse().unwrap()).is_err(), "{ip}");
        }
        // always blocked, even relaxed
        let r = relaxed();
        for ip in ["169.254.169.254", "224.0.0.1", "0.0.0.0"] {
            assert!(r.check_ip(ip.parse().unwrap()).is_err(), "{ip}");
        }
    }

    #[test]
    fn test_blocked_v6_ranges() {
        let p = strict();
        for ip in ["::1", "fc00::1", "fd12::1"] {
            assert!(p.check_ip(ip.parse().unwrap()).is_err(), "{ip}");
        }
        let r = relaxed();
        for ip in ["fe80::1", "ff02::1", "::", "::ffff:169.254.169.254", "::ffff:8.8.8.8"] {
            assert!(r.check_ip(ip.parse().unwrap()).is_err(), "{ip}");
        }
    }

    #[test]
    fn test_public_addresses_pass() {
        let p = strict();
        assert!(p.check_ip("8.8.8.8".parse().unwrap()).is_ok());
        assert!(p.check_ip("2001:4860:4860::8888".parse().unwrap()).is_ok());
    }

    #[test]
    fn test_relaxed_permits_private() {
        let p = relaxed();
        assert!(p.check_ip("127.0.0.1".parse().unwrap()).is_ok());
        assert!(p.check_ip("10.0.0.5".parse().unwrap()).is_ok());
        assert!(p.check_ip("::1".parse().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_uri_ip_literal() {
        let p = strict();
        let uri: http::Uri = "http://169.254.169.254/latest/meta-data".parse().unwrap();
        assert!(p.validate_uri(&uri).await.is_err());

        let uri: http::Uri = "http://127.0.0.1:8080/v1".parse().unwrap();
        assert!(p.validate_uri(&uri).await.is_err());
        assert!(relaxed().validate_uri(&uri).await.is_ok());
    }

    #[tokio::test]
    async fn test_localhost_name() {
        let uri: http::Uri = "http://localhost:9000/v1".parse().unwrap();
        assert!(strict().validate_uri(&uri).await.is_err());
        assert!(relaxed().validate_uri(&uri).await.is_ok());
    }
}
