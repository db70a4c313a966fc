use eyre::Result;

/// Normalize a listen address to a bare host.
///
/// Accepts:
/// - `host`
/// - `tcp://host`
///
/// Rejects other schemes (e.g. `http://`).
pub fn normalize_tcp_host(address: &str) -> Result<String> {
    let address = address.trim();
    let host = address.strip_prefix("tcp://").unwrap_or(address);
    if host.contains("://") {
        eyre::bail!(
            "unsupported address scheme (expected tcp:// or a bare host): {}",
            address
        );
    }
    if host.is_empty() {
        eyre::bail!("empty listen address");
    }
    Ok(host.to_string())
}

/// Join a host and port into something `TcpListener::bind` accepts,
/// bracketing IPv6 literals.
pub fn tcp_endpoint(host: &str, port: u16) -> String {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.parse::<std::net::Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Best-effort check for whether a host is loopback-local.
///
/// This intentionally does not do DNS resolution. Hostnames other than
/// `localhost` are treated as non-loopback.
pub fn is_loopback_host(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.parse::<std::net::IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}
