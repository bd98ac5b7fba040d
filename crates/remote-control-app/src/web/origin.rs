//! Browser origin policy for the upgrade endpoint.
//!
//! Accepts requests whose Origin is absent, matches the request host, or is
//! loopback. This works unchanged for a local bind and for a public tunnel
//! hostname, because the comparison is against whatever Host the request
//! arrived with.

use url::Url;

/// Decide whether an Origin header is acceptable for the given Host.
pub fn is_origin_allowed(origin: &str, host: &str) -> bool {
    let origin = origin.trim();
    if origin.is_empty() {
        return true;
    }
    let origin_host = match Url::parse(origin) {
        Ok(url) => match url.host_str() {
            Some(h) => h.trim_matches(|c| c == '[' || c == ']').to_lowercase(),
            None => return false,
        },
        Err(_) => return false,
    };
    if origin_host.is_empty() {
        return false;
    }
    let request_host = parse_hostname(host).to_lowercase();
    if !request_host.is_empty() && origin_host == request_host {
        return true;
    }
    origin_host == "localhost" || origin_host == "127.0.0.1" || origin_host == "::1"
}

/// Hostname of a Host header value, with any port stripped.
pub fn parse_hostname(host: &str) -> String {
    let host = host.trim();
    if host.is_empty() {
        return String::new();
    }
    match Url::parse(&format!("http://{host}")) {
        Ok(url) => url
            .host_str()
            .map(|h| h.trim_matches(|c| c == '[' || c == ']').to_string())
            .unwrap_or_else(|| host.to_string()),
        Err(_) => host.to_string(),
    }
}
