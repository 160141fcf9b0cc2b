//! Small helpers shared across transports.

pub(crate) fn u16_from_be_slice(s: &[u8]) -> u16 {
    u16::from_be_bytes([s[0], s[1]])
}

/// Split a `host:port` remote address. IPv6 literals are expected in brackets
/// (`[::1]:443`). Returns `None` when the port part is missing or not a valid
/// non-zero port.
pub(crate) fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if port == 0 {
        return None;
    }
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
