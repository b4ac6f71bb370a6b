//! Header rules for traffic crossing the tunnel
//!
//! Connection-scoped headers describe the hop they arrived on, not the
//! message, so they are dropped at both ends of the tunnel. Framing headers
//! are recomputed by whichever HTTP stack emits the message next.

use bt_protocol::Headers;

/// Headers that never cross the tunnel
const STRIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Whether a header is connection-scoped and must be dropped
pub fn is_hop_by_hop(name: &str) -> bool {
    STRIPPED_HEADERS
        .iter()
        .any(|stripped| stripped.eq_ignore_ascii_case(name))
}

/// Keep only the end-to-end headers, preserving order and repeats
pub fn end_to_end<I, K, V>(headers: I) -> Headers
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    headers
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .filter(|(k, _)| !is_hop_by_hop(k))
        .collect()
}
