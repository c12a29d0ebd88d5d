//! Negotiated-extension inspection (RFC 6455 Section 9).
//!
//! The upgrade handshake is external; the core only inspects the
//! `Sec-WebSocket-Extensions` value it was handed. The one extension it
//! recognizes is `permessage-deflate`, and recognizing it records a flag:
//! RFC 7692 DEFLATE framing is not implemented, the flag exists so a host
//! can tell whether the peer asked for it.

/// Name of the per-message compression extension (RFC 7692).
pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// One extension entry from a `Sec-WebSocket-Extensions` value.
///
/// Format: `extension-name; param1=value1; param2`, entries separated by
/// commas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    /// Extension name, e.g. `permessage-deflate`.
    pub name: String,
    /// Raw parameter strings after the name, trimmed.
    pub params: Vec<String>,
}

impl ExtensionOffer {
    fn parse(entry: &str) -> Option<Self> {
        let mut parts = entry.split(';').map(str::trim);
        let name = parts.next()?.to_ascii_lowercase();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name,
            params: parts
                .filter(|p| !p.is_empty())
                .map(str::to_owned)
                .collect(),
        })
    }
}

/// Parse a negotiated `Sec-WebSocket-Extensions` value into its offers.
///
/// Malformed entries are skipped; the core has no use for rejecting a
/// header the handshake layer already accepted.
#[must_use]
pub fn parse_extensions(header: &str) -> Vec<ExtensionOffer> {
    header.split(',').filter_map(ExtensionOffer::parse).collect()
}

/// Whether the negotiated extension string includes `permessage-deflate`.
#[must_use]
pub fn negotiates_deflate(header: &str) -> bool {
    parse_extensions(header)
        .iter()
        .any(|offer| offer.name == PERMESSAGE_DEFLATE)
}
