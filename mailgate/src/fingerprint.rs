//! Store keys derived from message participants.
//!
//! A fingerprint is the SHA-256 of the lower-cased parts, in order, each
//! terminated by a NUL byte, encoded as unpadded URL-safe base64 (43 chars).
//! The terminator keeps `("ab", "c")` and `("a", "bc")` apart.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};
use std::net::IpAddr;

/// Length of every fingerprint produced by [`fingerprint`].
pub const FINGERPRINT_LEN: usize = 43;

pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.to_lowercase().as_bytes());
        hasher.update([0u8]);
    }
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Address comparison used to skip self-sends. Folds case the same way
/// [`fingerprint`] does, so two addresses are the same exactly when they
/// would hash to the same key.
pub fn same_address(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

/// The part of a sending address that greylisting treats as one subject.
///
/// IPv4 addresses keep their first three octets (`192.0.2`). IPv6 addresses
/// keep the first 14 characters of the fully expanded form, i.e. the first
/// three groups (`2001:0db8:0001`). IPv4-mapped IPv6 addresses are treated as
/// IPv4. Returns `None` for anything that is not an IP address.
pub fn network_prefix(ip: &str) -> Option<String> {
    let ip = ip.trim().trim_start_matches('[').trim_end_matches(']');
    let addr: IpAddr = ip.parse().ok()?;
    let addr = match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    };

    match addr {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            Some(format!("{}.{}.{}", a, b, c))
        }
        IpAddr::V6(v6) => {
            let expanded = v6
                .segments()
                .iter()
                .map(|s| format!("{:04x}", s))
                .collect::<Vec<_>>()
                .join(":");
            Some(expanded[..14].to_string())
        }
    }
}
