//! 64-bit radio peer identity (IEEE EUI-64).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PeerParseError;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Peer(pub [u8; 8]);

impl Peer {
    /// Network coordinator address. Devices announce themselves here.
    pub const COORDINATOR: Peer = Peer([0; 8]);

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Interpret a string as raw address bytes, taking its UTF-8 encoding.
    /// Deployed peers send bind targets this way (`"\u0000..."`).
    pub fn from_raw_str(s: &str) -> Option<Peer> {
        <[u8; 8]>::try_from(s.as_bytes()).ok().map(Peer)
    }

    /// Accept either hex notation or the raw 8-byte form.
    pub fn from_arg(s: &str) -> Option<Peer> {
        s.parse().ok().or_else(|| Peer::from_raw_str(s))
    }
}

impl FromStr for Peer {
    type Err = PeerParseError;

    /// Parses `0013a20041a06e60` or the colon form `00:13:a2:00:41:a0:6e:60`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| *c != ':').collect();
        if digits.len() != 16 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PeerParseError(s.to_string()));
        }
        let mut bytes = [0u8; 8];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
                .map_err(|_| PeerParseError(s.to_string()))?;
        }
        Ok(Peer(bytes))
    }
}

impl TryFrom<String> for Peer {
    type Error = PeerParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Peer> for String {
    fn from(p: Peer) -> String {
        p.to_string()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({self})")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
