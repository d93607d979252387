//! 128-bit identifiers for sessions, applications, and service providers.
//!
//! Bytes are carried on the wire in the order they are stored; the textual
//! form is the usual 8-4-4-4-12 grouping of those same bytes.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::wire::WireError;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    /// The nil GUID. As an application id it is the wildcard that matches
    /// every application.
    pub const NIL: Guid = Guid([0u8; 16]);

    /// A fresh random identifier, used for session instance ids.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Guid(bytes)
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// Wildcard-aware application match: a nil filter matches everything.
    pub fn matches_application(&self, filter: &Guid) -> bool {
        filter.is_nil() || self == filter
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for Guid {
    fn from(bytes: [u8; 16]) -> Self {
        Guid(bytes)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = hex::encode(self.0);
        write!(
            f,
            "{}-{}-{}-{}-{}",
            &h[0..8],
            &h[8..12],
            &h[12..16],
            &h[16..20],
            &h[20..32]
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({self})")
    }
}

impl FromStr for Guid {
    type Err = WireError;

    /// Accepts `8-4-4-4-12` with or without surrounding braces, or 32 bare
    /// hex digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('{').trim_end_matches('}');
        let digits: String = trimmed.chars().filter(|c| *c != '-').collect();
        let bytes = hex::decode(&digits).map_err(|_| WireError::BadGuid(s.to_string()))?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| WireError::BadGuid(s.to_string()))?;
        Ok(Guid(bytes))
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_agree() {
        let g = Guid([
            0x68, 0x5b, 0xc4, 0x00, 0x9d, 0x2c, 0x11, 0xcf, 0xa9, 0xcd, 0x00, 0xaa, 0x00, 0x68,
            0x86, 0xe3,
        ]);
        let text = g.to_string();
        assert_eq!(text, "685bc400-9d2c-11cf-a9cd-00aa006886e3");
        assert_eq!(text.parse::<Guid>().unwrap(), g);
        assert_eq!(format!("{{{text}}}").parse::<Guid>().unwrap(), g);
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!("1234".parse::<Guid>().is_err());
        assert!("zz5bc400-9d2c-11cf-a9cd-00aa006886e3".parse::<Guid>().is_err());
    }

    #[test]
    fn nil_application_is_wildcard() {
        let app = Guid::random();
        let other = Guid::random();
        assert!(app.matches_application(&Guid::NIL));
        assert!(app.matches_application(&app));
        assert!(!app.matches_application(&other));
    }
}
