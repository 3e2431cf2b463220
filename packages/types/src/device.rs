use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Deserializer, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum DeviceIdError {
    #[error("device id is not valid base64-url: {0}")]
    Encoding(String),
    #[error("device id must decode to exactly 16 bytes, got {0}")]
    Length(usize),
}

/// A device identity: 16 raw bytes, rendered as unpadded base64-url
/// everywhere outside the process (broker headers, topics, events).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId([u8; 16]);

impl DeviceId {
    pub fn new(bytes: [u8; 16]) -> Self {
        DeviceId(bytes)
    }

    pub fn from_encoded(encoded: &str) -> Result<Self, DeviceIdError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| DeviceIdError::Encoding(e.to_string()))?;
        let bytes: [u8; 16] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| DeviceIdError::Length(bytes.len()))?;
        Ok(DeviceId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.encode())
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceId::from_encoded(s)
    }
}

impl Serialize for DeviceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DeviceId::from_encoded(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum RealmError {
    #[error("realm name must be non-empty lowercase alphanumeric")]
    Invalid,
}

/// Tenant namespace. Lowercase alphanumeric plus underscore, as accepted
/// by the housekeeping service when the realm was created.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Realm(String);

impl Realm {
    pub fn new(name: impl Into<String>) -> Result<Self, RealmError> {
        let name = name.into();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(RealmError::Invalid);
        }
        Ok(Realm(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Realm({})", self.0)
    }
}

impl FromStr for Realm {
    type Err = RealmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Realm::new(s)
    }
}

impl<'de> Deserialize<'de> for Realm {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Realm::new(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_round_trip() {
        let id = DeviceId::new([
            0xf0, 0x9a, 0x3d, 0x65, 0xd9, 0x1a, 0x4f, 0xa9, 0x96, 0xf1, 0x86, 0x71, 0xa3, 0x7b,
            0x08, 0xbf,
        ]);
        let encoded = id.encode();
        assert_eq!(encoded.len(), 22);
        assert_eq!(DeviceId::from_encoded(&encoded).unwrap(), id);
    }

    #[test]
    fn device_id_rejects_wrong_length() {
        // 8 bytes, valid base64-url
        let err = DeviceId::from_encoded("AAAAAAAAAAA").unwrap_err();
        assert_eq!(err, DeviceIdError::Length(8));

        // extended ids (>16 bytes) are rejected too
        let long = URL_SAFE_NO_PAD.encode([0u8; 24]);
        let err = DeviceId::from_encoded(&long).unwrap_err();
        assert_eq!(err, DeviceIdError::Length(24));
    }

    #[test]
    fn device_id_rejects_bad_encoding() {
        assert!(matches!(
            DeviceId::from_encoded("not!valid!base64!!!!!!"),
            Err(DeviceIdError::Encoding(_))
        ));
    }

    #[test]
    fn realm_validation() {
        Realm::new("test").unwrap();
        Realm::new("realm_42").unwrap();
        Realm::new("").unwrap_err();
        Realm::new("Upper").unwrap_err();
        Realm::new("has space").unwrap_err();
    }
}
