use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed user id `{0}`, want non-empty even-length lowercase hex")]
pub struct UserIdError(String);

/// A caller-scoped account identifier.
///
/// On the wire this is a non-empty even-length lowercase hex string; it is
/// stored and compared as the corresponding byte sequence.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(Vec<u8>);

impl UserId {
    pub fn parse(s: &str) -> Result<Self, UserIdError> {
        if s.is_empty()
            || s.len() % 2 != 0
            || !s
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(UserIdError(s.to_owned()));
        }
        let bytes = hex::decode(s).map_err(|_| UserIdError(s.to_owned()))?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", hex::encode(&self.0))
    }
}

impl Serialize for UserId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        UserId::parse(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accepts_even_lowercase_hex() {
        let uid = UserId::parse("aa").unwrap();
        assert_eq!(uid.as_bytes(), &[0xaa]);
        assert_eq!(uid.to_string(), "aa");

        let uid = UserId::parse("00deadbeef").unwrap();
        assert_eq!(uid.as_bytes().len(), 5);
    }

    #[test]
    fn rejects_everything_else() {
        for bad in ["", "a", "AA", "zz", "0xaa", "aa "] {
            assert!(UserId::parse(bad).is_err(), "should reject {bad:?}");
        }
    }
}
