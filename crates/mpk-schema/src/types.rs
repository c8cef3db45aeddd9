//! Fixed-width byte newtypes for digests and signatures.
//!
//! Both serialize as lowercase hex strings.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

macro_rules! bytes_newtype {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; $len]);

        impl $name {
            /// Width of the value in bytes.
            pub const LEN: usize = $len;

            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Build from a slice, returning `None` when the width is wrong.
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                <[u8; $len]>::try_from(bytes).ok().map(Self)
            }

            /// Parse exactly `2 * LEN` hex digits.
            pub fn from_hex(s: &str) -> Option<Self> {
                let mut out = [0u8; $len];
                hex::decode_to_slice(s, &mut out).ok()?;
                Some(Self(out))
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).ok_or_else(|| {
                    serde::de::Error::custom(format!(
                        "expected {} hex digits for {}",
                        2 * $len,
                        stringify!($name)
                    ))
                })
            }
        }
    };
}

bytes_newtype!(
    /// SHA-256 digest of a file's contents.
    FileHash,
    32
);

bytes_newtype!(
    /// RSA-2048 PKCS#1 v1.5 signature over a manifest's canonical bytes.
    Signature,
    256
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_hash_hex_roundtrip() {
        let h = FileHash::new([0xab; 32]);
        let hex = h.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(FileHash::from_hex(&hex), Some(h));
    }

    #[test]
    fn from_hex_rejects_wrong_width() {
        assert!(FileHash::from_hex("abcd").is_none());
        assert!(Signature::from_hex(&"00".repeat(255)).is_none());
        assert!(Signature::from_hex(&"00".repeat(256)).is_some());
    }

    #[test]
    fn from_hex_rejects_non_hex() {
        assert!(FileHash::from_hex(&"zz".repeat(32)).is_none());
    }

    #[test]
    fn from_slice_checks_length() {
        assert!(FileHash::from_slice(&[1u8; 31]).is_none());
        assert_eq!(
            FileHash::from_slice(&[1u8; 32]).map(|h| *h.as_bytes()),
            Some([1u8; 32])
        );
    }

    #[test]
    fn serde_as_hex_string() {
        let h = FileHash::new([0x01; 32]);
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
        let back: FileHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn debug_shows_type_and_hex() {
        let h = FileHash::new([0; 32]);
        assert!(format!("{h:?}").starts_with("FileHash(0000"));
    }
}
