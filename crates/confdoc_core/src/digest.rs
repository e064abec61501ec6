use std::borrow::Cow;
use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

const DIGEST_BYTES: usize = 16;

/// Line-ending-normalized 128-bit content fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; DIGEST_BYTES]);

impl ContentDigest {
    pub fn to_hex(self) -> String {
        let mut output = String::with_capacity(DIGEST_BYTES * 2);
        for byte in self.0 {
            output.push_str(&format!("{byte:02x}"));
        }
        output
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

pub fn digest(text: &str) -> ContentDigest {
    let normalized = normalize_line_endings(text);
    let hash = Sha256::digest(normalized.as_bytes());
    let mut bytes = [0u8; DIGEST_BYTES];
    bytes.copy_from_slice(&hash[..DIGEST_BYTES]);
    ContentDigest(bytes)
}

pub(crate) fn normalize_line_endings(text: &str) -> Cow<'_, str> {
    if text.contains("\r\n") {
        Cow::Owned(text.replace("\r\n", "\n"))
    } else {
        Cow::Borrowed(text)
    }
}
