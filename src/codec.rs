//! Byte-to-text encodings for printed keys and values.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Encoding {
    /// Lossy UTF-8.
    String,
    Hex,
    Base64,
}

impl Encoding {
    pub fn encode(&self, data: &[u8]) -> String {
        match self {
            Encoding::String => String::from_utf8_lossy(data).into_owned(),
            Encoding::Hex => hex::encode(data),
            Encoding::Base64 => BASE64.encode(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_in_each_scheme() {
        let data = b"k\xff";
        assert_eq!(Encoding::String.encode(b"key"), "key");
        assert_eq!(Encoding::String.encode(data), "k\u{fffd}");
        assert_eq!(Encoding::Hex.encode(data), "6bff");
        assert_eq!(Encoding::Base64.encode(data), "a/8=");
    }
}
