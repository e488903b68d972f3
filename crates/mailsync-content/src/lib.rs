//! Body decoding and thread resolution. Everything here is pure and never
//! fails outward: malformed input degrades to the raw text.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STD;

pub mod thread;

pub use thread::{normalize_message_id, resolve_thread_id};

/// Content-Transfer-Encoding of a single body part.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransferEncoding {
    #[default]
    SevenBit,
    EightBit,
    Binary,
    Base64,
    QuotedPrintable,
    Other(String),
}

impl TransferEncoding {
    pub fn from_tag(tag: &str) -> Self {
        let tag = tag.trim().to_ascii_lowercase();
        match tag.as_str() {
            "7bit" | "" => TransferEncoding::SevenBit,
            "8bit" => TransferEncoding::EightBit,
            "binary" => TransferEncoding::Binary,
            "base64" => TransferEncoding::Base64,
            "quoted-printable" => TransferEncoding::QuotedPrintable,
            _ => TransferEncoding::Other(tag),
        }
    }

    pub fn as_tag(&self) -> &str {
        match self {
            TransferEncoding::SevenBit => "7bit",
            TransferEncoding::EightBit => "8bit",
            TransferEncoding::Binary => "binary",
            TransferEncoding::Base64 => "base64",
            TransferEncoding::QuotedPrintable => "quoted-printable",
            TransferEncoding::Other(tag) => tag.as_str(),
        }
    }
}

pub fn decode_body(raw: &[u8], encoding: &TransferEncoding) -> String {
    let bytes = match encoding {
        TransferEncoding::QuotedPrintable => {
            quoted_printable::decode(raw, quoted_printable::ParseMode::Robust)
                .unwrap_or_else(|_| raw.to_vec())
        }
        TransferEncoding::Base64 => {
            let cleaned: Vec<u8> = raw
                .iter()
                .filter(|b| !b.is_ascii_whitespace())
                .copied()
                .collect();
            BASE64_STD
                .decode(&cleaned)
                .unwrap_or_else(|_| raw.to_vec())
        }
        _ => raw.to_vec(),
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

/// True when a decoded part carries nothing worth storing, which sends the
/// caller on to the next body part.
pub fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_printable_restores_plaintext() {
        let raw = b"Caf=C3=A9 au lait, soft=\r\nbreak and =3D sign";
        let text = decode_body(raw, &TransferEncoding::QuotedPrintable);
        assert_eq!(text, "Café au lait, softbreak and = sign");
    }

    #[test]
    fn base64_restores_plaintext_across_wrapped_lines() {
        let encoded = BASE64_STD.encode("Hello from the other side\nsecond line");
        let (head, tail) = encoded.split_at(12);
        let wrapped = format!("{}\r\n{}\r\n", head, tail);
        let text = decode_body(wrapped.as_bytes(), &TransferEncoding::Base64);
        assert_eq!(text, "Hello from the other side\nsecond line");
    }

    #[test]
    fn other_encodings_pass_through() {
        let raw = "plain =3D text".as_bytes();
        for encoding in [
            TransferEncoding::SevenBit,
            TransferEncoding::EightBit,
            TransferEncoding::Binary,
            TransferEncoding::Other("x-uuencode".to_string()),
        ] {
            assert_eq!(decode_body(raw, &encoding), "plain =3D text");
        }
    }

    #[test]
    fn malformed_base64_degrades_to_raw_text() {
        let raw = b"this is not base64 at all!";
        let text = decode_body(raw, &TransferEncoding::Base64);
        assert_eq!(text, "this is not base64 at all!");
    }

    #[test]
    fn tags_parse_case_insensitively() {
        assert_eq!(
            TransferEncoding::from_tag("Quoted-Printable"),
            TransferEncoding::QuotedPrintable
        );
        assert_eq!(TransferEncoding::from_tag(" BASE64 "), TransferEncoding::Base64);
        assert_eq!(TransferEncoding::from_tag(""), TransferEncoding::SevenBit);
        assert_eq!(
            TransferEncoding::from_tag("X-Custom"),
            TransferEncoding::Other("x-custom".to_string())
        );
    }

    #[test]
    fn whitespace_only_text_is_blank() {
        assert!(is_blank(" \r\n\t"));
        assert!(!is_blank(" x "));
    }
}
