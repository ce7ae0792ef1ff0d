//! A minimal textual wrapper around raw Ed25519 public key bytes.
//!
//! This is not a general ASN.1/DER/PKCS8 implementation - just enough
//! structure (header, base64 body, footer) to satisfy callers that expect
//! a `publicKeyPem`-shaped string, the same way the rest of this crate
//! represents key material as a plain encoded string rather than a typed
//! certificate.

use thiserror::Error;

const HEADER: &str = "-----BEGIN NOOTERRA ED25519 PUBLIC KEY-----";
const FOOTER: &str = "-----END NOOTERRA ED25519 PUBLIC KEY-----";

#[derive(Error, Debug)]
pub enum PemError {
    #[error("missing PEM header/footer")]
    MissingDelimiters,

    #[error("invalid base64 body: {0}")]
    InvalidBase64(String),

    #[error("decoded key must be 32 bytes, got {0}")]
    WrongLength(usize),
}

pub fn encode_public_key(bytes: &[u8]) -> String {
    use base64::Engine;
    let body = base64::engine::general_purpose::STANDARD.encode(bytes);
    format!("{HEADER}\n{body}\n{FOOTER}\n")
}

pub fn decode_public_key(pem_text: &str) -> Result<[u8; 32], PemError> {
    use base64::Engine;

    let start = pem_text
        .find(HEADER)
        .ok_or(PemError::MissingDelimiters)?
        + HEADER.len();
    let end = pem_text.find(FOOTER).ok_or(PemError::MissingDelimiters)?;
    if end < start {
        return Err(PemError::MissingDelimiters);
    }

    let body: String = pem_text[start..end].chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| PemError::InvalidBase64(e.to_string()))?;

    if bytes.len() != 32 {
        return Err(PemError::WrongLength(bytes.len()));
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_32_bytes() {
        let bytes = [7u8; 32];
        let pem_text = encode_public_key(&bytes);
        assert!(pem_text.starts_with(HEADER));
        let decoded = decode_public_key(&pem_text).unwrap();
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn rejects_missing_delimiters() {
        assert!(decode_public_key("not a pem").is_err());
    }

    #[test]
    fn rejects_wrong_length() {
        use base64::Engine;
        let body = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        let bad = format!("{HEADER}\n{body}\n{FOOTER}\n");
        assert!(decode_public_key(&bad).is_err());
    }
}
