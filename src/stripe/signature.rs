//! `Stripe-Signature` header verification.
//!
//! The header looks like `t=1700000000,v1=<hex>,v1=<hex>,v0=<hex>`. The signed
//! payload is `"{t}.{body}"`, MACed with HMAC-SHA256 under the endpoint secret
//! (the full `whsec_...` string). Any matching `v1` entry is accepted.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("malformed signature header")]
    MalformedHeader,
    #[error("no v1 signature in header")]
    NoSignature,
    #[error("timestamp {timestamp} outside tolerance")]
    OutsideTolerance { timestamp: i64 },
    #[error("webhook secret is not configured")]
    MissingSecret,
    #[error("signature mismatch")]
    Mismatch,
}

struct ParsedHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

fn parse_header(header: &str) -> Result<ParsedHeader, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                timestamp = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| SignatureError::MalformedHeader)?,
                )
            }
            // Undecodable entries are skipped rather than failing the whole header.
            "v1" => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(SignatureError::MalformedHeader)?;
    if signatures.is_empty() {
        return Err(SignatureError::NoSignature);
    }
    Ok(ParsedHeader {
        timestamp,
        signatures,
    })
}

fn mac_for(secret: &str, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::MissingSecret)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

pub fn verify(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: i64,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::MissingSecret);
    }
    let parsed = parse_header(header)?;
    if now.abs_diff(parsed.timestamp) > tolerance_secs.max(0).unsigned_abs() {
        return Err(SignatureError::OutsideTolerance {
            timestamp: parsed.timestamp,
        });
    }
    let mac = mac_for(secret, parsed.timestamp, payload)?;
    let matched = parsed
        .signatures
        .iter()
        .any(|candidate| mac.clone().verify_slice(candidate).is_ok());
    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Builds a header the way Stripe does; used to sign test fixtures.
#[cfg(test)]
pub fn sign_header(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mac = mac_for(secret, timestamp, payload).expect("hmac accepts any key");
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test123secret456";
    const BODY: &[u8] = br#"{"id":"evt_1","type":"checkout.session.completed"}"#;
    const NOW: i64 = 1_700_000_000;

    #[test]
    fn accepts_valid_signature() {
        let header = sign_header(BODY, SECRET, NOW);
        assert_eq!(verify(BODY, &header, SECRET, NOW + 10, DEFAULT_TOLERANCE_SECS), Ok(()));
    }

    #[test]
    fn accepts_any_matching_v1_entry() {
        let good = sign_header(BODY, SECRET, NOW);
        let good_sig = good.split("v1=").nth(1).expect("sig");
        let header = format!("t={NOW},v1={},v1={good_sig},v0=abc", "00".repeat(32));
        assert_eq!(verify(BODY, &header, SECRET, NOW, DEFAULT_TOLERANCE_SECS), Ok(()));
    }

    #[test]
    fn rejects_wrong_secret() {
        let header = sign_header(BODY, "whsec_other", NOW);
        assert_eq!(
            verify(BODY, &header, SECRET, NOW, DEFAULT_TOLERANCE_SECS),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_modified_payload() {
        let header = sign_header(BODY, SECRET, NOW);
        let tampered = br#"{"id":"evt_1","type":"checkout.session.completed","x":1}"#;
        assert_eq!(
            verify(tampered, &header, SECRET, NOW, DEFAULT_TOLERANCE_SECS),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_stale_timestamp() {
        let header = sign_header(BODY, SECRET, NOW - 600);
        assert_eq!(
            verify(BODY, &header, SECRET, NOW, DEFAULT_TOLERANCE_SECS),
            Err(SignatureError::OutsideTolerance {
                timestamp: NOW - 600
            })
        );
    }

    #[test]
    fn extreme_timestamps_are_outside_tolerance() {
        let zeros = "00".repeat(32);
        for timestamp in [i64::MIN, i64::MAX] {
            let header = format!("t={timestamp},v1={zeros}");
            assert_eq!(
                verify(BODY, &header, SECRET, NOW, DEFAULT_TOLERANCE_SECS),
                Err(SignatureError::OutsideTolerance { timestamp })
            );
        }
    }

    #[test]
    fn rejects_malformed_headers() {
        assert_eq!(
            verify(BODY, "garbage", SECRET, NOW, DEFAULT_TOLERANCE_SECS),
            Err(SignatureError::MalformedHeader)
        );
        assert_eq!(
            verify(BODY, "t=abc,v1=00", SECRET, NOW, DEFAULT_TOLERANCE_SECS),
            Err(SignatureError::MalformedHeader)
        );
        assert_eq!(
            verify(BODY, &format!("t={NOW}"), SECRET, NOW, DEFAULT_TOLERANCE_SECS),
            Err(SignatureError::NoSignature)
        );
    }

    #[test]
    fn empty_secret_never_verifies() {
        let header = sign_header(BODY, "", NOW);
        assert_eq!(
            verify(BODY, &header, "", NOW, DEFAULT_TOLERANCE_SECS),
            Err(SignatureError::MissingSecret)
        );
    }
}
