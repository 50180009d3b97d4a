//! Wire format for address lists exchanged at a sync point.
//!
//! ```text
//! count    : i32, little-endian      (0 = nothing to do, no payload follows)
//! payload  : count x u64, little-endian, in list order
//! ```
//!
//! Under the distributed strategy ranks do not ship the payload; they compare
//! an [`AgreementRecord`] (count plus optional BLAKE3 digest of the payload).

use thiserror::Error;

use crate::FileAddr;

/// Size of the encoded count.
pub const COUNT_SIZE: usize = 4;

/// Size of one encoded file address.
pub const ADDR_SIZE: usize = 8;

/// BLAKE3 digest of an encoded payload.
pub type PayloadDigest = [u8; 32];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("negative entry count {0}")]
    NegativeCount(i32),

    #[error("{0} entries do not fit a 32-bit count")]
    TooManyEntries(usize),

    #[error("truncated buffer: expected {expected} bytes, got {actual}")]
    TruncatedPayload { expected: usize, actual: usize },
}

/// Encode an entry count.
pub fn encode_count(count: usize) -> Result<[u8; COUNT_SIZE], WireError> {
    let count = i32::try_from(count).map_err(|_| WireError::TooManyEntries(count))?;
    Ok(count.to_le_bytes())
}

/// Decode an entry count from the first four bytes of `buf`.
pub fn decode_count(buf: &[u8]) -> Result<usize, WireError> {
    let bytes: [u8; COUNT_SIZE] = buf
        .get(..COUNT_SIZE)
        .and_then(|b| b.try_into().ok())
        .ok_or(WireError::TruncatedPayload {
            expected: COUNT_SIZE,
            actual: buf.len(),
        })?;
    let count = i32::from_le_bytes(bytes);
    if count < 0 {
        return Err(WireError::NegativeCount(count));
    }
    Ok(count as usize)
}

/// Encode addresses as fixed-width little-endian offsets, in order.
pub fn encode_addrs(addrs: &[FileAddr]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(addrs.len() * ADDR_SIZE);
    for addr in addrs {
        buf.extend_from_slice(&addr.to_le_bytes());
    }
    buf
}

/// Decode exactly `count` addresses from `buf`.
pub fn decode_addrs(buf: &[u8], count: usize) -> Result<Vec<FileAddr>, WireError> {
    let expected = count * ADDR_SIZE;
    if buf.len() != expected {
        return Err(WireError::TruncatedPayload {
            expected,
            actual: buf.len(),
        });
    }
    Ok(buf
        .chunks_exact(ADDR_SIZE)
        .map(|chunk| {
            let mut bytes = [0u8; ADDR_SIZE];
            bytes.copy_from_slice(chunk);
            FileAddr::from_le_bytes(bytes)
        })
        .collect())
}

/// Digest of the encoded form of `addrs`.
pub fn payload_digest(addrs: &[FileAddr]) -> PayloadDigest {
    let mut hasher = blake3::Hasher::new();
    for addr in addrs {
        hasher.update(&addr.to_le_bytes());
    }
    *hasher.finalize().as_bytes()
}

/// What each rank contributes to the distributed count exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgreementRecord {
    pub count: usize,
    pub digest: Option<PayloadDigest>,
}

impl AgreementRecord {
    pub fn for_list(addrs: &[FileAddr], with_digest: bool) -> Self {
        Self {
            count: addrs.len(),
            digest: with_digest.then(|| payload_digest(addrs)),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(COUNT_SIZE + 32);
        buf.extend_from_slice(&encode_count(self.count)?);
        if let Some(digest) = &self.digest {
            buf.extend_from_slice(digest);
        }
        Ok(buf)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        let count = decode_count(buf)?;
        let rest = &buf[COUNT_SIZE..];
        let digest = match rest.len() {
            0 => None,
            32 => {
                let mut digest = [0u8; 32];
                digest.copy_from_slice(rest);
                Some(digest)
            }
            actual => {
                return Err(WireError::TruncatedPayload {
                    expected: COUNT_SIZE + 32,
                    actual: COUNT_SIZE + actual,
                })
            }
        };
        Ok(Self { count, digest })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_roundtrip() {
        let addrs = vec![0, 100, 350, 900, u64::MAX];
        let buf = encode_addrs(&addrs);
        assert_eq!(buf.len(), addrs.len() * ADDR_SIZE);
        assert_eq!(decode_addrs(&buf, addrs.len()).unwrap(), addrs);
    }

    #[test]
    fn test_count_is_little_endian_i32() {
        assert_eq!(encode_count(3).unwrap(), [3, 0, 0, 0]);
        assert_eq!(decode_count(&[0x10, 0x01, 0, 0]).unwrap(), 0x110);
    }

    #[test]
    fn test_negative_count_rejected() {
        let buf = (-1i32).to_le_bytes();
        assert_eq!(decode_count(&buf), Err(WireError::NegativeCount(-1)));
    }

    #[test]
    fn test_oversized_count_rejected() {
        let too_many = i32::MAX as usize + 1;
        assert_eq!(
            encode_count(too_many),
            Err(WireError::TooManyEntries(too_many))
        );
    }

    #[test]
    fn test_truncated_payload() {
        let buf = encode_addrs(&[1, 2]);
        let err = decode_addrs(&buf[..12], 2).unwrap_err();
        assert_eq!(
            err,
            WireError::TruncatedPayload {
                expected: 16,
                actual: 12
            }
        );
    }

    #[test]
    fn test_digest_depends_on_order() {
        assert_ne!(payload_digest(&[1, 2]), payload_digest(&[2, 1]));
        assert_eq!(payload_digest(&[1, 2]), payload_digest(&[1, 2]));
    }

    #[test]
    fn test_agreement_record_bytes() {
        let with = AgreementRecord::for_list(&[8, 16], true);
        let bytes = with.to_bytes().unwrap();
        assert_eq!(bytes.len(), COUNT_SIZE + 32);
        assert_eq!(AgreementRecord::from_bytes(&bytes).unwrap(), with);

        let without = AgreementRecord::for_list(&[8, 16], false);
        let bytes = without.to_bytes().unwrap();
        assert_eq!(bytes.len(), COUNT_SIZE);
        assert_eq!(AgreementRecord::from_bytes(&bytes).unwrap(), without);
    }

    #[test]
    fn test_agreement_record_bad_length() {
        let mut bytes = encode_count(1).unwrap().to_vec();
        bytes.extend_from_slice(&[0u8; 7]);
        assert!(AgreementRecord::from_bytes(&bytes).is_err());
    }
}
