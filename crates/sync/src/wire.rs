//! Explicit encoding for partial-catalog batches.
//!
//! Everything is little-endian and length-prefixed:
//!
//! ```text
//! u32 record count
//! per record:
//!   u32 len || bytes    service_name
//!   u32 len || bytes    instance_id
//!   u32 len || bytes    node_id
//!   u8                  alive flag (any non-zero byte reads as alive)
//! ```
//!
//! Decoding is all-or-nothing: a batch that runs short, carries trailing
//! bytes or holds a non-UTF-8 string is rejected whole.

use flotilla_primitives::service::ServiceInstance;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum WireError {
    #[error("batch truncated reading {what}: needed {expected} bytes, had {actual}")]
    Truncated {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("batch carries {extra} trailing bytes")]
    TrailingBytes { extra: usize },

    #[error("{what} is not valid utf-8")]
    InvalidString { what: &'static str },
}

#[must_use]
pub fn encode_batch(records: &[ServiceInstance]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(records.len() as u32).to_le_bytes());

    for record in records {
        put_str(&mut out, &record.service_name);
        put_str(&mut out, &record.instance_id);
        put_str(&mut out, &record.node_id);
        out.push(u8::from(record.is_alive));
    }

    out
}

pub fn decode_batch(bytes: &[u8]) -> Result<Vec<ServiceInstance>, WireError> {
    let mut reader = Reader { bytes, at: 0 };

    let count = reader.read_u32("record count")?;
    let mut records = Vec::with_capacity(count.min(1024) as usize);

    for _ in 0..count {
        let service_name = reader.read_string("service name")?;
        let instance_id = reader.read_string("instance id")?;
        let node_id = reader.read_string("node id")?;
        let is_alive = reader.read_u8("alive flag")? != 0;

        records.push(ServiceInstance {
            service_name,
            instance_id,
            node_id,
            is_alive,
        });
    }

    let extra = reader.remaining();
    if extra > 0 {
        return Err(WireError::TrailingBytes { extra });
    }

    Ok(records)
}

/// The declared record count of an encoded batch, read without decoding
/// the body.
pub fn batch_record_count(bytes: &[u8]) -> Result<usize, WireError> {
    let mut reader = Reader { bytes, at: 0 };
    Ok(reader.read_u32("record count")? as usize)
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], WireError> {
        let end = self.at.checked_add(len).ok_or(WireError::Truncated {
            what,
            expected: len,
            actual: self.remaining(),
        })?;

        let Some(taken) = self.bytes.get(self.at..end) else {
            return Err(WireError::Truncated {
                what,
                expected: len,
                actual: self.remaining(),
            });
        };

        self.at = end;
        Ok(taken)
    }

    fn read_u8(&mut self, what: &'static str) -> Result<u8, WireError> {
        Ok(self.take(1, what)?[0])
    }

    fn read_u32(&mut self, what: &'static str) -> Result<u32, WireError> {
        let taken = self.take(4, what)?;
        Ok(u32::from_le_bytes([taken[0], taken[1], taken[2], taken[3]]))
    }

    fn read_string(&mut self, what: &'static str) -> Result<String, WireError> {
        let len = self.read_u32(what)? as usize;
        let taken = self.take(len, what)?;

        String::from_utf8(taken.to_vec()).map_err(|_| WireError::InvalidString { what })
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, id: &str, node: &str, alive: bool) -> ServiceInstance {
        ServiceInstance {
            service_name: name.to_owned(),
            instance_id: id.to_owned(),
            node_id: node.to_owned(),
            is_alive: alive,
        }
    }

    #[test]
    fn test_empty_batch_is_a_bare_count() {
        let bytes = encode_batch(&[]);

        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert_eq!(decode_batch(&bytes), Ok(Vec::new()));
    }

    #[test]
    fn test_round_trips_mixed_batch() {
        let records = vec![
            record("com.corp.DataService.v1", "id-1", "node1", true),
            record("com.corp.LoggingService.v1", "id-2", "node2", false),
            record("свободный.сервис.Имя.v1", "id-3", "node1", true),
        ];

        let decoded = decode_batch(&encode_batch(&records)).unwrap();

        assert_eq!(decoded, records);
    }

    #[test]
    fn test_truncation_is_rejected_at_every_boundary() {
        let bytes = encode_batch(&[record("com.corp.DataService.v1", "id-1", "node1", true)]);

        // Every proper prefix of a one-record batch runs short somewhere.
        for cut in 0..bytes.len() {
            assert!(
                matches!(
                    decode_batch(&bytes[..cut]),
                    Err(WireError::Truncated { .. })
                ),
                "cut {cut}"
            );
        }
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let mut bytes = encode_batch(&[record("com.corp.DataService.v1", "id-1", "node1", true)]);
        bytes.extend_from_slice(&[0, 0]);

        assert_eq!(
            decode_batch(&bytes),
            Err(WireError::TrailingBytes { extra: 2 })
        );
    }

    #[test]
    fn test_count_larger_than_body_is_truncation() {
        let mut bytes = encode_batch(&[record("com.corp.DataService.v1", "id-1", "node1", true)]);
        bytes[0] = 2;

        assert!(matches!(
            decode_batch(&bytes),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_any_nonzero_alive_byte_reads_alive() {
        let mut bytes = encode_batch(&[record("com.corp.DataService.v1", "id-1", "node1", true)]);
        let alive_at = bytes.len() - 1;

        for raw in [1_u8, 2, 0x7F, 0xFF] {
            bytes[alive_at] = raw;
            assert!(decode_batch(&bytes).unwrap()[0].is_alive, "byte {raw:#x}");
        }

        bytes[alive_at] = 0;
        assert!(!decode_batch(&bytes).unwrap()[0].is_alive);
    }

    #[test]
    fn test_record_count_reads_the_header_only() {
        let records = vec![
            record("com.corp.DataService.v1", "id-1", "node1", true),
            record("com.corp.AuthService.v1", "id-2", "node2", false),
        ];

        assert_eq!(batch_record_count(&encode_batch(&records)), Ok(2));
        assert_eq!(batch_record_count(&encode_batch(&[])), Ok(0));
        assert!(matches!(
            batch_record_count(&[0, 0]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_invalid_utf8_is_rejected() {
        // count 1, then a two-byte "name" that is not UTF-8.
        let mut bytes = vec![1, 0, 0, 0];
        bytes.extend_from_slice(&2_u32.to_le_bytes());
        bytes.extend_from_slice(&[0xFF, 0xFE]);

        assert_eq!(
            decode_batch(&bytes),
            Err(WireError::InvalidString {
                what: "service name"
            })
        );
    }
}
