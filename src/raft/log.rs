//! Log entries and their exact wire serialization (SPEC_FULL.md §4.6/§6.3):
//! `[term:u32 | index:u32 | data-len:u32 | type-len:u32 | type-bytes | data-bytes]`,
//! big-endian. Log Matching requires entries with equal (term, index) across
//! nodes to be byte-identical, so this format is the only thing that may ever
//! be persisted for a log entry — never a derived/re-encoded representation.

use crate::error::RaftError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u32,
    pub index: u32,
    pub entry_type: String,
    pub data: Vec<u8>,
}

impl LogEntry {
    pub fn to_bytes(&self) -> Vec<u8> {
        let type_bytes = self.entry_type.as_bytes();
        let mut buf = Vec::with_capacity(16 + type_bytes.len() + self.data.len());
        buf.extend_from_slice(&self.term.to_be_bytes());
        buf.extend_from_slice(&self.index.to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&(type_bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(type_bytes);
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RaftError> {
        if bytes.len() < 16 {
            return Err(RaftError::CorruptLog {
                index: 0,
                reason: "entry shorter than fixed header".to_string(),
            });
        }
        let term = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let index = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        let data_len = u32::from_be_bytes(bytes[8..12].try_into().unwrap()) as usize;
        let type_len = u32::from_be_bytes(bytes[12..16].try_into().unwrap()) as usize;
        let type_start = 16;
        let type_end = type_start + type_len;
        let data_end = type_end + data_len;
        if bytes.len() < data_end {
            return Err(RaftError::CorruptLog {
                index,
                reason: "entry truncated".to_string(),
            });
        }
        let entry_type = String::from_utf8(bytes[type_start..type_end].to_vec())
            .map_err(|e| RaftError::CorruptLog { index, reason: e.to_string() })?;
        let data = bytes[type_end..data_end].to_vec();
        Ok(Self { term, index, entry_type, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_the_exact_wire_format() {
        let entry = LogEntry {
            term: 7,
            index: 42,
            entry_type: "task.assign".to_string(),
            data: b"payload-bytes".to_vec(),
        };
        let bytes = entry.to_bytes();
        // term, index, data-len, type-len headers are 4 bytes each, big-endian.
        assert_eq!(&bytes[0..4], &7u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &42u32.to_be_bytes());
        let decoded = LogEntry::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn rejects_truncated_bytes() {
        let entry = LogEntry {
            term: 1,
            index: 1,
            entry_type: "t".to_string(),
            data: b"d".to_vec(),
        };
        let mut bytes = entry.to_bytes();
        bytes.truncate(bytes.len() - 1);
        assert!(LogEntry::from_bytes(&bytes).is_err());
    }
}
