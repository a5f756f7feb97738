//! Journal entry framing.

use crate::error::{CoreError, CoreResult};
use xfstore_storage::ItemId;

/// Magic bytes opening every journal entry.
pub const JOURNAL_MAGIC: [u8; 4] = *b"XJNL";

/// Current journal entry version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + id length (2)
pub(crate) const PREFIX_SIZE: usize = 8;
/// dest (8) + payload length (4)
const TAIL_HEADER_SIZE: usize = 12;
const CRC_SIZE: usize = 4;

/// One journaled write: an item, a destination marker and a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// The item the entry belongs to.
    pub id: ItemId,
    /// Destination marker; its meaning depends on the journal kind.
    pub dest: i64,
    /// Entry payload.
    pub payload: Vec<u8>,
}

impl JournalEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(id: ItemId, dest: i64, payload: Vec<u8>) -> Self {
        Self { id, dest, payload }
    }

    /// Encodes the entry with its envelope.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the id or payload is too large.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        encode_parts(&self.id, self.dest, &self.payload)
    }

    /// Decodes an entry from the start of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` holds only part of an entry, otherwise the
    /// entry and the number of bytes it occupied. `offset` is used in errors.
    ///
    /// # Errors
    ///
    /// Returns `JournalCorruption` on bad magic, version, id or checksum.
    pub fn decode(buf: &[u8], offset: u64) -> CoreResult<Option<(Self, usize)>> {
        let total = frame_len(buf, offset)?;
        if buf.len() < total {
            return Ok(None);
        }
        let frame = &buf[..total];
        let body_end = total - CRC_SIZE;
        let stored = read_u32(frame, body_end);
        let computed = compute_crc32(&frame[..body_end]);
        if stored != computed {
            return Err(CoreError::journal_corruption(format!(
                "checksum mismatch at offset {offset}: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }

        let id_len = usize::from(read_u16(frame, 6));
        let id_end = PREFIX_SIZE + id_len;
        let id_text = std::str::from_utf8(&frame[PREFIX_SIZE..id_end]).map_err(|_| {
            CoreError::journal_corruption(format!("item id is not UTF-8 at offset {offset}"))
        })?;
        let id = ItemId::parse(id_text).map_err(|e| {
            CoreError::journal_corruption(format!("bad item id at offset {offset}: {e}"))
        })?;
        let dest = read_i64(frame, id_end);
        let payload = frame[id_end + TAIL_HEADER_SIZE..body_end].to_vec();
        Ok(Some((Self { id, dest, payload }, total)))
    }
}

pub(crate) fn encode_parts(id: &ItemId, dest: i64, payload: &[u8]) -> CoreResult<Vec<u8>> {
    let id_text = id.to_string();
    let id_len = u16::try_from(id_text.len())
        .map_err(|_| CoreError::invalid_operation("item id too long for journal"))?;
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| CoreError::invalid_operation("journal payload too large"))?;

    let mut data = Vec::with_capacity(
        PREFIX_SIZE + id_text.len() + TAIL_HEADER_SIZE + payload.len() + CRC_SIZE,
    );
    data.extend_from_slice(&JOURNAL_MAGIC);
    data.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    data.extend_from_slice(&id_len.to_le_bytes());
    data.extend_from_slice(id_text.as_bytes());
    data.extend_from_slice(&dest.to_le_bytes());
    data.extend_from_slice(&payload_len.to_le_bytes());
    data.extend_from_slice(payload);
    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

/// Returns how many bytes the entry at the start of `buf` occupies, as far as
/// `buf` reveals. Callers grow `buf` until the answer stops changing.
pub(crate) fn frame_len(buf: &[u8], offset: u64) -> CoreResult<usize> {
    if buf.len() < PREFIX_SIZE {
        return Ok(PREFIX_SIZE);
    }
    if buf[0..4] != JOURNAL_MAGIC {
        return Err(CoreError::journal_corruption(format!(
            "invalid magic at offset {offset}"
        )));
    }
    let version = read_u16(buf, 4);
    if version == 0 || version > JOURNAL_VERSION {
        return Err(CoreError::journal_corruption(format!(
            "unsupported version {version} at offset {offset}"
        )));
    }
    let header = PREFIX_SIZE + usize::from(read_u16(buf, 6)) + TAIL_HEADER_SIZE;
    if buf.len() < header {
        return Ok(header);
    }
    let payload_len = read_u32(buf, header - 4) as usize;
    Ok(header + payload_len + CRC_SIZE)
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_i64(buf: &[u8], at: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    i64::from_le_bytes(bytes)
}

/// Computes the IEEE CRC-32 of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 == 0 {
                    crc >> 1
                } else {
                    (crc >> 1) ^ 0xEDB8_8320
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(dest: i64, payload: &[u8]) -> JournalEntry {
        JournalEntry::new(ItemId::parse("/ts/a").unwrap(), dest, payload.to_vec())
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn partial_frames_are_incomplete() {
        let bytes = entry(-2, b"payload").encode().unwrap();
        for cut in [0, 3, PREFIX_SIZE, PREFIX_SIZE + 4, bytes.len() - 1] {
            assert!(JournalEntry::decode(&bytes[..cut], 0).unwrap().is_none(), "cut {cut}");
        }
    }

    #[test]
    fn flipped_byte_is_corruption() {
        let mut bytes = entry(0, b"ABCD").encode().unwrap();
        let last_payload = bytes.len() - CRC_SIZE - 1;
        bytes[last_payload] ^= 0xFF;
        assert!(matches!(
            JournalEntry::decode(&bytes, 40),
            Err(CoreError::JournalCorruption { .. })
        ));
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut bytes = entry(0, b"x").encode().unwrap();
        bytes[0] = b'Z';
        assert!(JournalEntry::decode(&bytes, 0).is_err());
    }

    proptest! {
        #[test]
        fn framing_survives_any_payload(
            dest in any::<i64>(),
            payload in prop::collection::vec(any::<u8>(), 0..512),
            trailing in prop::collection::vec(any::<u8>(), 0..16),
        ) {
            let original = entry(dest, &payload);
            let mut bytes = original.encode().unwrap();
            let frame = bytes.len();
            bytes.extend_from_slice(&trailing);
            let (decoded, used) = JournalEntry::decode(&bytes, 0).unwrap().unwrap();
            prop_assert_eq!(used, frame);
            prop_assert_eq!(decoded, original);
        }
    }
}
