//! Header page (page 0).
//!
//! Fixed little-endian fields padded to the page size. The reserved tail of
//! the region leaves room for additive schema evolution; unknown trailing
//! bytes are ignored on read.

use crate::alloc::MapGeometry;
use crate::error::{GaldrError, Result};
use crate::mvcc::TxId;
use crate::pager::PageId;

const MAGIC: u32 = 0x4741_4C44;
const VERSION: u16 = 1;
/// Bytes of page 0 the header occupies; the rest is reserved.
pub const HEADER_REGION_SIZE: usize = 96;

/// Decoded header page.
#[derive(Clone, Debug)]
pub struct Header {
    /// Configured on-disk page size.
    pub page_size: u32,
    /// Pages the file spans, including reserved regions.
    pub total_page_count: u32,
    /// Placement of the bitmap and free-space-map regions.
    pub maps: MapGeometry,
    /// Head of the collections-metadata page chain.
    pub collections_metadata_page: PageId,
    /// Advisory flag: the file was last run with the memory-map path on.
    pub mmap_hint: bool,
    /// Frame number of the most recent committed WAL frame applied to the
    /// main file at checkpoint time.
    pub last_commit_frame: u32,
    /// Digest of the WAL header as of the last checkpoint.
    pub wal_checksum: u64,
    /// Highest transaction id committed before the last clean shutdown.
    pub last_committed_tx_id: TxId,
    /// At-rest encryption parameters; `None` for plaintext files.
    pub encryption: Option<HeaderEncryption>,
}

/// Encryption fields stored in reserved header space.
#[derive(Clone, Debug)]
pub struct HeaderEncryption {
    /// PBKDF2 salt.
    pub kdf_salt: [u8; 16],
    /// PBKDF2 iteration count.
    pub kdf_iterations: u32,
    /// Digest of the derived key, for fast wrong-password detection.
    pub key_check: u64,
}

impl Header {
    /// Header for a freshly created file.
    pub fn new(
        page_size: usize,
        total_page_count: u32,
        maps: MapGeometry,
        collections_metadata_page: PageId,
    ) -> Self {
        Self {
            page_size: page_size as u32,
            total_page_count,
            maps,
            collections_metadata_page,
            mmap_hint: false,
            last_commit_frame: 0,
            wal_checksum: 0,
            last_committed_tx_id: 0,
            encryption: None,
        }
    }

    /// Parses page 0. Returns `Ok(None)` for an all-zero page (fresh file).
    pub fn read(data: &[u8]) -> Result<Option<Self>> {
        if data.len() < HEADER_REGION_SIZE {
            return Err(GaldrError::corrupt_page(0, "header page shorter than expected"));
        }
        if data[..4].iter().all(|&b| b == 0) {
            return Ok(None);
        }

        let magic = u32::from_le_bytes(data[0..4].try_into().expect("4 bytes"));
        if magic != MAGIC {
            return Err(GaldrError::corrupt_page(0, "invalid database magic"));
        }
        let version = u16::from_le_bytes(data[4..6].try_into().expect("2 bytes"));
        if version != VERSION {
            return Err(GaldrError::corrupt_page(
                0,
                format!("unsupported format version {version}"),
            ));
        }

        let page_size = u32::from_le_bytes(data[8..12].try_into().expect("4 bytes"));
        let total_page_count = u32::from_le_bytes(data[12..16].try_into().expect("4 bytes"));
        let maps = MapGeometry {
            bitmap_start: u32::from_le_bytes(data[16..20].try_into().expect("4 bytes")),
            bitmap_pages: u32::from_le_bytes(data[20..24].try_into().expect("4 bytes")),
            fsm_start: u32::from_le_bytes(data[24..28].try_into().expect("4 bytes")),
            fsm_pages: u32::from_le_bytes(data[28..32].try_into().expect("4 bytes")),
        };
        let collections_metadata_page =
            u32::from_le_bytes(data[32..36].try_into().expect("4 bytes"));
        let mmap_hint = data[36] != 0;
        let last_commit_frame = u32::from_le_bytes(data[40..44].try_into().expect("4 bytes"));
        let wal_checksum = u64::from_le_bytes(data[48..56].try_into().expect("8 bytes"));
        let last_committed_tx_id = u64::from_le_bytes(data[56..64].try_into().expect("8 bytes"));

        let encryption = if data[64] != 0 {
            let mut kdf_salt = [0u8; 16];
            kdf_salt.copy_from_slice(&data[72..88]);
            Some(HeaderEncryption {
                kdf_salt,
                kdf_iterations: u32::from_le_bytes(data[68..72].try_into().expect("4 bytes")),
                key_check: u64::from_le_bytes(data[88..96].try_into().expect("8 bytes")),
            })
        } else {
            None
        };

        Ok(Some(Self {
            page_size,
            total_page_count,
            maps,
            collections_metadata_page,
            mmap_hint,
            last_commit_frame,
            wal_checksum,
            last_committed_tx_id,
            encryption,
        }))
    }

    /// Encodes the header into page 0's buffer.
    pub fn write(&self, data: &mut [u8]) -> Result<()> {
        if data.len() < HEADER_REGION_SIZE {
            return Err(GaldrError::corrupt_page(0, "header page shorter than expected"));
        }
        data.fill(0);
        data[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        data[4..6].copy_from_slice(&VERSION.to_le_bytes());
        data[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        data[12..16].copy_from_slice(&self.total_page_count.to_le_bytes());
        data[16..20].copy_from_slice(&self.maps.bitmap_start.to_le_bytes());
        data[20..24].copy_from_slice(&self.maps.bitmap_pages.to_le_bytes());
        data[24..28].copy_from_slice(&self.maps.fsm_start.to_le_bytes());
        data[28..32].copy_from_slice(&self.maps.fsm_pages.to_le_bytes());
        data[32..36].copy_from_slice(&self.collections_metadata_page.to_le_bytes());
        data[36] = u8::from(self.mmap_hint);
        data[40..44].copy_from_slice(&self.last_commit_frame.to_le_bytes());
        data[48..56].copy_from_slice(&self.wal_checksum.to_le_bytes());
        data[56..64].copy_from_slice(&self.last_committed_tx_id.to_le_bytes());
        if let Some(enc) = &self.encryption {
            data[64] = 1;
            data[68..72].copy_from_slice(&enc.kdf_iterations.to_le_bytes());
            data[72..88].copy_from_slice(&enc.kdf_salt);
            data[88..96].copy_from_slice(&enc.key_check.to_le_bytes());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut header = Header::new(
            4096,
            300,
            MapGeometry {
                bitmap_start: 1,
                bitmap_pages: 2,
                fsm_start: 3,
                fsm_pages: 4,
            },
            7,
        );
        header.last_commit_frame = 42;
        header.wal_checksum = 0xDEAD_BEEF_CAFE_F00D;
        header.last_committed_tx_id = 99;
        header.mmap_hint = true;
        header.encryption = Some(HeaderEncryption {
            kdf_salt: [3u8; 16],
            kdf_iterations: 600_000,
            key_check: 12345,
        });

        let mut page = vec![0u8; 4096];
        header.write(&mut page).expect("write");
        let parsed = Header::read(&page).expect("read").expect("present");

        assert_eq!(parsed.page_size, 4096);
        assert_eq!(parsed.total_page_count, 300);
        assert_eq!(parsed.maps, header.maps);
        assert_eq!(parsed.collections_metadata_page, 7);
        assert!(parsed.mmap_hint);
        assert_eq!(parsed.last_commit_frame, 42);
        assert_eq!(parsed.wal_checksum, 0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(parsed.last_committed_tx_id, 99);
        let enc = parsed.encryption.expect("encryption fields");
        assert_eq!(enc.kdf_salt, [3u8; 16]);
        assert_eq!(enc.kdf_iterations, 600_000);
        assert_eq!(enc.key_check, 12345);
    }

    #[test]
    fn zero_page_reads_as_fresh() {
        let page = vec![0u8; 1024];
        assert!(Header::read(&page).expect("read").is_none());
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut page = vec![0u8; 1024];
        page[0..4].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        assert!(matches!(
            Header::read(&page),
            Err(GaldrError::StorageCorrupt { .. })
        ));
    }
}
