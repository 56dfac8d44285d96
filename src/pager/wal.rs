//! Write-ahead log.
//!
//! A separate append-only file next to the database. Frames for an open
//! transaction are buffered in memory; `commit_tx` seals the buffer by
//! writing every frame, stamping the last one with the commit flag, syncing,
//! and bumping the header frame count. Aborted transactions never reach the
//! disk. Each frame carries a CRC32 over its payload so torn trailing writes
//! are detected and discarded during recovery.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crc32fast::hash as crc32;
use rand::RngCore;
use xxhash_rust::xxh64::xxh64;

use crate::error::{GaldrError, Result};
use crate::mvcc::TxId;
use crate::pager::{PageCrypto, PageId};

const WAL_MAGIC: &[u8; 4] = b"WALD";
const WAL_VERSION: u16 = 1;
/// Size of the WAL file header in bytes.
pub const WAL_HEADER_SIZE: usize = 64;
const FRAME_HEADER_SIZE: usize = 24;

/// Kind of change a WAL frame describes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameKind {
    /// Full image of a document or B+ tree page.
    Page = 0x01,
    /// Full image of a header or collections-metadata page.
    Meta = 0x02,
    /// Full image of a bitmap or free-space-map page.
    MapChunk = 0x03,
}

impl FrameKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Page),
            0x02 => Ok(Self::Meta),
            0x03 => Ok(Self::MapChunk),
            other => Err(GaldrError::corrupt(format!(
                "unknown WAL change type {other:#x}"
            ))),
        }
    }
}

struct PendingFrame {
    kind: FrameKind,
    page_id: PageId,
    data: Arc<Vec<u8>>,
}

/// The write-ahead log for one database file.
pub struct Wal {
    file: File,
    page_size: usize,
    next_frame: u32,
    committed_frames: u32,
    salt: (u64, u64),
    buffers: HashMap<TxId, Vec<PendingFrame>>,
}

impl Wal {
    /// Opens (or creates) the WAL beside `db_path`.
    pub fn open(db_path: &Path, page_size: usize) -> Result<Self> {
        let path = wal_path(db_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut wal = Self {
            file,
            page_size,
            next_frame: 1,
            committed_frames: 0,
            salt: fresh_salt(),
            buffers: HashMap::new(),
        };

        if wal.file.metadata()?.len() == 0 {
            wal.write_header()?;
        } else {
            wal.read_header()?;
            wal.next_frame = wal.scan_frame_end()?;
        }
        Ok(wal)
    }

    /// Number of frames covered by the last durable commit.
    pub fn committed_frame_count(&self) -> u32 {
        self.committed_frames
    }

    /// WAL file size in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Opens an in-memory frame buffer for `tx_id`.
    pub fn begin_tx(&mut self, tx_id: TxId) {
        self.buffers.entry(tx_id).or_default();
    }

    /// Buffers one full-page frame for `tx_id`. Nothing reaches disk until
    /// [`commit_tx`](Self::commit_tx).
    pub fn append_frame(
        &mut self,
        tx_id: TxId,
        kind: FrameKind,
        page_id: PageId,
        data: Arc<Vec<u8>>,
    ) -> Result<()> {
        if data.len() != self.page_size {
            return Err(GaldrError::InvalidArgument(
                "WAL frame image does not match the page size".into(),
            ));
        }
        let buffer = self.buffers.get_mut(&tx_id).ok_or_else(|| {
            GaldrError::InvalidArgument(format!("no open WAL transaction {tx_id}"))
        })?;
        buffer.push(PendingFrame {
            kind,
            page_id,
            data,
        });
        Ok(())
    }

    /// Seals the buffered frames: writes them in order, stamps the last with
    /// the commit flag, syncs, and advances the header frame count. An empty
    /// buffer commits as a no-op with no frames written.
    pub fn commit_tx(&mut self, tx_id: TxId, crypto: Option<&PageCrypto>) -> Result<u32> {
        let frames = self.buffers.remove(&tx_id).ok_or_else(|| {
            GaldrError::InvalidArgument(format!("no open WAL transaction {tx_id}"))
        })?;
        if frames.is_empty() {
            return Ok(self.committed_frames);
        }

        self.file.seek(SeekFrom::End(0))?;
        let last = frames.len() - 1;
        for (idx, frame) in frames.iter().enumerate() {
            let mut payload = Vec::with_capacity(4 + frame.data.len());
            payload.extend_from_slice(&frame.page_id.to_le_bytes());
            payload.extend_from_slice(&frame.data);
            let payload = match crypto {
                Some(crypto) => crypto.seal(self.next_frame, &payload)?,
                None => payload,
            };

            let mut header = [0u8; FRAME_HEADER_SIZE];
            header[0..4].copy_from_slice(&self.next_frame.to_le_bytes());
            header[4..12].copy_from_slice(&tx_id.to_le_bytes());
            header[12] = frame.kind as u8;
            header[13] = u8::from(idx == last);
            header[16..20].copy_from_slice(&(payload.len() as u32).to_le_bytes());
            header[20..24].copy_from_slice(&crc32(&payload).to_le_bytes());

            self.file.write_all(&header)?;
            self.file.write_all(&payload)?;
            self.next_frame = self
                .next_frame
                .checked_add(1)
                .ok_or_else(|| GaldrError::corrupt("WAL frame number overflow"))?;
        }
        self.file.sync_data()?;

        self.committed_frames = self.next_frame - 1;
        self.write_header()?;
        Ok(self.committed_frames)
    }

    /// Discards the buffered frames for `tx_id`; the disk is untouched.
    pub fn abort_tx(&mut self, tx_id: TxId) {
        self.buffers.remove(&tx_id);
    }

    /// Replays every committed frame in order into `apply`. Returns the
    /// number of frames applied. A trailing run with no commit flag is
    /// ignored; unreadable frames inside the committed region fail recovery.
    pub fn replay<F>(&mut self, crypto: Option<&PageCrypto>, mut apply: F) -> Result<u32>
    where
        F: FnMut(FrameKind, PageId, &[u8]) -> Result<()>,
    {
        self.file.seek(SeekFrom::Start(WAL_HEADER_SIZE as u64))?;

        let mut pending: HashMap<TxId, Vec<(FrameKind, PageId, Vec<u8>)>> = HashMap::new();
        let mut applied = 0u32;
        let mut frame_number = 0u32;

        loop {
            let mut header = [0u8; FRAME_HEADER_SIZE];
            if !read_exact_or_eof(&mut self.file, &mut header)? {
                break;
            }
            let number = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
            let tx_id = u64::from_le_bytes(header[4..12].try_into().expect("8 bytes"));
            let commit = header[13] != 0;
            let payload_len = u32::from_le_bytes(header[16..20].try_into().expect("4 bytes"));
            let stored_crc = u32::from_le_bytes(header[20..24].try_into().expect("4 bytes"));

            if number != frame_number + 1 {
                break;
            }
            let mut payload = vec![0u8; payload_len as usize];
            if !read_exact_or_eof(&mut self.file, &mut payload)? {
                break;
            }
            if crc32(&payload) != stored_crc {
                break;
            }
            frame_number = number;

            let payload = match crypto {
                Some(crypto) => crypto.open(number, &payload)?,
                None => payload,
            };
            if payload.len() < 4 {
                return Err(GaldrError::RecoveryFailed {
                    frame: number,
                    reason: "frame payload shorter than its page id".into(),
                });
            }
            let kind = FrameKind::from_u8(header[12]).map_err(|_| GaldrError::RecoveryFailed {
                frame: number,
                reason: format!("unknown change type {:#x}", header[12]),
            })?;
            let page_id = u32::from_le_bytes(payload[0..4].try_into().expect("4 bytes"));
            pending
                .entry(tx_id)
                .or_default()
                .push((kind, page_id, payload[4..].to_vec()));

            if commit {
                if let Some(frames) = pending.remove(&tx_id) {
                    for (kind, page_id, data) in frames {
                        apply(kind, page_id, &data).map_err(|err| GaldrError::RecoveryFailed {
                            frame: number,
                            reason: err.to_string(),
                        })?;
                        applied += 1;
                    }
                }
            }
        }

        if frame_number < self.committed_frames {
            return Err(GaldrError::RecoveryFailed {
                frame: frame_number + 1,
                reason: format!(
                    "log ends at frame {frame_number} but the header commits {}",
                    self.committed_frames
                ),
            });
        }
        Ok(applied)
    }

    /// Truncates the log back to a fresh header with new salts.
    pub fn reset(&mut self) -> Result<()> {
        self.file.set_len(WAL_HEADER_SIZE as u64)?;
        self.next_frame = 1;
        self.committed_frames = 0;
        self.salt = fresh_salt();
        self.write_header()?;
        Ok(())
    }

    /// 64-bit digest over the WAL header, persisted in the main file header
    /// at checkpoint.
    pub fn header_checksum(&self) -> u64 {
        let encoded = self.encode_header();
        u64::from_le_bytes(encoded[32..40].try_into().expect("8 bytes"))
    }

    fn encode_header(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut header = [0u8; WAL_HEADER_SIZE];
        header[0..4].copy_from_slice(WAL_MAGIC);
        header[4..6].copy_from_slice(&WAL_VERSION.to_le_bytes());
        header[8..12].copy_from_slice(&(self.page_size as u32).to_le_bytes());
        header[12..16].copy_from_slice(&self.committed_frames.to_le_bytes());
        header[16..24].copy_from_slice(&self.salt.0.to_le_bytes());
        header[24..32].copy_from_slice(&self.salt.1.to_le_bytes());
        let digest = xxh64(&header[0..32], 0);
        header[32..40].copy_from_slice(&digest.to_le_bytes());
        header
    }

    fn write_header(&mut self) -> Result<()> {
        let header = self.encode_header();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn read_header(&mut self) -> Result<()> {
        let mut header = [0u8; WAL_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut header)?;

        if &header[0..4] != WAL_MAGIC {
            return Err(GaldrError::corrupt("invalid WAL magic"));
        }
        let version = u16::from_le_bytes(header[4..6].try_into().expect("2 bytes"));
        if version != WAL_VERSION {
            return Err(GaldrError::corrupt(format!(
                "unsupported WAL version {version}"
            )));
        }
        let page_size = u32::from_le_bytes(header[8..12].try_into().expect("4 bytes"));
        if page_size as usize != self.page_size {
            return Err(GaldrError::corrupt(
                "WAL page size differs from the database configuration",
            ));
        }
        let stored = u64::from_le_bytes(header[32..40].try_into().expect("8 bytes"));
        if xxh64(&header[0..32], 0) != stored {
            return Err(GaldrError::corrupt("WAL header checksum mismatch"));
        }

        self.committed_frames = u32::from_le_bytes(header[12..16].try_into().expect("4 bytes"));
        self.salt = (
            u64::from_le_bytes(header[16..24].try_into().expect("8 bytes")),
            u64::from_le_bytes(header[24..32].try_into().expect("8 bytes")),
        );
        Ok(())
    }

    /// Walks the frame chain to find where appends resume after reopen.
    fn scan_frame_end(&mut self) -> Result<u32> {
        self.file.seek(SeekFrom::Start(WAL_HEADER_SIZE as u64))?;
        let mut frame_number = 0u32;
        loop {
            let mut header = [0u8; FRAME_HEADER_SIZE];
            if !read_exact_or_eof(&mut self.file, &mut header)? {
                break;
            }
            let number = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
            let payload_len = u32::from_le_bytes(header[16..20].try_into().expect("4 bytes"));
            let stored_crc = u32::from_le_bytes(header[20..24].try_into().expect("4 bytes"));
            if number != frame_number + 1 {
                break;
            }
            let mut payload = vec![0u8; payload_len as usize];
            if !read_exact_or_eof(&mut self.file, &mut payload)? {
                break;
            }
            if crc32(&payload) != stored_crc {
                break;
            }
            frame_number = number;
        }
        Ok(frame_number + 1)
    }
}

fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> Result<bool> {
    let mut read = 0usize;
    while read < buf.len() {
        let n = file.read(&mut buf[read..])?;
        if n == 0 {
            return Ok(false);
        }
        read += n;
    }
    Ok(true)
}

fn fresh_salt() -> (u64, u64) {
    let mut rng = rand::thread_rng();
    (rng.next_u64(), rng.next_u64())
}

/// Path of the WAL file for a database at `db_path`.
pub fn wal_path(db_path: &Path) -> PathBuf {
    let mut os_string = db_path.as_os_str().to_owned();
    os_string.push(".wal");
    PathBuf::from(os_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE: usize = 1024;

    fn image(fill: u8) -> Arc<Vec<u8>> {
        Arc::new(vec![fill; PAGE])
    }

    #[test]
    fn committed_frames_replay_in_order() {
        let dir = tempdir().expect("tmpdir");
        let db = dir.path().join("db");
        let mut wal = Wal::open(&db, PAGE).expect("open wal");

        wal.begin_tx(1);
        wal.append_frame(1, FrameKind::Page, 4, image(0xAA)).expect("frame");
        wal.append_frame(1, FrameKind::MapChunk, 1, image(0xBB)).expect("frame");
        wal.commit_tx(1, None).expect("commit");

        let mut seen = Vec::new();
        let applied = wal
            .replay(None, |kind, page_id, data| {
                seen.push((kind, page_id, data[0]));
                Ok(())
            })
            .expect("replay");
        assert_eq!(applied, 2);
        assert_eq!(
            seen,
            vec![
                (FrameKind::Page, 4, 0xAA),
                (FrameKind::MapChunk, 1, 0xBB)
            ]
        );
    }

    #[test]
    fn uncommitted_frames_are_discarded() {
        let dir = tempdir().expect("tmpdir");
        let db = dir.path().join("db");

        {
            let mut wal = Wal::open(&db, PAGE).expect("open wal");
            wal.begin_tx(7);
            wal.append_frame(7, FrameKind::Page, 2, image(0x11)).expect("frame");
            // No commit: buffer dies with the handle, nothing was written.
        }

        let mut wal = Wal::open(&db, PAGE).expect("reopen");
        let applied = wal.replay(None, |_, _, _| Ok(())).expect("replay");
        assert_eq!(applied, 0);
    }

    #[test]
    fn abort_discards_the_buffer() {
        let dir = tempdir().expect("tmpdir");
        let db = dir.path().join("db");
        let mut wal = Wal::open(&db, PAGE).expect("open wal");

        wal.begin_tx(3);
        wal.append_frame(3, FrameKind::Page, 0, image(0x55)).expect("frame");
        wal.abort_tx(3);
        assert_eq!(wal.size().expect("size"), WAL_HEADER_SIZE as u64);
    }

    #[test]
    fn empty_commit_writes_no_frames() {
        let dir = tempdir().expect("tmpdir");
        let db = dir.path().join("db");
        let mut wal = Wal::open(&db, PAGE).expect("open wal");

        wal.begin_tx(5);
        wal.commit_tx(5, None).expect("commit");
        assert_eq!(wal.size().expect("size"), WAL_HEADER_SIZE as u64);
        assert_eq!(wal.committed_frame_count(), 0);
    }

    #[test]
    fn torn_trailing_frame_is_ignored() {
        let dir = tempdir().expect("tmpdir");
        let db = dir.path().join("db");

        {
            let mut wal = Wal::open(&db, PAGE).expect("open wal");
            wal.begin_tx(1);
            wal.append_frame(1, FrameKind::Page, 0, image(0x01)).expect("frame");
            wal.commit_tx(1, None).expect("commit");

            // Hand-append a torn frame: header promises more payload than
            // exists on disk.
            let mut header = [0u8; FRAME_HEADER_SIZE];
            header[0..4].copy_from_slice(&2u32.to_le_bytes());
            header[16..20].copy_from_slice(&(PAGE as u32 + 4).to_le_bytes());
            wal.file.seek(SeekFrom::End(0)).expect("seek");
            wal.file.write_all(&header).expect("write torn header");
            wal.file.write_all(&[0u8; 16]).expect("write torn payload");
            wal.file.sync_data().expect("sync");
        }

        let mut wal = Wal::open(&db, PAGE).expect("reopen");
        let applied = wal.replay(None, |_, _, _| Ok(())).expect("replay");
        assert_eq!(applied, 1, "only the committed frame replays");
    }

    #[test]
    fn missing_committed_frames_fail_recovery() {
        let dir = tempdir().expect("tmpdir");
        let db = dir.path().join("db");

        {
            let mut wal = Wal::open(&db, PAGE).expect("open wal");
            wal.begin_tx(1);
            wal.append_frame(1, FrameKind::Page, 0, image(0x01)).expect("frame");
            wal.append_frame(1, FrameKind::Page, 1, image(0x02)).expect("frame");
            wal.commit_tx(1, None).expect("commit");
            // Chop the file inside the committed region.
            let len = wal.size().expect("size");
            wal.file.set_len(len - 10).expect("truncate");
        }

        let mut wal = Wal::open(&db, PAGE).expect("reopen");
        match wal.replay(None, |_, _, _| Ok(())) {
            Err(GaldrError::RecoveryFailed { .. }) => {}
            other => panic!("expected RecoveryFailed, got {other:?}"),
        }
    }

    #[test]
    fn reset_truncates_and_renews_salts() {
        let dir = tempdir().expect("tmpdir");
        let db = dir.path().join("db");
        let mut wal = Wal::open(&db, PAGE).expect("open wal");

        wal.begin_tx(1);
        wal.append_frame(1, FrameKind::Page, 0, image(9)).expect("frame");
        wal.commit_tx(1, None).expect("commit");
        let old_salt = wal.salt;

        wal.reset().expect("reset");
        assert_eq!(wal.size().expect("size"), WAL_HEADER_SIZE as u64);
        assert_eq!(wal.committed_frame_count(), 0);
        assert_ne!(wal.salt, old_salt);
    }

    #[test]
    fn encrypted_frames_round_trip() {
        let dir = tempdir().expect("tmpdir");
        let db = dir.path().join("db");
        let crypto = PageCrypto::derive("wal secret", &[3u8; 16], 10);
        let mut wal = Wal::open(&db, PAGE).expect("open wal");

        wal.begin_tx(1);
        wal.append_frame(1, FrameKind::Page, 6, image(0xCD)).expect("frame");
        wal.commit_tx(1, Some(&crypto)).expect("commit");

        let mut seen = Vec::new();
        wal.replay(Some(&crypto), |_, page_id, data| {
            seen.push((page_id, data[0]));
            Ok(())
        })
        .expect("replay");
        assert_eq!(seen, vec![(6, 0xCD)]);
    }
}
