//! Append-only region file
//!
//! Layout:
//!
//! ```text
//! "RGN1"
//! repeated record:
//!   kind:  u8   (1 = data)
//!   slot:  u16  little-endian, chunk index inside the region
//!   len:   u32  little-endian, payload length
//!   crc:   u32  little-endian, CRC32 of payload
//!   payload
//! ```
//!
//! The latest record for a slot wins. Opening scans every record. A torn
//! final record (cut short, or failing its checksum with nothing after
//! it) is what an interrupted append leaves behind; it is cut off and the
//! file opens with every record before it. Damage anywhere else halts
//! the open, so a region is never served partially.
//!
//! Superseded records are dead weight. Once they pass `COMPACT_MIN_DEAD`
//! bytes and make up more than half the file, the next write rewrites
//! the file with only live records.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::durability::{fsync_dir, staging_path};
use crate::observability::{log_event_with_fields, Event};

use super::errors::{RegionError, RegionResult};

const MAGIC: &[u8; 4] = b"RGN1";
const RECORD_HEADER_LEN: u64 = 1 + 2 + 4 + 4;
const KIND_DATA: u8 = 1;

/// Dead bytes below this never trigger a compaction.
pub const COMPACT_MIN_DEAD: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: u64,
    len: u32,
    crc: u32,
}

impl Slot {
    fn record_len(&self) -> u64 {
        RECORD_HEADER_LEN + self.len as u64
    }
}

struct Scan {
    index: BTreeMap<u16, Slot>,
    /// End of the last intact record
    valid_end: u64,
    dead: u64,
}

#[derive(Debug)]
pub struct RegionFile {
    path: PathBuf,
    file: File,
    index: BTreeMap<u16, Slot>,
    end: u64,
    /// Bytes held by superseded records
    dead: u64,
}

impl RegionFile {
    /// Opens an existing file, or creates an empty one when `create` is set.
    /// A torn tail is truncated away.
    pub fn open(path: &Path, create: bool) -> RegionResult<Self> {
        let exists = path.exists();
        if !exists && !create {
            return Err(RegionError::io(
                path.display(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "region file missing"),
            ));
        }
        if !exists {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| RegionError::io(parent.display(), e))?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)
            .map_err(|e| RegionError::io(path.display(), e))?;

        let len = file.metadata().map_err(|e| RegionError::io(path.display(), e))?.len();
        if len == 0 {
            file.write_all(MAGIC).map_err(|e| RegionError::io(path.display(), e))?;
            return Ok(Self {
                path: path.to_path_buf(),
                file,
                index: BTreeMap::new(),
                end: MAGIC.len() as u64,
                dead: 0,
            });
        }

        let scan = Self::scan(path, &file, len)?;
        if scan.valid_end < len {
            file.set_len(scan.valid_end)
                .and_then(|_| file.sync_all())
                .map_err(|e| RegionError::io(path.display(), e))?;
            log_event_with_fields(
                Event::RegionTailTruncated,
                &[
                    ("path", &path.display().to_string()),
                    ("valid_end", &scan.valid_end.to_string()),
                    ("dropped", &(len - scan.valid_end).to_string()),
                ],
            );
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
            index: scan.index,
            end: scan.valid_end,
            dead: scan.dead,
        })
    }

    /// Opens an existing file for reading only. A torn tail is ignored
    /// but left on disk.
    pub fn open_read_only(path: &Path) -> RegionResult<Self> {
        let file = File::open(path).map_err(|e| RegionError::io(path.display(), e))?;
        let len = file.metadata().map_err(|e| RegionError::io(path.display(), e))?.len();
        if len == 0 {
            return Ok(Self {
                path: path.to_path_buf(),
                file,
                index: BTreeMap::new(),
                end: 0,
                dead: 0,
            });
        }
        let scan = Self::scan(path, &file, len)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            index: scan.index,
            end: scan.valid_end,
            dead: scan.dead,
        })
    }

    fn corrupt(path: &Path, offset: u64, reason: impl Into<String>) -> RegionError {
        RegionError::Corrupt {
            path: path.display().to_string(),
            offset,
            reason: reason.into(),
        }
    }

    fn scan(path: &Path, file: &File, len: u64) -> RegionResult<Scan> {
        let mut reader = BufReader::new(file);
        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|_| Self::corrupt(path, 0, "truncated header"))?;
        if &magic != MAGIC {
            return Err(Self::corrupt(path, 0, "bad magic"));
        }

        let mut index: BTreeMap<u16, Slot> = BTreeMap::new();
        let mut dead = 0u64;
        let mut offset = MAGIC.len() as u64;
        while offset < len {
            if offset + RECORD_HEADER_LEN > len {
                break;
            }
            let mut header = [0u8; RECORD_HEADER_LEN as usize];
            reader
                .read_exact(&mut header)
                .map_err(|e| RegionError::io(path.display(), e))?;
            let kind = header[0];
            let slot = u16::from_le_bytes([header[1], header[2]]);
            let rec_len = u32::from_le_bytes([header[3], header[4], header[5], header[6]]);
            let crc = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);

            let payload_at = offset + RECORD_HEADER_LEN;
            let record_end = payload_at + rec_len as u64;
            if record_end > len {
                break;
            }
            let mut payload = vec![0u8; rec_len as usize];
            reader
                .read_exact(&mut payload)
                .map_err(|e| RegionError::io(path.display(), e))?;
            if crc32fast::hash(&payload) != crc {
                if record_end == len {
                    break;
                }
                return Err(Self::corrupt(path, offset, "checksum mismatch"));
            }
            if kind != KIND_DATA {
                return Err(Self::corrupt(path, offset, format!("unknown record kind {}", kind)));
            }

            let fresh = Slot {
                offset: payload_at,
                len: rec_len,
                crc,
            };
            if let Some(old) = index.insert(slot, fresh) {
                dead += old.record_len();
            }
            offset = record_end;
        }
        Ok(Scan {
            index,
            valid_end: offset,
            dead,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, slot: u16) -> bool {
        self.index.contains_key(&slot)
    }

    pub fn read(&mut self, slot: u16) -> RegionResult<Option<Vec<u8>>> {
        let Some(entry) = self.index.get(&slot).copied() else {
            return Ok(None);
        };
        self.file
            .seek(SeekFrom::Start(entry.offset))
            .map_err(|e| RegionError::io(self.path.display(), e))?;
        let mut payload = vec![0u8; entry.len as usize];
        self.file
            .read_exact(&mut payload)
            .map_err(|e| RegionError::io(self.path.display(), e))?;
        if crc32fast::hash(&payload) != entry.crc {
            return Err(Self::corrupt(&self.path, entry.offset, "checksum mismatch on read"));
        }
        Ok(Some(payload))
    }

    /// Bytes held by records a later write superseded.
    pub fn dead_bytes(&self) -> u64 {
        self.dead
    }

    /// Current file length.
    pub fn file_len(&self) -> u64 {
        self.end
    }

    pub fn write(&mut self, slot: u16, data: &[u8]) -> RegionResult<()> {
        let crc = crc32fast::hash(data);
        self.append(KIND_DATA, slot, data, crc)?;
        let fresh = Slot {
            offset: self.end - data.len() as u64,
            len: data.len() as u32,
            crc,
        };
        if let Some(old) = self.index.insert(slot, fresh) {
            self.dead += old.record_len();
        }
        if self.needs_compaction() {
            self.compact()?;
        }
        Ok(())
    }

    fn needs_compaction(&self) -> bool {
        self.dead >= COMPACT_MIN_DEAD && self.dead * 2 > self.end
    }

    /// Rewrites the file with only live records and swaps it in place.
    pub fn compact(&mut self) -> RegionResult<()> {
        let before = self.end;
        let entries = self.entries()?;
        let staged = staging_path(&self.path, "compact");
        if let Err(e) = Self::write_compacted(&staged, &entries) {
            let _ = fs::remove_file(&staged);
            return Err(e);
        }
        if let Err(e) = fs::rename(&staged, &self.path) {
            let _ = fs::remove_file(&staged);
            return Err(RegionError::io(self.path.display(), e));
        }
        if let Some(parent) = self.path.parent() {
            fsync_dir(parent).map_err(|e| RegionError::io(parent.display(), e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| RegionError::io(self.path.display(), e))?;
        let len = file.metadata().map_err(|e| RegionError::io(self.path.display(), e))?.len();
        let scan = Self::scan(&self.path, &file, len)?;
        self.file = file;
        self.index = scan.index;
        self.end = scan.valid_end;
        self.dead = scan.dead;

        log_event_with_fields(
            Event::RegionCompacted,
            &[
                ("path", &self.path.display().to_string()),
                ("before", &before.to_string()),
                ("after", &self.end.to_string()),
            ],
        );
        Ok(())
    }

    fn append(&mut self, kind: u8, slot: u16, data: &[u8], crc: u32) -> RegionResult<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| RegionError::Io(format!("payload of {} bytes too large", data.len())))?;
        let mut record = Vec::with_capacity(RECORD_HEADER_LEN as usize + data.len());
        record.push(kind);
        record.extend_from_slice(&slot.to_le_bytes());
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(&crc.to_le_bytes());
        record.extend_from_slice(data);

        self.file
            .seek(SeekFrom::Start(self.end))
            .map_err(|e| RegionError::io(self.path.display(), e))?;
        self.file
            .write_all(&record)
            .map_err(|e| RegionError::io(self.path.display(), e))?;
        self.end += record.len() as u64;
        Ok(())
    }

    /// Live slots with their payloads, in slot order.
    pub fn entries(&mut self) -> RegionResult<Vec<(u16, Vec<u8>)>> {
        let slots: Vec<u16> = self.index.keys().copied().collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(data) = self.read(slot)? {
                out.push((slot, data));
            }
        }
        Ok(out)
    }

    pub fn sync(&mut self) -> RegionResult<()> {
        self.file
            .sync_data()
            .map_err(|e| RegionError::io(self.path.display(), e))
    }

    /// Writes a compact file holding exactly `entries` and fsyncs it.
    pub fn write_compacted(path: &Path, entries: &[(u16, Vec<u8>)]) -> RegionResult<()> {
        let file = File::create(path).map_err(|e| RegionError::io(path.display(), e))?;
        let mut out = BufWriter::new(file);
        out.write_all(MAGIC).map_err(|e| RegionError::io(path.display(), e))?;
        for (slot, data) in entries {
            let len = u32::try_from(data.len())
                .map_err(|_| RegionError::Io(format!("payload of {} bytes too large", data.len())))?;
            out.write_all(&[KIND_DATA])
                .and_then(|_| out.write_all(&slot.to_le_bytes()))
                .and_then(|_| out.write_all(&len.to_le_bytes()))
                .and_then(|_| out.write_all(&crc32fast::hash(data).to_le_bytes()))
                .and_then(|_| out.write_all(data))
                .map_err(|e| RegionError::io(path.display(), e))?;
        }
        let file = out
            .into_inner()
            .map_err(|e| RegionError::io(path.display(), e.into_error()))?;
        file.sync_all().map_err(|e| RegionError::io(path.display(), e))
    }
}
