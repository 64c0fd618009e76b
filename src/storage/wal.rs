//! Write-ahead log collaborators
//!
//! Workers append every item of a drained batch to its vnode's log, then
//! flush each touched vnode once before any handler runs.
//!
//! Record layout written by [`FileWal`] (little endian):
//!
//! ```text
//! | len: u32 | msg_type: u16 | checksum: u32 | payload: len bytes |
//! ```
//!
//! `checksum` is the first four bytes of the payload's blake3 hash.

use crate::core::types::{MsgType, VnodeId};
use crate::vnode::VnodeHandle;
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Size of a record header in bytes
pub const RECORD_HEADER_SIZE: usize = 4 + 2 + 4;

/// Durability log used by write workers
pub trait WriteAheadLog: Send + Sync + 'static {
    /// Append one record to the vnode's log
    fn append(&self, vnode: &VnodeHandle, msg_type: MsgType, payload: &[u8]) -> io::Result<()>;

    /// Make every record appended so far durable
    fn flush(&self, vnode: &VnodeHandle) -> io::Result<()>;
}

/// Something a [`MemoryWal`] observed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalEvent {
    /// A record was appended
    Append {
        /// Target vnode
        vnode: VnodeId,
        /// Record type
        msg_type: MsgType,
        /// Record payload
        payload: Bytes,
    },
    /// A vnode's log was flushed
    Flush {
        /// Flushed vnode
        vnode: VnodeId,
    },
}

/// In-memory log that records every call. Failures can be injected per vnode.
#[derive(Default)]
pub struct MemoryWal {
    events: Mutex<Vec<WalEvent>>,
    failing_appends: Mutex<HashSet<VnodeId>>,
    failing_flushes: Mutex<HashSet<VnodeId>>,
}

impl MemoryWal {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every append for `vnode` fail from now on
    pub fn fail_appends(&self, vnode: VnodeId) {
        self.failing_appends.lock().insert(vnode);
    }

    /// Make every flush for `vnode` fail from now on
    pub fn fail_flushes(&self, vnode: VnodeId) {
        self.failing_flushes.lock().insert(vnode);
    }

    /// Snapshot of all events so far
    pub fn events(&self) -> Vec<WalEvent> {
        self.events.lock().clone()
    }

    /// Payloads appended for `vnode`, in log order
    pub fn payloads(&self, vnode: VnodeId) -> Vec<Bytes> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                WalEvent::Append { vnode: v, payload, .. } if *v == vnode => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }
}

impl WriteAheadLog for MemoryWal {
    fn append(&self, vnode: &VnodeHandle, msg_type: MsgType, payload: &[u8]) -> io::Result<()> {
        let id = vnode.id();
        if self.failing_appends.lock().contains(&id) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected append failure"));
        }
        self.events.lock().push(WalEvent::Append {
            vnode: id,
            msg_type,
            payload: Bytes::copy_from_slice(payload),
        });
        Ok(())
    }

    fn flush(&self, vnode: &VnodeHandle) -> io::Result<()> {
        let id = vnode.id();
        if self.failing_flushes.lock().contains(&id) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected flush failure"));
        }
        self.events.lock().push(WalEvent::Flush { vnode: id });
        Ok(())
    }
}

/// Size of the write buffer in front of each vnode log file
const LOG_BUFFER_SIZE: usize = 8 * 1024;

/// File operations a vnode log needs beyond [`Write`]
pub(crate) trait LogFile: Write + Send + 'static {
    /// Make written bytes durable
    fn sync(&mut self) -> io::Result<()>;

    /// Cut the file back to `len` bytes
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// One vnode's log file.
///
/// `synced` is the length of the file as of the last successful flush. Any
/// failed append or flush poisons the log; the next flush discards buffered
/// bytes, truncates the file back to `synced` and reports the failure, so a
/// record is either wholly present after a successful flush or absent.
pub(crate) struct VnodeLog<F: LogFile> {
    writer: Option<BufWriter<F>>,
    capacity: usize,
    fsync: bool,
    synced: u64,
    written: u64,
    poisoned: bool,
}

impl<F: LogFile> VnodeLog<F> {
    pub(crate) fn new(file: F, len: u64, fsync: bool, capacity: usize) -> Self {
        Self {
            writer: Some(BufWriter::with_capacity(capacity, file)),
            capacity,
            fsync,
            synced: len,
            written: len,
            poisoned: false,
        }
    }

    pub(crate) fn append(&mut self, msg_type: MsgType, payload: &[u8]) -> io::Result<()> {
        if self.poisoned {
            return Err(poisoned());
        }
        let record = encode_record(msg_type, payload)?;
        let writer = self.writer.as_mut().ok_or_else(poisoned)?;
        match writer.write_all(&record) {
            Ok(()) => {
                self.written += record.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        if self.poisoned {
            self.discard()?;
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "unsynced records discarded after a failed append",
            ));
        }
        let fsync = self.fsync;
        let result = self.writer.as_mut().ok_or_else(poisoned).and_then(|writer| {
            writer.flush()?;
            if fsync {
                writer.get_mut().sync()?;
            }
            Ok(())
        });
        match result {
            Ok(()) => {
                self.synced = self.written;
                Ok(())
            }
            Err(e) => {
                self.poisoned = true;
                // The flush error is what the caller needs; a failed discard
                // leaves the log poisoned and is retried on the next flush.
                let _ = self.discard();
                Err(e)
            }
        }
    }

    /// Drop buffered bytes and truncate the file back to the last sync
    fn discard(&mut self) -> io::Result<()> {
        let writer = self.writer.take().ok_or_else(poisoned)?;
        let (mut file, _unwritten) = writer.into_parts();
        let truncated = file.truncate(self.synced);
        self.writer = Some(BufWriter::with_capacity(self.capacity, file));
        truncated?;
        self.written = self.synced;
        self.poisoned = false;
        Ok(())
    }
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "vnode log is awaiting rollback of a failed write")
}

fn encode_record(msg_type: MsgType, payload: &[u8]) -> io::Result<BytesMut> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record larger than 4 GiB"))?;
    let mut record = BytesMut::with_capacity(RECORD_HEADER_SIZE + payload.len());
    record.put_u32_le(len);
    record.put_u16_le(msg_type.0);
    record.put_u32_le(checksum(payload));
    record.put_slice(payload);
    Ok(record)
}

/// Append-only log file per vnode under a data directory
pub struct FileWal {
    root: PathBuf,
    fsync: bool,
    logs: DashMap<VnodeId, Arc<Mutex<VnodeLog<File>>>>,
}

impl FileWal {
    /// Open a file log rooted at `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>, fsync: bool) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!(dir = %root.display(), fsync, "file WAL opened");
        Ok(Self {
            root,
            fsync,
            logs: DashMap::new(),
        })
    }

    /// Path of the log file for `vnode`
    pub fn log_path(&self, vnode: VnodeId) -> PathBuf {
        self.root.join(format!("vnode{}", vnode.0)).join("wal.log")
    }

    fn log(&self, vnode: VnodeId) -> io::Result<Arc<Mutex<VnodeLog<File>>>> {
        if let Some(log) = self.logs.get(&vnode) {
            return Ok(Arc::clone(log.value()));
        }
        let path = self.log_path(vnode);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        debug!(vnode = %vnode, path = %path.display(), len, "opened vnode log");
        // Another worker may have raced us here; keep whichever landed first.
        let log = self
            .logs
            .entry(vnode)
            .or_insert_with(|| Arc::new(Mutex::new(VnodeLog::new(file, len, self.fsync, LOG_BUFFER_SIZE))));
        Ok(Arc::clone(log.value()))
    }
}

impl WriteAheadLog for FileWal {
    fn append(&self, vnode: &VnodeHandle, msg_type: MsgType, payload: &[u8]) -> io::Result<()> {
        self.log(vnode.id())?.lock().append(msg_type, payload)
    }

    fn flush(&self, vnode: &VnodeHandle) -> io::Result<()> {
        let result = self.log(vnode.id())?.lock().flush();
        if let Err(e) = &result {
            warn!(vnode = %vnode.id(), error = %e, "vnode log rolled back to last sync");
        }
        result
    }
}

fn checksum(payload: &[u8]) -> u32 {
    let hash = blake3::hash(payload);
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Read back every record of a log file written by [`FileWal`]
pub fn read_records(path: &Path) -> io::Result<Vec<(MsgType, Vec<u8>)>> {
    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;
    decode_records(&raw)
}

/// Decode a buffer of concatenated log records
pub fn decode_records(raw: &[u8]) -> io::Result<Vec<(MsgType, Vec<u8>)>> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < raw.len() {
        let header = raw
            .get(offset..offset + RECORD_HEADER_SIZE)
            .ok_or_else(|| corrupt(offset, "truncated header"))?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let msg_type = MsgType(u16::from_le_bytes([header[4], header[5]]));
        let expected = u32::from_le_bytes([header[6], header[7], header[8], header[9]]);

        let start = offset + RECORD_HEADER_SIZE;
        let payload = raw
            .get(start..start + len)
            .ok_or_else(|| corrupt(offset, "truncated payload"))?;
        if checksum(payload) != expected {
            return Err(corrupt(offset, "checksum mismatch"));
        }
        records.push((msg_type, payload.to_vec()));
        offset = start + len;
    }
    Ok(records)
}

fn corrupt(offset: usize, what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("corrupt WAL record at offset {offset}: {what}"),
    )
}
