//! Container handles: open, create, frame I/O and close.
//!
//! A [`Container`] is an explicit handle on one container file. It owns the
//! advisory lock for its whole lifetime, the in-memory [`Catalog`] replayed
//! from the file, and (for write handles) a buffered appender positioned at
//! the end of the last valid frame.
//!
//! Opening scans the file once. Catalog and auxiliary frames are decoded in
//! full; row frames contribute only their 12-byte prefix to the row directory
//! and their cells are skipped. Only the final frame is checksum-verified
//! during the scan, to detect a torn tail left by a crash. Readers ignore a
//! torn tail; writers truncate it before appending.
//!
//! `close` flushes, optionally fsyncs, and releases the lock. It is
//! idempotent and also runs from `Drop`, so every exit path releases the lock.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use snafu::prelude::*;

use crate::{
    catalog::{Catalog, CatalogAction, GroupState, RootAttrs},
    config::ArchiveConfig,
    error::{
        ArchiveError, ArchiveResult, CatalogError, ClosedSnafu, CorruptSnafu, IoSnafu,
        NotFoundSnafu, ReadOnlySnafu, ShortFrameSnafu, UndeclaredAuxSnafu, UndecodableActionSnafu,
        UnknownGroupIdSnafu, UnknownGroupSnafu,
    },
    group::GroupPath,
    schema::TableSchema,
    storage::{
        LockMode,
        frame::{
            FrameHeader, FrameKind, FrameRef, HEADER_LEN, MAGIC, ROW_PREFIX_LEN, checksum,
            decode_aux_payload, decode_row_payload, encode_frame, open_frame,
        },
        lock::LockGuard,
    },
};

/// Access mode of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Shared read access.
    Read,
    /// Exclusive append access.
    Write,
}

/// An open container file.
///
/// Obtained from [`Container::open_read`], [`Container::open_write`] or
/// [`Container::create`]. Thread the handle through a sequence of operations
/// to amortize the open cost; drop it (or call [`Container::close`]) to
/// release the lock.
#[derive(Debug)]
pub struct Container {
    path: PathBuf,
    mode: OpenMode,
    config: ArchiveConfig,
    lock: LockGuard,
    reader: Option<File>,
    writer: Option<BufWriter<File>>,
    end_offset: u64,
    pub(crate) catalog: Catalog,
    write_failed: bool,
    closed: bool,
}

struct ScanOutcome {
    catalog: Catalog,
    valid_len: u64,
    torn: bool,
}

impl Container {
    /// Open an existing container for reading.
    ///
    /// Takes a shared lock unless `config.shared_read_lock` is off or the
    /// sidecar cannot be created; in both cases the read proceeds unlocked.
    pub fn open_read(path: impl AsRef<Path>, config: &ArchiveConfig) -> ArchiveResult<Self> {
        let path = path.as_ref().to_path_buf();
        ensure_exists(&path)?;

        let lock = if config.shared_read_lock {
            LockGuard::acquire(
                &path,
                LockMode::Shared,
                config.lock_timeout(),
                config.lock_poll_interval(),
            )?
        } else {
            debug!("shared read lock disabled; reading {} unlocked", path.display());
            LockGuard::unlocked(&path, LockMode::Shared)
        };

        let reader = File::open(&path).context(IoSnafu {
            path: path.display().to_string(),
        })?;
        let scan = scan_container(&path, &reader)?;
        if scan.torn {
            warn!(
                "ignoring torn trailing frame in {} at offset {}",
                path.display(),
                scan.valid_len
            );
        }
        debug!(
            "opened {} for read ({} groups)",
            path.display(),
            scan.catalog.groups.len()
        );

        Ok(Self {
            path,
            mode: OpenMode::Read,
            config: config.clone(),
            lock,
            reader: Some(reader),
            writer: None,
            end_offset: scan.valid_len,
            catalog: scan.catalog,
            write_failed: false,
            closed: false,
        })
    }

    /// Open an existing container for appending. Never creates the file.
    pub fn open_write(path: impl AsRef<Path>, config: &ArchiveConfig) -> ArchiveResult<Self> {
        let path = path.as_ref().to_path_buf();
        ensure_exists(&path)?;
        let lock = LockGuard::acquire(
            &path,
            LockMode::Exclusive,
            config.lock_timeout(),
            config.lock_poll_interval(),
        )?;
        Self::attach_writer(path, config, lock)
    }

    /// Create a container, or open it for writing if it exists.
    ///
    /// With `clear`, an existing file is truncated and every group in it is
    /// discarded. Missing parent directories are created.
    pub fn create(
        path: impl AsRef<Path>,
        clear: bool,
        config: &ArchiveConfig,
    ) -> ArchiveResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context(IoSnafu {
                path: parent.display().to_string(),
            })?;
        }

        // Lock before touching the file so a concurrent writer never sees it
        // truncated underneath it.
        let lock = LockGuard::acquire(
            &path,
            LockMode::Exclusive,
            config.lock_timeout(),
            config.lock_poll_interval(),
        )?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(clear)
            .open(&path)
            .context(IoSnafu {
                path: path.display().to_string(),
            })?;
        if clear {
            info!("cleared container {}", path.display());
        }
        Self::attach_writer(path, config, lock)
    }

    fn attach_writer(
        path: PathBuf,
        config: &ArchiveConfig,
        lock: LockGuard,
    ) -> ArchiveResult<Self> {
        let io_ctx = || IoSnafu {
            path: path.display().to_string(),
        };

        let reader = File::open(&path).context(io_ctx())?;
        let scan = scan_container(&path, &reader)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .context(io_ctx())?;
        if scan.torn {
            warn!(
                "truncating torn trailing frame in {} at offset {}",
                path.display(),
                scan.valid_len
            );
            file.set_len(scan.valid_len).context(io_ctx())?;
        }

        let mut end_offset = scan.valid_len;
        if end_offset == 0 {
            file.write_all(MAGIC).context(io_ctx())?;
            end_offset = MAGIC.len() as u64;
        }
        file.seek(SeekFrom::Start(end_offset)).context(io_ctx())?;

        debug!(
            "opened {} for write ({} groups, {} bytes)",
            path.display(),
            scan.catalog.groups.len(),
            end_offset
        );

        Ok(Self {
            path,
            mode: OpenMode::Write,
            config: config.clone(),
            lock,
            reader: Some(reader),
            writer: Some(BufWriter::new(file)),
            end_offset,
            catalog: scan.catalog,
            write_failed: false,
            closed: false,
        })
    }

    /// Flush buffered frames, fsync if configured, and release the lock.
    ///
    /// Safe to call more than once; later calls are no-ops. The lock is
    /// released even when the flush fails.
    pub fn close(&mut self) -> ArchiveResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut result = Ok(());
        if let Some(mut writer) = self.writer.take() {
            let sync = self.config.sync_on_close;
            result = writer
                .flush()
                .and_then(|()| {
                    if sync {
                        writer.get_ref().sync_all()
                    } else {
                        Ok(())
                    }
                })
                .context(IoSnafu {
                    path: self.path.display().to_string(),
                });
        }
        self.reader = None;
        self.lock.release();
        debug!("closed {}", self.path.display());
        result
    }

    /// Make buffered frames durable without closing or reindexing.
    ///
    /// A no-op on read handles.
    pub fn flush(&mut self) -> ArchiveResult<()> {
        self.ensure_open()?;
        let path = self.path.display().to_string();
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().context(IoSnafu { path: path.clone() })?;
            writer.get_ref().sync_data().context(IoSnafu { path })?;
        }
        Ok(())
    }

    /// Container file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Access mode of this handle.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether this handle holds an OS lock (false in degraded read mode).
    pub fn holds_lock(&self) -> bool {
        self.lock.is_held()
    }

    /// Mode of the lock this handle requested.
    pub fn lock_mode(&self) -> LockMode {
        self.lock.mode()
    }

    /// Configuration this handle was opened with.
    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Root attributes, once the first group has been built.
    pub fn root_attrs(&self) -> Option<&RootAttrs> {
        self.catalog.root.as_ref()
    }

    /// Groups that hold a table, in path order.
    pub fn groups(&self) -> Vec<GroupPath> {
        self.catalog.groups.keys().cloned().collect()
    }

    /// Whether `group` holds a table.
    pub fn has_table(&self, group: &str) -> bool {
        GroupPath::parse(group).is_ok_and(|g| self.catalog.groups.contains_key(&g))
    }

    /// Column layout of a group's table.
    pub fn table_schema(&self, group: &str) -> ArchiveResult<&TableSchema> {
        let path = GroupPath::parse(group)?;
        Ok(&self.group(&path)?.schema)
    }

    /// Auxiliary array names recorded on a group, in declaration order.
    pub fn aux_names(&self, group: &str) -> ArchiveResult<&[String]> {
        let path = GroupPath::parse(group)?;
        Ok(&self.group(&path)?.aux_names)
    }

    /// Number of rows in a group's table.
    pub fn row_count(&self, group: &str) -> ArchiveResult<usize> {
        let path = GroupPath::parse(group)?;
        Ok(self.group(&path)?.rows.len())
    }

    pub(crate) fn ensure_open(&self) -> ArchiveResult<()> {
        ensure!(
            !self.closed,
            ClosedSnafu {
                path: self.path.display().to_string(),
            }
        );
        Ok(())
    }

    pub(crate) fn ensure_writable(&self) -> ArchiveResult<()> {
        self.ensure_open()?;
        ensure!(
            self.mode == OpenMode::Write,
            ReadOnlySnafu {
                path: self.path.display().to_string(),
            }
        );
        if self.write_failed {
            return Err(self.corrupt("an earlier write failed; reopen the container"));
        }
        Ok(())
    }

    pub(crate) fn group(&self, path: &GroupPath) -> ArchiveResult<&GroupState> {
        self.catalog.groups.get(path).context(UnknownGroupSnafu {
            group: path.to_string(),
        })
    }

    pub(crate) fn group_mut(&mut self, path: &GroupPath) -> ArchiveResult<&mut GroupState> {
        self.catalog.groups.get_mut(path).context(UnknownGroupSnafu {
            group: path.to_string(),
        })
    }

    pub(crate) fn corrupt(&self, msg: impl Into<String>) -> ArchiveError {
        CorruptSnafu {
            path: self.path.display().to_string(),
            msg: msg.into(),
        }
        .build()
    }

    /// Validate and apply `action`, then persist it.
    pub(crate) fn commit_action(&mut self, action: CatalogAction) -> ArchiveResult<()> {
        self.ensure_writable()?;
        let json = serde_json::to_vec(&action)
            .map_err(|e| self.corrupt(format!("cannot encode catalog action: {e}")))?;
        self.catalog
            .apply(action)
            .map_err(|e| self.corrupt(e.to_string()))?;
        self.write_frame(FrameKind::Catalog, &json)?;
        Ok(())
    }

    /// Append one frame at the end of the file.
    pub(crate) fn write_frame(
        &mut self,
        kind: FrameKind,
        payload: &[u8],
    ) -> ArchiveResult<FrameRef> {
        self.ensure_writable()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| self.corrupt(format!("frame of {} bytes is too large", payload.len())))?;
        let bytes = encode_frame(kind, payload);
        let path = self.path.display().to_string();
        let Some(writer) = self.writer.as_mut() else {
            return ReadOnlySnafu { path }.fail();
        };
        if let Err(source) = writer.write_all(&bytes) {
            self.write_failed = true;
            return Err(source).context(IoSnafu { path });
        }
        let frame = FrameRef {
            offset: self.end_offset,
            len,
        };
        self.end_offset += bytes.len() as u64;
        Ok(frame)
    }

    /// Read `buf.len()` bytes at `offset`, after flushing buffered writes.
    pub(crate) fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> ArchiveResult<()> {
        self.ensure_open()?;
        let path = self.path.display().to_string();
        if let Some(writer) = self.writer.as_mut().filter(|w| !w.buffer().is_empty()) {
            writer.flush().context(IoSnafu { path: path.clone() })?;
        }
        let Some(reader) = self.reader.as_mut() else {
            return ClosedSnafu { path }.fail();
        };
        reader
            .seek(SeekFrom::Start(offset))
            .and_then(|_| reader.read_exact(buf))
            .context(IoSnafu { path })
    }

    /// Read `[start, end)` of the file.
    pub(crate) fn read_span(&mut self, start: u64, end: u64) -> ArchiveResult<Vec<u8>> {
        let mut buf = vec![0u8; end.saturating_sub(start) as usize];
        self.read_exact_at(start, &mut buf)?;
        Ok(buf)
    }

    /// Read one frame and return its checksum-verified payload.
    pub(crate) fn read_frame(
        &mut self,
        frame: FrameRef,
        kind: FrameKind,
    ) -> ArchiveResult<Vec<u8>> {
        let mut buf = self.read_span(frame.offset, frame.end())?;
        open_frame(&buf, kind)
            .map_err(|e| self.corrupt(format!("{e} at offset {}", frame.offset)))?;
        Ok(buf.split_off(HEADER_LEN))
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error closing {}: {e}", self.path.display());
        }
    }
}

fn ensure_exists(path: &Path) -> ArchiveResult<()> {
    ensure!(
        path.is_file(),
        NotFoundSnafu {
            path: path.display().to_string(),
        }
    );
    Ok(())
}

/// Replay the container from the start, stopping at the first incomplete or
/// checksum-failing trailing frame.
fn scan_container(path: &Path, file: &File) -> ArchiveResult<ScanOutcome> {
    let display = path.display().to_string();
    let io_ctx = || IoSnafu {
        path: display.clone(),
    };
    let corrupt = |msg: String| {
        CorruptSnafu {
            path: display.clone(),
            msg,
        }
        .build()
    };

    let file_len = file.metadata().context(io_ctx())?.len();
    let mut catalog = Catalog::default();
    if file_len < MAGIC.len() as u64 {
        return Ok(ScanOutcome {
            catalog,
            valid_len: 0,
            torn: file_len > 0,
        });
    }

    let mut r = BufReader::new(file);
    r.seek(SeekFrom::Start(0)).context(io_ctx())?;
    let mut magic = [0u8; MAGIC.len()];
    r.read_exact(&mut magic).context(io_ctx())?;
    if &magic != MAGIC {
        return Err(corrupt("not an obsarchive container".to_string()));
    }

    let mut pos = MAGIC.len() as u64;
    let mut torn = false;
    let mut row_frames = 0usize;
    while pos < file_len {
        if file_len - pos < HEADER_LEN as u64 {
            torn = true;
            break;
        }
        let mut head = [0u8; HEADER_LEN];
        r.read_exact(&mut head).context(io_ctx())?;
        let Some(header) = FrameHeader::decode(&head) else {
            torn = true;
            break;
        };
        let frame = FrameRef {
            offset: pos,
            len: header.len,
        };
        if frame.end() > file_len {
            torn = true;
            break;
        }
        let is_last = frame.end() == file_len;
        let kind = FrameKind::try_from(header.kind)
            .map_err(|k| corrupt(format!("unknown frame kind {k} at offset {pos}")))?;

        let read_payload = |r: &mut BufReader<&File>| -> ArchiveResult<Vec<u8>> {
            let mut payload = vec![0u8; header.len as usize];
            r.read_exact(&mut payload).context(io_ctx())?;
            Ok(payload)
        };

        match kind {
            FrameKind::Row if !is_last => {
                if (header.len as usize) < ROW_PREFIX_LEN {
                    return Err(corrupt(format!("short row frame at offset {pos}")));
                }
                let mut prefix = [0u8; ROW_PREFIX_LEN];
                r.read_exact(&mut prefix).context(io_ctx())?;
                r.seek_relative(i64::from(header.len) - ROW_PREFIX_LEN as i64)
                    .context(io_ctx())?;
                let (group_id, time, _) = decode_row_payload(&prefix)
                    .ok_or_else(|| corrupt(format!("short row frame at offset {pos}")))?;
                push_row(&mut catalog, group_id, time, frame)
                    .map_err(|e| corrupt(format!("{e} at offset {pos}")))?;
                row_frames += 1;
            }
            _ => {
                let payload = read_payload(&mut r)?;
                if checksum(header.kind, &payload) != header.crc {
                    if is_last {
                        torn = true;
                        break;
                    }
                    return Err(corrupt(format!("checksum mismatch at offset {pos}")));
                }
                apply_frame(&mut catalog, kind, frame, &payload)
                    .map_err(|e| corrupt(format!("{e} at offset {pos}")))?;
                if kind == FrameKind::Row {
                    row_frames += 1;
                }
            }
        }
        pos = frame.end();
    }

    for group in catalog.groups.values_mut() {
        if group.has_time_index {
            group.index.rebuild_full(&group.rows.times);
        }
    }
    debug!("scanned {display}: {row_frames} rows, {pos} valid bytes");

    Ok(ScanOutcome {
        catalog,
        valid_len: pos,
        torn,
    })
}

fn apply_frame(
    catalog: &mut Catalog,
    kind: FrameKind,
    frame: FrameRef,
    payload: &[u8],
) -> Result<(), CatalogError> {
    match kind {
        FrameKind::Catalog => {
            let action: CatalogAction =
                serde_json::from_slice(payload).context(UndecodableActionSnafu)?;
            catalog.apply(action)
        }
        FrameKind::Row => {
            let (group_id, time, _) =
                decode_row_payload(payload).context(ShortFrameSnafu { kind: "row" })?;
            push_row(catalog, group_id, time, frame)
        }
        FrameKind::Aux => {
            let (group_id, name, _) =
                decode_aux_payload(payload).context(ShortFrameSnafu { kind: "aux" })?;
            let group = catalog
                .group_by_id_mut(group_id)
                .context(UnknownGroupIdSnafu { group_id })?;
            let aux = group.aux.get_mut(&name).context(UndeclaredAuxSnafu {
                group: group.path.to_string(),
                name: name.clone(),
            })?;
            aux.latest = Some(frame);
            Ok(())
        }
    }
}

fn push_row(
    catalog: &mut Catalog,
    group_id: u32,
    time: i64,
    frame: FrameRef,
) -> Result<(), CatalogError> {
    let group = catalog
        .group_by_id_mut(group_id)
        .context(UnknownGroupIdSnafu { group_id })?;
    group.rows.push(time, frame);
    Ok(())
}
