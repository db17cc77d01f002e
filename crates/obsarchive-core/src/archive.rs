//! Handle-per-operation convenience over [`Container`].
//!
//! Each [`Archive`] method opens the container, performs one operation and
//! closes the handle, so the lock is held only for the duration of the call.
//! Producers that append many rows should open a [`Container`] once and
//! thread it through instead.

use std::path::{Path, PathBuf};

use crate::{
    append::{AdmissionPredicate, AppendReport, Observation},
    array::{Array, Values},
    config::ArchiveConfig,
    container::Container,
    dump::ContainerStat,
    error::ArchiveResult,
    query::{SliceRequest, SliceResult},
    schema::GroupSchema,
};

/// A container path plus the configuration used to open it.
#[derive(Debug, Clone)]
pub struct Archive {
    path: PathBuf,
    config: ArchiveConfig,
}

impl Archive {
    /// Archive at `path` with the default configuration.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_config(path, ArchiveConfig::default())
    }

    /// Archive at `path` with an explicit configuration.
    pub fn with_config(path: impl Into<PathBuf>, config: ArchiveConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    /// Container file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configuration used for every open.
    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Whether the container file exists.
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Open a persistent read handle.
    pub fn open_read(&self) -> ArchiveResult<Container> {
        Container::open_read(&self.path, &self.config)
    }

    /// Open a persistent write handle. The container must exist.
    pub fn open_write(&self) -> ArchiveResult<Container> {
        Container::open_write(&self.path, &self.config)
    }

    /// Create the container if needed (truncating it when `clear`) and build
    /// `group` with `schema`.
    pub fn create(&self, group: &str, schema: &GroupSchema, clear: bool) -> ArchiveResult<()> {
        let mut container = Container::create(&self.path, clear, &self.config)?;
        let built = container.build(group, schema);
        finish(container, built)
    }

    /// Append one row; see [`Container::append`].
    pub fn append<P>(
        &self,
        group: &str,
        time: i64,
        values: &Values,
        predicate: &P,
    ) -> ArchiveResult<bool>
    where
        P: AdmissionPredicate + ?Sized,
    {
        self.with_write(|c| c.append(group, time, values, predicate))
    }

    /// Append a batch through one handle; see [`Container::append_batch`].
    pub fn append_batch<I, P>(
        &self,
        group: &str,
        records: I,
        predicate: &P,
    ) -> ArchiveResult<AppendReport>
    where
        I: IntoIterator<Item = Observation>,
        P: AdmissionPredicate + ?Sized,
    {
        self.with_write(|c| c.append_batch(group, records, predicate))
    }

    /// Rewrite an auxiliary array; see [`Container::write_aux`].
    pub fn write_aux(&self, group: &str, name: &str, array: &Array) -> ArchiveResult<()> {
        self.with_write(|c| c.write_aux(group, name, array))
    }

    /// Toggle auto-indexing; see [`Container::set_auto_index`].
    pub fn set_auto_index(&self, group: &str, enabled: bool) -> ArchiveResult<()> {
        self.with_write(|c| c.set_auto_index(group, enabled))
    }

    /// Time-range read; see [`Container::slice`].
    pub fn slice(&self, group: &str, request: &SliceRequest) -> ArchiveResult<SliceResult> {
        self.with_read(|c| c.slice(group, request))
    }

    /// Whole column or auxiliary array; see [`Container::dump`].
    pub fn dump(&self, group: &str, name: &str) -> ArchiveResult<Array> {
        self.with_read(|c| c.dump(group, name))
    }

    /// Time column in append order.
    pub fn dump_time(&self, group: &str) -> ArchiveResult<Vec<i64>> {
        self.with_read(|c| c.dump_time(group))
    }

    /// End of the table as used by duration-relative slices.
    pub fn end_time(&self, group: &str) -> ArchiveResult<Option<i64>> {
        self.with_read(|c| c.end_time(group))
    }

    /// Container summary.
    pub fn stat(&self) -> ArchiveResult<ContainerStat> {
        self.with_read(|c| c.stat())
    }

    fn with_write<T>(
        &self,
        op: impl FnOnce(&mut Container) -> ArchiveResult<T>,
    ) -> ArchiveResult<T> {
        let mut container = self.open_write()?;
        let out = op(&mut container);
        finish(container, out)
    }

    fn with_read<T>(
        &self,
        op: impl FnOnce(&mut Container) -> ArchiveResult<T>,
    ) -> ArchiveResult<T> {
        let mut container = self.open_read()?;
        let out = op(&mut container);
        finish(container, out)
    }
}

/// Close `container`; the operation's error wins over a close error.
fn finish<T>(mut container: Container, out: ArchiveResult<T>) -> ArchiveResult<T> {
    let closed = container.close();
    let value = out?;
    closed?;
    Ok(value)
}
