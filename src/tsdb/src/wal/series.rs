use std::io::Cursor;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use regex::Regex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use metricdb_common::error::StoreError;
use metricdb_common::iterator::{AsyncIterator, AsyncIterators};
use serde::{Deserialize, Serialize};

pub(crate) const SERIES_WAL_MAGIC: &'static str = "SWAL";
pub(crate) const SERIES_WAL_VERSION: u8 = 1;
pub(crate) const SERIES_WAL_HEADER_SIZE: u64 = 4 + 1;

/// metric id + tags hash + series id + crc
pub(crate) const SERIES_WAL_ENTRY_SIZE: u64 = 4 + 8 + 4 + 4;

const DEFAULT_MAX_LOG_FILE_SIZE: u64 = 64 << 20;

/// is_valid_log_filename returns true for an 8-digit sequence plus extension.
pub fn is_valid_log_filename(filename: &str) -> bool {
    lazy_static! {
        static ref RE: Regex = Regex::new("^[0-9]{8}\\.wal$").unwrap();
    }

    RE.is_match(filename)
}

fn log_filename(seq: u64) -> String {
    format!("{:08}.wal", seq)
}

fn parse_log_filename(filename: &str) -> anyhow::Result<u64> {
    if !is_valid_log_filename(filename) {
        return Err(anyhow!("invalid series wal filename: {}", filename));
    }
    let seq: u64 = filename[..8].parse()?;
    Ok(seq)
}

/// WalEntry is one durable series allocation record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WalEntry {
    pub metric_id: u32,
    pub tags_hash: u64,
    pub series_id: u32,
}

impl WalEntry {
    pub fn new(metric_id: u32, tags_hash: u64, series_id: u32) -> Self {
        Self {
            metric_id,
            tags_hash,
            series_id,
        }
    }

    pub async fn write_to<W: AsyncWrite + Send + Unpin>(&self, w: &mut W) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(SERIES_WAL_ENTRY_SIZE as usize);
        buf.put_u32(self.metric_id);
        buf.put_u64(self.tags_hash);
        buf.put_u32(self.series_id);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[..]);
        let crc = hasher.finalize();
        buf.put_u32(crc);

        w.write_all(&buf).await?;
        Ok(())
    }

    fn decode(value: &[u8; SERIES_WAL_ENTRY_SIZE as usize]) -> anyhow::Result<Self> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&value[..16]);
        let want = hasher.finalize();

        let mut cursor = Cursor::new(&value[..]);
        let metric_id = cursor.get_u32();
        let tags_hash = cursor.get_u64();
        let series_id = cursor.get_u32();
        let crc = cursor.get_u32();
        if crc != want {
            return Err(anyhow!("series wal entry crc mismatch"));
        }

        Ok(Self {
            metric_id,
            tags_hash,
            series_id,
        })
    }
}

struct SeriesWalHeader {
    version: u8,
}

impl SeriesWalHeader {
    fn new() -> Self {
        Self {
            version: SERIES_WAL_VERSION,
        }
    }

    async fn write_to<W: AsyncWrite + Send + Unpin>(&self, w: &mut W) -> anyhow::Result<()> {
        w.write_all(SERIES_WAL_MAGIC.as_bytes()).await?;
        w.write_u8(self.version).await?;
        Ok(())
    }

    async fn read_from(r: &mut BufReader<File>) -> anyhow::Result<Self> {
        let mut value = [0_u8; SERIES_WAL_HEADER_SIZE as usize];
        r.read_exact(value.as_mut())
            .await
            .map_err(|_| anyhow!("not enough data for series wal header"))?;

        let magic = &value[..SERIES_WAL_MAGIC.len()];
        if magic != SERIES_WAL_MAGIC.as_bytes() {
            return Err(anyhow!("invalid series wal file"));
        }

        Ok(Self {
            version: value[SERIES_WAL_MAGIC.len()],
        })
    }
}

/// RecoveryHandler consumes replayed WAL records.
///
/// `on_record` is invoked once per record in append order; `on_batch_end`
/// once after the last record so a batching handler can flush its tail.
pub trait RecoveryHandler {
    fn on_record(&mut self, metric_id: u32, tags_hash: u64, series_id: u32)
        -> anyhow::Result<()>;

    fn on_batch_end(&mut self) -> anyhow::Result<()>;
}

/// SeriesWal is the append-only log of series allocation events.
#[async_trait]
pub trait SeriesWal: Send + Sync {
    /// append buffers one record. Ordering is guaranteed; durability only
    /// after [`SeriesWal::sync`].
    async fn append(&mut self, metric_id: u32, tags_hash: u64, series_id: u32)
        -> anyhow::Result<()>;

    /// sync flushes buffered records to disk.
    async fn sync(&mut self) -> anyhow::Result<()>;

    /// recovery replays all un-truncated records and truncates the log on
    /// success. On failure the log is left untouched and
    /// [`SeriesWal::need_recovery`] stays true.
    async fn recovery(&mut self, handler: &mut (dyn RecoveryHandler + Send)) -> anyhow::Result<()>;

    /// need_recovery returns true while unreplayed records remain.
    fn need_recovery(&self) -> bool;

    async fn close(&mut self) -> anyhow::Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalOptions {
    pub max_log_file_size: u64,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            max_log_file_size: DEFAULT_MAX_LOG_FILE_SIZE,
        }
    }
}

/// FileSeriesWal stores records in numbered log files under one directory.
///
/// A fresh active file is created per process lifetime; older files are
/// replay-only and removed by truncation after a successful recovery.
pub struct FileSeriesWal {
    dir: PathBuf,
    options: WalOptions,

    active_seq: u64,
    writer: BufWriter<File>,
    write_offset: u64,

    /// records on disk (any file) not yet replayed into the backend
    pending: u64,
    closed: bool,
}

impl FileSeriesWal {
    pub async fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::open_with_options(dir, WalOptions::default()).await
    }

    pub async fn open_with_options(
        dir: impl AsRef<Path>,
        options: WalOptions,
    ) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let files = list_log_files(&dir).await?;
        let mut pending = 0_u64;
        let mut max_seq = 0_u64;
        for (seq, size) in &files {
            pending += size.saturating_sub(SERIES_WAL_HEADER_SIZE) / SERIES_WAL_ENTRY_SIZE;
            max_seq = max_seq.max(*seq);
        }

        let active_seq = max_seq + 1;
        let writer = create_log_file(&dir, active_seq).await?;

        if pending > 0 {
            tracing::info!(
                dir = %dir.display(),
                pending,
                "series wal holds unreplayed records"
            );
        }

        Ok(Self {
            dir,
            options,
            active_seq,
            writer,
            write_offset: SERIES_WAL_HEADER_SIZE,
            pending,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    async fn rotate(&mut self) -> anyhow::Result<()> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_data().await?;

        self.active_seq += 1;
        self.writer = create_log_file(&self.dir, self.active_seq).await?;
        self.write_offset = SERIES_WAL_HEADER_SIZE;
        Ok(())
    }

    /// replay iterates every record currently on disk without truncating.
    pub async fn replay(
        &mut self,
        handler: &mut (dyn RecoveryHandler + Send),
    ) -> anyhow::Result<()> {
        self.writer.flush().await?;

        let files = list_log_files(&self.dir).await?;
        let mut itrs = Vec::with_capacity(files.len());
        for (seq, _size) in files {
            itrs.push(SeriesWalIterator::open(self.dir.join(log_filename(seq))).await?);
        }

        let mut itr = AsyncIterators::new(itrs);
        while let Some((entry, _offset)) = itr.try_next().await? {
            handler.on_record(entry.metric_id, entry.tags_hash, entry.series_id)?;
        }
        handler.on_batch_end()?;
        Ok(())
    }

    async fn truncate(&mut self) -> anyhow::Result<()> {
        let files = list_log_files(&self.dir).await?;
        for (seq, _size) in files {
            tokio::fs::remove_file(self.dir.join(log_filename(seq))).await?;
        }

        self.active_seq += 1;
        self.writer = create_log_file(&self.dir, self.active_seq).await?;
        self.write_offset = SERIES_WAL_HEADER_SIZE;
        self.pending = 0;
        Ok(())
    }

    fn check_open(&self) -> anyhow::Result<()> {
        if self.closed {
            return Err(StoreError::Closed.into());
        }
        Ok(())
    }
}

#[async_trait]
impl SeriesWal for FileSeriesWal {
    async fn append(
        &mut self,
        metric_id: u32,
        tags_hash: u64,
        series_id: u32,
    ) -> anyhow::Result<()> {
        self.check_open()?;

        if self.write_offset + SERIES_WAL_ENTRY_SIZE > self.options.max_log_file_size {
            self.rotate().await?;
        }

        let entry = WalEntry::new(metric_id, tags_hash, series_id);
        entry.write_to(&mut self.writer).await?;
        self.write_offset += SERIES_WAL_ENTRY_SIZE;
        self.pending += 1;
        Ok(())
    }

    async fn sync(&mut self) -> anyhow::Result<()> {
        self.check_open()?;
        self.writer.flush().await?;
        self.writer.get_ref().sync_data().await?;
        Ok(())
    }

    async fn recovery(&mut self, handler: &mut (dyn RecoveryHandler + Send)) -> anyhow::Result<()> {
        self.check_open()?;
        if self.pending == 0 {
            return Ok(());
        }

        self.replay(handler).await?;
        self.truncate().await?;
        Ok(())
    }

    fn need_recovery(&self) -> bool {
        self.pending > 0
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if self.closed {
            return Err(StoreError::Closed.into());
        }
        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await?;
        self.closed = true;
        Ok(())
    }
}

/// list_log_files returns `(sequence, size)` of every log file, in order.
pub async fn list_log_files(dir: &Path) -> anyhow::Result<Vec<(u64, u64)>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_valid_log_filename(&name) {
            continue;
        }
        let seq = parse_log_filename(&name)?;
        let size = entry.metadata().await?.len();
        files.push((seq, size));
    }
    files.sort_unstable();
    Ok(files)
}

async fn create_log_file(dir: &Path, seq: u64) -> anyhow::Result<BufWriter<File>> {
    let path = dir.join(log_filename(seq));
    let file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&path)
        .await?;

    let mut writer = BufWriter::new(file);
    let hdr = SeriesWalHeader::new();
    hdr.write_to(&mut writer).await?;
    writer.flush().await?;
    Ok(writer)
}

/// SeriesWalIterator reads the records of one log file in append order.
pub struct SeriesWalIterator {
    reader: BufReader<File>,
    read_offset: u64,
    remaining: u64,
}

impl SeriesWalIterator {
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let size = tokio::fs::metadata(path).await?.len();
        let file = File::open(path).await?;
        let mut reader = BufReader::new(file);

        let hdr = SeriesWalHeader::read_from(&mut reader).await?;
        if hdr.version != SERIES_WAL_VERSION {
            return Err(anyhow!("unsupported series wal version: {}", hdr.version));
        }

        // a torn tail entry is ignored, it was never acknowledged
        let remaining = size.saturating_sub(SERIES_WAL_HEADER_SIZE) / SERIES_WAL_ENTRY_SIZE;
        Ok(Self {
            reader,
            read_offset: SERIES_WAL_HEADER_SIZE,
            remaining,
        })
    }
}

#[async_trait]
impl AsyncIterator for SeriesWalIterator {
    type Item = (WalEntry, u64);

    async fn try_next(&mut self) -> anyhow::Result<Option<Self::Item>> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let mut value = [0_u8; SERIES_WAL_ENTRY_SIZE as usize];
        self.reader.read_exact(value.as_mut()).await?;

        let entry = WalEntry::decode(&value)?;
        let offset = self.read_offset;
        self.read_offset += SERIES_WAL_ENTRY_SIZE;
        self.remaining -= 1;
        Ok(Some((entry, offset)))
    }
}
