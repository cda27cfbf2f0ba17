use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frame a single event as `[u32 len][bincode][u32 crc32]`. Returns the frame size.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(payload.len() as u64 + 8)
}

/// Frames larger than this are treated as corruption.
const MAX_FRAME_BYTES: usize = 1 << 20;

/// Read the next frame and its size on disk. `Ok(None)` means clean EOF or an unusable tail.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    for buf in [&mut payload[..], &mut crc_buf[..]] {
        match reader.read_exact(buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, (len + 8) as u64)))
}

/// Append-only ledger log.
///
/// A torn or corrupt trailing frame (crash mid-write) ends replay; everything
/// before it is kept.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length once everything buffered is flushed.
    len: u64,
    appends_since_compact: u64,
}

/// A point in the log that [`Wal::rollback`] can return to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalMark {
    len: u64,
    appends: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            len,
            appends_since_compact: 0,
        })
    }

    /// Open after a replay of `replayed` events, counting them toward the
    /// next compaction.
    pub fn resume(path: &Path, replayed: u64) -> io::Result<Self> {
        let mut wal = Self::open(path)?;
        wal.appends_since_compact = replayed;
        Ok(wal)
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event; durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.len += write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn mark(&self) -> WalMark {
        WalMark {
            len: self.len,
            appends: self.appends_since_compact,
        }
    }

    /// Drop everything written or buffered after `mark`, on disk too.
    pub fn rollback(&mut self, mark: WalMark) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let old = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // Unflushed bytes are discarded, not written.
        let _ = old.into_parts();
        let file = self.writer.get_ref();
        file.set_len(mark.len)?;
        file.sync_all()?;
        self.len = mark.len;
        self.appends_since_compact = mark.appends;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Rewrite the log as exactly `events`: write a temp file, fsync, rename over.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        let mut written = 0;
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                written += write_frame(&mut tmp, event)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        self.writer.flush()?;
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.len = written;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// All intact events on disk, oldest first. A missing file replays as empty.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut consumed = 0u64;
        while let Some((event, size)) = read_frame(&mut reader)? {
            events.push(event);
            consumed += size;
        }
        if consumed < total {
            tracing::warn!(
                path = %path.display(),
                kept = events.len(),
                discarded_bytes = total - consumed,
                "WAL tail discarded"
            );
        }
        Ok(events)
    }
}
