use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frames larger than this are treated as corruption rather than allocated.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Length prefix plus trailing CRC.
const FRAME_OVERHEAD: u64 = 8;

fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Fill `buf` completely, or report a clean/torn end of file as `None`.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<Option<()>> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(Some(())),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Sequential decoder over a WAL byte stream. Yields events until the
/// first truncated or corrupt frame, then stops for good.
pub struct WalReader<R> {
    reader: R,
    valid_len: u64,
    done: bool,
}

impl<R: Read> WalReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            valid_len: 0,
            done: false,
        }
    }

    /// Byte offset just past the last intact frame read so far.
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    fn next_frame(&mut self) -> io::Result<Option<Event>> {
        let mut len_buf = [0u8; 4];
        if read_full(&mut self.reader, &mut len_buf)?.is_none() {
            return Ok(None);
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Ok(None);
        }

        let mut payload = vec![0u8; len];
        if read_full(&mut self.reader, &mut payload)?.is_none() {
            return Ok(None);
        }
        let mut crc_buf = [0u8; 4];
        if read_full(&mut self.reader, &mut crc_buf)?.is_none() {
            return Ok(None);
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            return Ok(None);
        }

        let Ok(event) = bincode::deserialize::<Event>(&payload) else {
            return Ok(None);
        };
        self.valid_len += FRAME_OVERHEAD + len as u64;
        Ok(Some(event))
    }
}

impl<R: Read> Iterator for WalReader<R> {
    type Item = io::Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_frame() {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Append-only write-ahead log of storage events.
///
/// Each entry is `[u32 LE: len][bincode: Event][u32 LE: crc32 of payload]`.
/// Appends are buffered and made durable in batches by `flush_sync`.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted log next to the live one and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the live log and reopen for append.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every intact event. A torn or corrupt tail is cut off the file
    /// so later appends are not stranded behind it.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();

        let mut reader = WalReader::new(BufReader::new(file));
        let events = reader.by_ref().collect::<io::Result<Vec<_>>>()?;

        if reader.valid_len() < file_len {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(reader.valid_len())?;
            file.sync_all()?;
        }
        Ok(events)
    }
}
