use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Larger length prefixes are treated as corruption rather than allocated.
const MAX_ENTRY_BYTES: usize = 16 * 1024 * 1024;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Outcome of reading a log from the start.
#[derive(Debug)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte length of the intact prefix.
    pub valid_len: u64,
    /// Why reading stopped before the end of the file, if it did.
    pub discarded: Option<&'static str>,
}

/// Append-only ledger log.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn or corrupt tail ends the replay; [`Wal::recover`] cuts it off before
///   new entries are appended behind it.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Replay the log, truncate anything after the last intact entry, and open it.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replay = Self::read(path)?;
        if let Some(reason) = replay.discarded {
            tracing::warn!(
                "{}: discarding tail after byte {} ({reason})",
                path.display(),
                replay.valid_len
            );
            OpenOptions::new()
                .write(true)
                .open(path)?
                .set_len(replay.valid_len)?;
        }
        Ok((Self::open(path)?, replay.events))
    }

    /// Append and fsync one event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Nothing is durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted log next to the live one and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::compact_tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the live log and reopen it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// All intact events, in order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::read(path)?.events)
    }

    pub fn read(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Replay {
                    events: Vec::new(),
                    valid_len: 0,
                    discarded: None,
                });
            }
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0u64;

        let discarded = loop {
            let mut len_buf = [0u8; 4];
            match read_full(&mut reader, &mut len_buf)? {
                Fill::Full => {}
                Fill::Empty => break None,
                Fill::Partial => break Some("truncated length"),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_ENTRY_BYTES {
                break Some("implausible length");
            }

            let mut payload = vec![0u8; len];
            if !matches!(read_full(&mut reader, &mut payload)?, Fill::Full) {
                break Some("truncated payload");
            }
            let mut crc_buf = [0u8; 4];
            if !matches!(read_full(&mut reader, &mut crc_buf)?, Fill::Full) {
                break Some("truncated checksum");
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break Some("checksum mismatch");
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(_) => break Some("undecodable entry"),
            }
            valid_len += (len + 8) as u64;
        };

        Ok(Replay {
            events,
            valid_len,
            discarded,
        })
    }
}

enum Fill {
    Full,
    Empty,
    Partial,
}

/// Like `read_exact`, but tells a clean end of file apart from a torn entry.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<Fill> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(match filled {
        n if n == buf.len() => Fill::Full,
        0 => Fill::Empty,
        _ => Fill::Partial,
    })
}
