//! Tail a binlog, but be smart enough to stop tailing when MySQL is done
//! writing to that file. The stop condition is EOF *and* the next file has
//! appeared; plain EOF just means MySQL has not flushed more yet.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use oxherd_errors::{OxherdError, OxherdResult};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, SeekFrom};
use tokio::time::Instant;
use tracing::{debug, info};

/// Size of the magic header at the start of every binlog file.
pub const BINLOG_HEADER_SIZE: u64 = 4;
/// Offset of the event-length field inside an event header.
const EVENT_LEN_OFFSET: u64 = 9;

/// A rotation-aware binlog byte streamer.
pub struct BinlogReader {
    /// Common path prefix of the log files; files are `<prefix>.NNNNNN`.
    binlog_prefix: PathBuf,
    pub block_size: u64,
    /// How long to sleep when the current file has no new bytes.
    pub log_wait_timeout: Duration,
    /// Give up when stuck at the same offset for this long.
    pub max_wait_timeout: Duration,
}

/// An open serving session: the current file, where the next one will
/// appear, and how many replayed preamble bytes were emitted.
#[derive(Debug)]
pub struct ServeSession {
    file: File,
    next_path: PathBuf,
    /// Bytes of injected `magic + format description` preamble, so
    /// consumers can tell replayed bytes from live bytes.
    pub replayed_prefix: u64,
}

impl BinlogReader {
    pub fn new(binlog_prefix: impl Into<PathBuf>) -> Self {
        BinlogReader {
            binlog_prefix: binlog_prefix.into(),
            block_size: 16 * 1024,
            log_wait_timeout: Duration::from_secs(5),
            max_wait_timeout: Duration::from_secs(3600),
        }
    }

    fn path_for_id(&self, file_id: u64) -> PathBuf {
        let mut name = self
            .binlog_prefix
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(&format!(".{file_id:06}"));
        self.binlog_prefix.with_file_name(name)
    }

    fn file_id(&self, filename: &str) -> OxherdResult<u64> {
        let suffix = filename
            .rsplit('.')
            .next()
            .ok_or_else(|| OxherdError::Parse(format!("bad binlog name {filename:?}")))?;
        suffix
            .parse::<u64>()
            .map_err(|e| OxherdError::Parse(format!("bad binlog name {filename:?}: {e}")))
    }

    async fn open(&self, filename: &str) -> OxherdResult<(File, PathBuf)> {
        let file_id = self.file_id(filename)?;
        let path = self.path_for_id(file_id);
        if !path
            .to_string_lossy()
            .ends_with(filename)
        {
            return Err(OxherdError::Parse(format!(
                "binlog name mismatch: {} vs {filename}",
                path.display()
            )));
        }
        let file = File::open(&path)
            .await
            .map_err(|e| OxherdError::NodeNotFound(format!("{}: {e}", path.display())))?;
        Ok((file, self.path_for_id(file_id + 1)))
    }

    /// Open `filename`, walk to the file containing `start_position`
    /// (subtracting whole files as needed), and replay the binlog magic
    /// plus the format-description event so downstream decoders see a valid
    /// preamble. Returns the session to stream from.
    pub async fn start<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        filename: &str,
        start_position: u64,
    ) -> OxherdResult<ServeSession> {
        let (mut file, mut next_path) = self.open(filename).await?;
        let mut start_position = start_position;
        let mut replayed_prefix = 0;

        if start_position > 0 {
            // The start position can be beyond this file; keep rotating
            // until it lands inside one.
            loop {
                let size = file.seek(SeekFrom::End(0)).await?;
                if start_position <= size {
                    break;
                }
                start_position -= size;
                let next_name = next_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if tokio::fs::metadata(&next_path).await.is_err() {
                    return Err(OxherdError::NodeNotFound(format!(
                        "start position beyond all binlogs at {}",
                        next_path.display()
                    )));
                }
                (file, next_path) = self.open(&next_name).await?;
            }

            // Replay the header and first event to fool the decoder.
            let first_event_size = read_first_event_size(&mut file).await?;
            replayed_prefix = BINLOG_HEADER_SIZE + u64::from(first_event_size);
            info!(replayed_prefix, "injecting binlog preamble");

            file.seek(SeekFrom::Start(0)).await?;
            copy_exact(&mut file, writer, replayed_prefix).await?;
            file.seek(SeekFrom::Start(start_position)).await?;
        }

        Ok(ServeSession {
            file,
            next_path,
            replayed_prefix,
        })
    }

    /// Stream blocks to `writer` until a write fails or the reader is stuck
    /// at EOF past `max_wait_timeout`. Rotates into the next file when it
    /// appears, skipping its magic header.
    pub async fn serve<W: AsyncWrite + Unpin>(
        &self,
        mut session: ServeSession,
        writer: &mut W,
    ) -> OxherdResult<()> {
        let mut buf = vec![0u8; self.block_size as usize];
        let mut position_wait_start: HashMap<u64, Instant> = HashMap::new();

        loop {
            let read = session.file.read(&mut buf).await?;
            if read > 0 {
                writer
                    .write_all(&buf[..read])
                    .await
                    .map_err(|e| OxherdError::Io(format!("subscriber write failed: {e}")))?;
                continue;
            }

            // EOF. Rotate if the next file exists; otherwise wait for more
            // data in this one.
            if tokio::fs::metadata(&session.next_path).await.is_ok() {
                info!(next = %session.next_path.display(), "swapping log file");
                let next_name = session
                    .next_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let (mut file, next_path) = self.open(&next_name).await?;
                file.seek(SeekFrom::Start(BINLOG_HEADER_SIZE)).await?;
                session.file = file;
                session.next_path = next_path;
                position_wait_start.clear();
            } else {
                writer
                    .flush()
                    .await
                    .map_err(|e| OxherdError::Io(format!("subscriber flush failed: {e}")))?;
                let position = session.file.seek(SeekFrom::Current(0)).await?;
                debug!(position, "waiting for more binlog data");
                tokio::time::sleep(self.log_wait_timeout).await;
                let now = Instant::now();
                match position_wait_start.get(&position) {
                    Some(first) => {
                        if now.duration_since(*first) > self.max_wait_timeout {
                            return Err(OxherdError::Timeout {
                                during: format!("binlog stalled at offset {position}"),
                            });
                        }
                    }
                    None => {
                        position_wait_start.insert(position, now);
                    }
                }
            }
        }
    }
}

/// Read the length of the first event (the format description) following
/// the magic header. The file position is left unchanged.
async fn read_first_event_size(file: &mut File) -> OxherdResult<u32> {
    let saved = file.seek(SeekFrom::Current(0)).await?;
    file.seek(SeekFrom::Start(BINLOG_HEADER_SIZE + EVENT_LEN_OFFSET))
        .await?;
    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes)
        .await
        .map_err(|e| OxherdError::Parse(format!("short binlog file: {e}")))?;
    file.seek(SeekFrom::Start(saved)).await?;
    Ok(u32::from_le_bytes(len_bytes))
}

async fn copy_exact<W: AsyncWrite + Unpin>(
    file: &mut File,
    writer: &mut W,
    mut remaining: u64,
) -> OxherdResult<()> {
    let mut buf = [0u8; 4096];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let read = file.read(&mut buf[..want]).await?;
        if read == 0 {
            return Err(OxherdError::Parse("binlog preamble truncated".into()));
        }
        writer
            .write_all(&buf[..read])
            .await
            .map_err(|e| OxherdError::Io(format!("subscriber write failed: {e}")))?;
        remaining -= read as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    /// A tiny synthetic binlog: 4-byte magic, then a fake format
    /// description event whose length field says `fd_len`, then `body`.
    fn binlog_bytes(fd_len: u32, body: &[u8]) -> Vec<u8> {
        let mut data = vec![0xfeu8, b'b', b'i', b'n'];
        let mut event = vec![0u8; fd_len as usize];
        event[EVENT_LEN_OFFSET as usize..EVENT_LEN_OFFSET as usize + 4]
            .copy_from_slice(&fd_len.to_le_bytes());
        data.extend_from_slice(&event);
        data.extend_from_slice(body);
        data
    }

    async fn write_log(dir: &Path, id: u64, contents: &[u8]) {
        tokio::fs::write(dir.join(format!("vt-bin.{id:06}")), contents)
            .await
            .unwrap();
    }

    fn reader(dir: &Path) -> BinlogReader {
        let mut r = BinlogReader::new(dir.join("vt-bin"));
        r.log_wait_timeout = Duration::from_millis(10);
        r.max_wait_timeout = Duration::from_millis(100);
        r.block_size = 8;
        r
    }

    #[tokio::test]
    async fn streams_across_rotation_skipping_the_next_header() {
        let dir = tempfile::tempdir().unwrap();
        let first = binlog_bytes(30, b"AAAA");
        write_log(dir.path(), 7, &first).await;
        let second = binlog_bytes(30, b"BBBB");
        write_log(dir.path(), 8, &second).await;

        let mut out = Vec::new();
        let r = reader(dir.path());
        let session = r.start(&mut out, "vt-bin.000007", 0).await.unwrap();
        assert_eq!(session.replayed_prefix, 0);
        let err = r.serve(session, &mut out).await.unwrap_err();
        assert!(matches!(err, OxherdError::Timeout { .. }), "got {err:?}");

        // All of file 7, then file 8 minus its 4-byte magic header.
        let mut expected = first.clone();
        expected.extend_from_slice(&second[BINLOG_HEADER_SIZE as usize..]);
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn start_offset_walks_into_later_files() {
        let dir = tempfile::tempdir().unwrap();
        let first = binlog_bytes(30, b"AAAA");
        let second = binlog_bytes(30, b"BBBBBB");
        write_log(dir.path(), 1, &first).await;
        write_log(dir.path(), 2, &second).await;

        // Aim at two bytes into the second file's body.
        let offset_in_second = (BINLOG_HEADER_SIZE + 30 + 2) as u64;
        let start = first.len() as u64 + offset_in_second;

        let mut out = Vec::new();
        let r = reader(dir.path());
        let session = r.start(&mut out, "vt-bin.000001", start).await.unwrap();
        assert_eq!(session.replayed_prefix, BINLOG_HEADER_SIZE + 30);
        // The preamble replays the magic + format description of file 2.
        assert_eq!(out, second[..session.replayed_prefix as usize].to_vec());

        let err = r.serve(session, &mut out).await.unwrap_err();
        assert!(matches!(err, OxherdError::Timeout { .. }));
        // After the preamble: the tail from the requested offset.
        assert_eq!(
            &out[(BINLOG_HEADER_SIZE + 30) as usize..],
            &second[offset_in_second as usize..]
        );
    }

    #[tokio::test]
    async fn start_offset_beyond_all_files_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let only = binlog_bytes(30, b"AAAA");
        write_log(dir.path(), 1, &only).await;

        let mut out = Vec::new();
        let r = reader(dir.path());
        let err = r
            .start(&mut out, "vt-bin.000001", only.len() as u64 + 500)
            .await
            .unwrap_err();
        assert!(matches!(err, OxherdError::NodeNotFound(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn missing_first_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        let r = reader(dir.path());
        let err = r.start(&mut out, "vt-bin.000009", 0).await.unwrap_err();
        assert!(matches!(err, OxherdError::NodeNotFound(_)));
    }
}
