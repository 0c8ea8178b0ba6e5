//! Per-peer on-disk backlog: a rotating pair of append/read log files that
//! preserves articles across restarts, bounds on-disk size, and interleaves
//! hand-dropped recovery files.
//!
//! All I/O here is blocking `std::fs`; callers that run inside the async
//! event loop (the Peer task) wrap calls in `tokio::task::spawn_blocking`,
//! the same pattern the teacher uses for article reads off disk.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::article::MessageId;
use crate::error::{Error, Result};
use crate::lockfile::Lockfile;

/// Width (bytes, not counting the trailing `\n`) reserved for the checkpoint
/// header once we've scribbled one. Large enough for a `u64` in decimal.
const CHECKPOINT_HEADER_WIDTH: usize = 20;

pub struct TapeConfig {
    pub backlog_dir: PathBuf,
    pub rotate_period: Duration,
    pub checkpoint_period: Duration,
    /// `backlog-limit`: low-water size the output file is shrunk back to.
    pub low_water: u64,
    /// `backlog-limit` * `backlog-factor`, or `backlog-limit-high` if set.
    pub high_water: u64,
    /// `no-backlog`.
    pub disabled: bool,
}

/// Append-only record of articles that could be neither delivered nor
/// spooled (spec.md §7: "articles are never lost silently").
pub struct DroppedLog {
    file: Mutex<File>,
}

impl DroppedLog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn record(&self, peer: &str, filename: &Path, message_id: &MessageId) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "{peer} {} {}", filename.display(), message_id);
    }
}

struct TapeState {
    input: Option<File>,
    input_path: PathBuf,
    output: File,
    output_path: PathBuf,
    peer_path: PathBuf,
    last_rotated: Instant,
    last_checkpoint: Instant,
    scribbled: bool,
    header_len: usize,
    changed_since_checkpoint: bool,
}

pub struct Tape {
    peer: String,
    cfg: TapeConfig,
    dropped_log: Arc<DroppedLog>,
    state: Mutex<TapeState>,
    /// Held for the tape's lifetime; released on `Drop`.
    _lock: Lockfile,
}

impl Tape {
    pub fn open(cfg: TapeConfig, peer: &str, dropped_log: Arc<DroppedLog>) -> Result<Self> {
        fs::create_dir_all(&cfg.backlog_dir)?;
        // A peer whose lock is held by another live process goes on the
        // blocked-hosts list (spec.md's lock-contention row): the caller
        // retries peer creation on the next offered article rather than
        // silently running without mutual exclusion.
        let lock = Lockfile::acquire(&cfg.backlog_dir, peer)?;

        let input_path = cfg.backlog_dir.join(format!("{peer}.input"));
        let output_path = cfg.backlog_dir.join(format!("{peer}.output"));
        let peer_path = cfg.backlog_dir.join(peer);

        // shell-equivalent of prepareFiles: if no .input exists, adopt the
        // hand-dropped PEER file, else promote .output.
        if !input_path.exists() {
            if peer_path.exists() {
                fs::rename(&peer_path, &input_path)?;
            } else if output_path.exists() {
                fs::rename(&output_path, &input_path)?;
            }
        }

        let input = if input_path.exists() {
            Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&input_path)?,
            )
        } else {
            None
        };

        let output = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&output_path)?;

        Ok(Self {
            peer: peer.to_string(),
            cfg,
            dropped_log,
            state: Mutex::new(TapeState {
                input,
                input_path,
                output,
                output_path,
                peer_path,
                last_rotated: Instant::now(),
                last_checkpoint: Instant::now(),
                scribbled: false,
                header_len: 0,
                changed_since_checkpoint: false,
            }),
            _lock: lock,
        })
    }

    /// Appends one `(filename, message-id)` pair, or—if the backlog feature
    /// is disabled—routes it straight to the dropped-article log.
    pub fn append(&self, filename: &Path, message_id: &MessageId) -> Result<()> {
        if self.cfg.disabled {
            self.dropped_log.record(&self.peer, filename, message_id);
            return Ok(());
        }

        let mut st = self.state.lock();
        writeln!(st.output, "{} {}", filename.display(), message_id).map_err(|e| Error::Tape {
            peer: self.peer.clone(),
            source: e,
        })?;
        st.output.flush()?;

        let len = st.output.metadata()?.len();
        if len > self.cfg.high_water {
            self.shrink_output_locked(&mut st)?;
        }
        Ok(())
    }

    /// Discards a prefix of the output file at line boundaries so its
    /// remaining length is at most `low_water`; the discarded bytes are
    /// lost and the caller should log them (spec.md §7 "Spool-full").
    fn shrink_output_locked(&self, st: &mut TapeState) -> Result<usize> {
        let mut contents = Vec::new();
        {
            let mut f = File::open(&st.output_path)?;
            f.read_to_end(&mut contents)?;
        }
        let target_len = self.cfg.low_water as usize;
        let excess = contents.len().saturating_sub(target_len);
        if excess == 0 {
            return Ok(0);
        }
        // advance to the next newline at or after `excess` so we only drop
        // whole lines.
        let cut = contents[excess..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| excess + p + 1)
            .unwrap_or(contents.len());

        let kept = &contents[cut..];
        let mut new_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&st.output_path)?;
        new_file.write_all(kept)?;
        new_file.flush()?;
        st.output = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&st.output_path)?;

        tracing::warn!(peer = %self.peer, discarded_bytes = cut, "backlog exceeded high-water mark, discarding oldest lines");
        Ok(cut)
    }

    /// Reads the next `(filename, message-id)` line from the input file, if
    /// one is open and not yet at EOF. A first line matching `^[0-9 ]+$` is
    /// treated as a checkpoint offset and consumed transparently.
    pub fn read_next(&self) -> Result<Option<(PathBuf, MessageId)>> {
        let mut st = self.state.lock();
        if st.input.is_none() {
            return Ok(None);
        }

        loop {
            let input = st.input.as_mut().unwrap();
            let pos_before = input.stream_position()?;
            let mut reader = PeekReader::new(input);
            let mut line = String::new();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                return Ok(None); // EOF
            }
            let trimmed = line.trim_end_matches(['\n', '\r']);

            if pos_before == 0 && is_checkpoint_header(trimmed) {
                st.scribbled = true;
                st.header_len = trimmed.len();
                if let Some(offset) = trimmed.trim().parse::<u64>().ok().filter(|_| {
                    !trimmed.trim().is_empty()
                }) {
                    st.input.as_mut().unwrap().seek(SeekFrom::Start(offset))?;
                }
                continue;
            }

            let mut parts = trimmed.splitn(2, ' ');
            let filename = parts.next().unwrap_or_default();
            let msgid = parts.next().unwrap_or_default();
            if filename.is_empty() || msgid.is_empty() {
                continue; // blank/scribbled line, keep scanning
            }
            st.changed_since_checkpoint = true;
            let message_id = MessageId::parse(msgid)?;
            return Ok(Some((PathBuf::from(filename), message_id)));
        }
    }

    /// Writes the current input read offset into the reserved checkpoint
    /// header at the start of the input file, so a subsequent process
    /// resumes near that point. A no-op if nothing has been read since the
    /// last checkpoint, or if no input file is open.
    pub fn checkpoint(&self) -> Result<()> {
        let mut st = self.state.lock();
        if !st.changed_since_checkpoint {
            return Ok(());
        }
        if st.input.is_none() {
            return Ok(());
        }
        let tellpos = st.input.as_mut().unwrap().stream_position()?;

        if !st.scribbled {
            // Scan for a newline at or past our reserved width, then blank
            // everything before it with spaces so we have room to scribble
            // a decimal offset in-place on every future checkpoint.
            let input = st.input.as_mut().unwrap();
            input.seek(SeekFrom::Start(0))?;
            let mut reader = BufReader::new(&mut *input);
            let mut scanned = 0usize;
            loop {
                let mut byte = [0u8; 1];
                if reader.read(&mut byte)? == 0 {
                    return Ok(()); // file too short to scribble into yet
                }
                scanned += 1;
                if byte[0] == b'\n' && scanned > CHECKPOINT_HEADER_WIDTH {
                    break;
                }
            }
            let header_len = scanned - 1; // exclude the newline itself
            let input = st.input.as_mut().unwrap();
            input.seek(SeekFrom::Start(0))?;
            input.write_all(&vec![b' '; header_len])?;
            input.flush()?;
            st.scribbled = true;
            st.header_len = header_len;
        }

        let offset_str = tellpos.to_string();
        if offset_str.len() <= st.header_len {
            let mut header = vec![b' '; st.header_len];
            header[..offset_str.len()].copy_from_slice(offset_str.as_bytes());
            let input = st.input.as_mut().unwrap();
            input.seek(SeekFrom::Start(0))?;
            input.write_all(&header)?;
            input.seek(SeekFrom::Start(tellpos))?;
            input.flush()?;
        }
        st.changed_since_checkpoint = false;
        Ok(())
    }

    /// Rotates `PEER.output` to `PEER.input` if the current input is
    /// exhausted (or absent) and at least `rotate_period` has elapsed since
    /// the last rotation. Also merges in a hand-dropped `PEER` file that
    /// appeared since startup. Returns whether a rotation occurred.
    pub fn maybe_rotate(&self) -> Result<bool> {
        let mut st = self.state.lock();

        let input_exhausted = match &mut st.input {
            None => true,
            Some(f) => {
                let pos = f.stream_position()?;
                let len = f.metadata()?.len();
                pos >= len
            }
        };
        if !input_exhausted {
            return Ok(false);
        }
        if st.last_rotated.elapsed() < self.cfg.rotate_period {
            return Ok(false);
        }

        st.input = None;
        let _ = fs::remove_file(&st.input_path);

        if st.peer_path.exists() {
            fs::rename(&st.peer_path, &st.input_path)?;
        } else {
            let out_has_data = fs::metadata(&st.output_path).map(|m| m.len() > 0).unwrap_or(false);
            if !out_has_data {
                st.last_rotated = Instant::now();
                return Ok(false);
            }
            fs::rename(&st.output_path, &st.input_path)?;
        }

        st.input = Some(
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&st.input_path)?,
        );
        st.output = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&st.output_path)?;
        st.scribbled = false;
        st.header_len = 0;
        st.last_rotated = Instant::now();
        Ok(true)
    }

    pub fn should_checkpoint(&self) -> bool {
        self.state.lock().last_checkpoint.elapsed() >= self.cfg.checkpoint_period
    }

    pub fn mark_checkpointed(&self) {
        self.state.lock().last_checkpoint = Instant::now();
    }

    pub fn peer_name(&self) -> &str {
        &self.peer
    }
}

/// Thin shim so `BufReader::read_line` can be used on a `&mut File` for a
/// single line without constructing (and losing the position of) a
/// persistent buffered reader across calls.
struct PeekReader<'a> {
    inner: BufReader<&'a mut File>,
}

impl<'a> PeekReader<'a> {
    fn new(file: &'a mut File) -> Self {
        Self {
            inner: BufReader::new(file),
        }
    }

    fn read_line(&mut self, buf: &mut String) -> std::io::Result<usize> {
        let n = self.inner.read_line(buf)?;
        // Rewind the underlying file past whatever BufReader over-read into
        // its internal buffer, so the file position reflects exactly the
        // line we returned.
        let buffered = self.inner.buffer().len() as i64;
        self.inner.get_mut().seek(SeekFrom::Current(-buffered))?;
        Ok(n)
    }
}

fn is_checkpoint_header(line: &str) -> bool {
    !line.is_empty() && line.chars().all(|c| c.is_ascii_digit() || c == ' ')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dropped_log(dir: &Path) -> Arc<DroppedLog> {
        Arc::new(DroppedLog::open(&dir.join("dropped.log")).unwrap())
    }

    #[test]
    fn append_and_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TapeConfig {
            backlog_dir: dir.path().to_path_buf(),
            rotate_period: Duration::from_secs(60),
            checkpoint_period: Duration::from_secs(30),
            low_water: 1 << 20,
            high_water: 2 << 20,
            disabled: false,
        };
        let tape = Tape::open(cfg, "peerX", dropped_log(dir.path())).unwrap();
        let id = MessageId::parse("<a@b>").unwrap();
        tape.append(Path::new("art1"), &id).unwrap();

        // promote what we just wrote into .input by forcing rotation: since
        // there's no .input yet, append went straight to .output, and
        // maybe_rotate() with input absent is "exhausted", so it rotates
        // once the period has elapsed. Directly construct a fresh Tape to
        // pick it up after a manual rename for this unit test.
        drop(tape);
        fs::rename(dir.path().join("peerX.output"), dir.path().join("peerX.input")).unwrap();
        let tape2 = Tape::open(
            TapeConfig {
                backlog_dir: dir.path().to_path_buf(),
                rotate_period: Duration::from_secs(60),
                checkpoint_period: Duration::from_secs(30),
                low_water: 1 << 20,
                high_water: 2 << 20,
                disabled: false,
            },
            "peerX",
            dropped_log(dir.path()),
        )
        .unwrap();
        let (filename, msgid) = tape2.read_next().unwrap().unwrap();
        assert_eq!(filename, Path::new("art1"));
        assert_eq!(msgid.as_str(), "<a@b>");
    }

    #[test]
    fn disabled_tape_routes_to_dropped_log() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TapeConfig {
            backlog_dir: dir.path().to_path_buf(),
            rotate_period: Duration::from_secs(60),
            checkpoint_period: Duration::from_secs(30),
            low_water: 1 << 20,
            high_water: 2 << 20,
            disabled: true,
        };
        let tape = Tape::open(cfg, "peerY", dropped_log(dir.path())).unwrap();
        let id = MessageId::parse("<a@b>").unwrap();
        tape.append(Path::new("art1"), &id).unwrap();
        let contents = fs::read_to_string(dir.path().join("dropped.log")).unwrap();
        assert!(contents.contains("peerY"));
        assert!(contents.contains("<a@b>"));
    }
}
