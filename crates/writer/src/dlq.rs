use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One rotated dead-letter segment file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqSegment {
    /// Path to the segment file.
    pub path: PathBuf,
    /// Monotonically increasing segment index; higher is newer.
    pub index: u64,
}

struct CurrentSegment {
    index: u64,
    file: File,
    size_bytes: u64,
}

/// Append-only, rotating dead-letter queue for batches that exhausted
/// retries against the active write target. Each entry is one failed
/// batch, framed as a 4-byte little-endian length prefix followed by that
/// many bytes of target-encoded payload — the writer stores whatever bytes
/// the target would otherwise have sent, so a re-drain replays them
/// unchanged rather than re-deriving a wire format from `Reading`s.
///
/// The mutex is held only for the duration of one synchronous append or
/// rotation; callers invoke [`DeadLetterQueue::append`] from a blocking
/// context (`tokio::task::spawn_blocking`), per the concurrency model's
/// rule that file I/O never runs on an async task thread.
pub struct DeadLetterQueue {
    directory: PathBuf,
    segment_size_bytes: u64,
    max_segments: usize,
    current: Mutex<Option<CurrentSegment>>,
}

impl DeadLetterQueue {
    /// Opens (creating if absent) the dead-letter directory.
    pub fn open(directory: impl Into<PathBuf>, segment_size_bytes: u64, max_segments: usize) -> io::Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            segment_size_bytes,
            max_segments,
            current: Mutex::new(None),
        })
    }

    /// Appends one framed payload, rotating to a new segment if doing so
    /// would exceed `segment_size_bytes`, and dropping the oldest segment
    /// once more than `max_segments` exist.
    pub fn append(&self, payload: &[u8]) -> io::Result<()> {
        let framed_len = payload.len() as u64 + 4;
        let mut guard = self.current.lock().expect("dlq mutex poisoned");

        let needs_rotation = match guard.as_ref() {
            Some(segment) => segment.size_bytes + framed_len > self.segment_size_bytes,
            None => true,
        };
        if needs_rotation {
            *guard = Some(self.open_next_segment(guard.as_ref().map(|s| s.index))?);
            self.enforce_retention()?;
        }

        let segment = guard.as_mut().expect("segment opened above");
        segment.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        segment.file.write_all(payload)?;
        segment.file.flush()?;
        segment.size_bytes += framed_len;
        Ok(())
    }

    fn open_next_segment(&self, previous_index: Option<u64>) -> io::Result<CurrentSegment> {
        let index = previous_index.map(|i| i + 1).unwrap_or(0);
        let path = self.segment_path(index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size_bytes = file.metadata()?.len();
        Ok(CurrentSegment { index, file, size_bytes })
    }

    fn segment_path(&self, index: u64) -> PathBuf {
        self.directory.join(format!("segment-{index:020}.dlq"))
    }

    fn enforce_retention(&self) -> io::Result<()> {
        let mut segments = self.list_segments()?;
        segments.sort_by_key(|s| s.index);
        while segments.len() > self.max_segments {
            let oldest = segments.remove(0);
            tracing::warn!(path = %oldest.path.display(), "dropping oldest dead-letter segment past retention limit");
            fs::remove_file(&oldest.path)?;
        }
        Ok(())
    }

    /// Lists every segment currently on disk, oldest first.
    pub fn list_segments(&self) -> io::Result<Vec<DlqSegment>> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            let path = entry.path();
            if let Some(index) = parse_segment_index(&path) {
                segments.push(DlqSegment { path, index });
            }
        }
        segments.sort_by_key(|s| s.index);
        Ok(segments)
    }

    /// Reads every framed payload out of one segment, in append order.
    pub fn read_segment(path: &Path) -> io::Result<Vec<Vec<u8>>> {
        let mut file = File::open(path)?;
        let mut payloads = Vec::new();
        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            file.read_exact(&mut payload)?;
            payloads.push(payload);
        }
        Ok(payloads)
    }

    /// Removes a segment once every payload in it has been re-drained
    /// successfully. Does not touch the currently-open segment.
    pub fn remove_segment(&self, segment: &DlqSegment) -> io::Result<()> {
        let guard = self.current.lock().expect("dlq mutex poisoned");
        if let Some(current) = guard.as_ref() {
            if current.index == segment.index {
                drop(guard);
                return Ok(());
            }
        }
        drop(guard);
        fs::remove_file(&segment.path)
    }

    /// Total number of framed payloads across every segment on disk,
    /// reported as the DLQ depth gauge.
    pub fn depth(&self) -> u64 {
        let Ok(segments) = self.list_segments() else {
            return 0;
        };
        segments
            .iter()
            .filter_map(|s| Self::read_segment(&s.path).ok())
            .map(|payloads| payloads.len() as u64)
            .sum()
    }
}

fn parse_segment_index(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let digits = stem.strip_prefix("segment-")?;
    digits.parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_a_single_payload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dlq = DeadLetterQueue::open(dir.path(), 1024, 4).expect("open");
        dlq.append(b"hello").expect("append");

        let segments = dlq.list_segments().expect("list");
        assert_eq!(segments.len(), 1);
        let payloads = DeadLetterQueue::read_segment(&segments[0].path).expect("read");
        assert_eq!(payloads, vec![b"hello".to_vec()]);
    }

    #[test]
    fn rotates_once_segment_size_exceeded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dlq = DeadLetterQueue::open(dir.path(), 16, 8).expect("open");
        for _ in 0..5 {
            dlq.append(b"0123456789").expect("append");
        }

        let segments = dlq.list_segments().expect("list");
        assert!(segments.len() > 1, "expected rotation across multiple segments");
    }

    #[test]
    fn drops_oldest_segment_past_retention() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dlq = DeadLetterQueue::open(dir.path(), 8, 2).expect("open");
        for _ in 0..10 {
            dlq.append(b"0123456789").expect("append");
        }

        let segments = dlq.list_segments().expect("list");
        assert!(segments.len() <= 2);
    }

    #[test]
    fn depth_counts_payloads_across_segments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dlq = DeadLetterQueue::open(dir.path(), 1024, 8).expect("open");
        dlq.append(b"a").expect("append");
        dlq.append(b"b").expect("append");
        assert_eq!(dlq.depth(), 2);
    }
}
