use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::model::Event;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};

const WRITER_QUEUE_DEPTH: usize = 4096;

/// Bytes around each payload: length prefix and checksum.
const FRAME_OVERHEAD: u64 = 8;

/// Frame one event as `[u32 len][bincode][u32 crc32]`, little-endian.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Outcome of reading one frame during replay.
enum Frame {
    /// An intact event and the number of bytes its frame took.
    Event(Event, u64),
    /// Clean end of file, a short tail, or a checksum/payload mismatch.
    /// Either way nothing after this point is trusted.
    End,
}

fn read_exact_or_end(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    if !read_exact_or_end(reader, &mut len_buf)? {
        return Ok(Frame::End);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_exact_or_end(reader, &mut payload)? {
        return Ok(Frame::End);
    }
    let mut crc_buf = [0u8; 4];
    if !read_exact_or_end(reader, &mut crc_buf)? {
        return Ok(Frame::End);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::End);
    }
    let size = payload.len() as u64 + FRAME_OVERHEAD;
    Ok(bincode::deserialize::<Event>(&payload)
        .map(|event| Frame::Event(event, size))
        .unwrap_or(Frame::End))
}

/// Every intact event from the start of the file, and the byte length they cover.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut intact = 0u64;
    while let Frame::Event(event, size) = read_frame(&mut reader)? {
        events.push(event);
        intact += size;
    }
    Ok((events, intact))
}

/// Append-only journal of every booking and slot change.
///
/// A batch is encoded in memory and reaches the file in one write. If the
/// write or the fsync fails the file is cut back to its previous length, so
/// a failed batch never resurfaces on replay.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Length of the file up to the last committed frame.
    committed_len: u64,
    appends_since_compact: u64,
    #[cfg(test)]
    fail_next_write: bool,
}

impl Wal {
    /// Open for appending. A torn or corrupt tail left by a crash is cut off
    /// first, so new frames are never stranded behind it.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (_, intact) = scan(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() > intact {
            tracing::warn!("journal {} has a damaged tail, truncating to {intact} bytes", path.display());
            file.set_len(intact)?;
            file.sync_all()?;
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            committed_len: intact,
            appends_since_compact: 0,
            #[cfg(test)]
            fail_next_write: false,
        })
    }

    /// Durably append `events` as one unit: all of them or none.
    pub fn append_batch(&mut self, events: &[Event]) -> io::Result<()> {
        let mut buf = Vec::new();
        for event in events {
            write_frame(&mut buf, event)?;
        }
        if let Err(e) = self.write_and_sync(&buf) {
            self.rollback();
            return Err(e);
        }
        self.committed_len += buf.len() as u64;
        self.appends_since_compact += events.len() as u64;
        Ok(())
    }

    fn write_and_sync(&mut self, buf: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if self.fail_next_write {
            self.fail_next_write = false;
            self.file.write_all(&buf[..buf.len() / 2])?;
            return Err(io::Error::other("injected write failure"));
        }
        self.file.write_all(buf)?;
        self.file.sync_all()
    }

    /// Drop whatever part of a failed batch reached the file.
    fn rollback(&mut self) {
        let restored = self
            .file
            .set_len(self.committed_len)
            .and_then(|()| self.file.sync_all());
        if let Err(e) = restored {
            tracing::error!(
                "could not cut journal {} back to {} bytes: {e}",
                self.path.display(),
                self.committed_len
            );
        }
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_batch(std::slice::from_ref(event))
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_path(&self) -> PathBuf {
        self.path.with_extension("wal.tmp")
    }

    /// Write `events` to a side file, then rename it over the journal.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp = self.compact_path();
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for event in events {
                write_frame(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.committed_len = self.file.metadata()?.len();
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every intact event. A missing file is an empty journal.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        scan(path).map(|(events, _)| events)
    }
}

// ── Group-commit writer ──────────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Cloneable handle to the task that owns the journal file.
#[derive(Clone)]
pub struct WalHandle {
    tx: mpsc::Sender<WalCommand>,
}

impl WalHandle {
    /// Move `wal` onto a background task. Must be called inside a tokio runtime.
    pub fn spawn(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
        tokio::spawn(writer_loop(wal, rx));
        Self { tx }
    }

    /// Returns once the event is fsynced (possibly together with others).
    pub async fn append(&self, event: Event) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Append { event, response })
            .await
            .map_err(|_| writer_gone())?;
        rx.await.map_err(|_| writer_gone())?
    }

    pub async fn compact(&self, events: Vec<Event>) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Compact { events, response })
            .await
            .map_err(|_| writer_gone())?;
        rx.await.map_err(|_| writer_gone())?
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (response, rx) = oneshot::channel();
        if self
            .tx
            .send(WalCommand::AppendsSinceCompact { response })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn writer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "journal writer stopped")
}

/// Block for one command; if it is an append, sweep up every append already
/// queued behind it and commit the lot with a single fsync.
async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                run_control(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            run_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let (events, responders): (Vec<Event>, Vec<_>) = batch.into_iter().unzip();
    let result = wal.append_batch(&events);
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        tracing::error!("journal commit of {} events failed: {e}", events.len());
    }
    for tx in responders {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn run_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StoredCapacity;
    use chrono::NaiveTime;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bayslot_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn slot_created() -> Event {
        Event::SlotCreated {
            id: Ulid::new(),
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            capacity: StoredCapacity::Value(2),
            is_available: true,
            note: Some("bay 1".into()),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            slot_created(),
            Event::SlotAvailabilitySet { id: Ulid::new(), is_available: false },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn missing_file_replays_empty() {
        let path = tmp_path("never_written.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = tmp_path("torn_tail.wal");
        let first = slot_created();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&slot_created()).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }

    #[test]
    fn corrupt_checksum_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let first = slot_created();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&slot_created()).unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }

    #[test]
    fn failed_batch_leaves_no_trace() {
        let path = tmp_path("failed_batch.wal");
        let committed = slot_created();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&committed).unwrap();
        let len_before = fs::metadata(&path).unwrap().len();

        wal.fail_next_write = true;
        assert!(wal.append_batch(&[slot_created(), slot_created()]).is_err());
        assert_eq!(fs::metadata(&path).unwrap().len(), len_before);
        assert_eq!(wal.appends_since_compact(), 1);

        let after = Event::SlotDeleted { id: Ulid::new() };
        wal.append(&after).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![committed, after]);
    }

    #[test]
    fn open_cuts_damaged_tail_before_appending() {
        let path = tmp_path("reopen_torn.wal");
        let first = slot_created();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[40, 0, 0, 0, 1, 2, 3]).unwrap();
        }

        let next = slot_created();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&next).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, next]);
    }

    #[test]
    fn every_caller_in_a_failed_batch_sees_the_error() {
        let path = tmp_path("failed_group.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.fail_next_write = true;

        let (tx_a, mut rx_a) = oneshot::channel();
        let (tx_b, mut rx_b) = oneshot::channel();
        commit_batch(&mut wal, vec![(slot_created(), tx_a), (slot_created(), tx_b)]);

        assert!(rx_a.try_recv().unwrap().is_err());
        assert!(rx_b.try_recv().unwrap().is_err());
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compact_replaces_contents_and_resets_counter() {
        let path = tmp_path("compact.wal");
        let keep = slot_created();
        let mut wal = Wal::open(&path).unwrap();
        for _ in 0..5 {
            wal.append(&slot_created()).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 5);

        wal.compact(std::slice::from_ref(&keep)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);

        let after = Event::SlotDeleted { id: Ulid::new() };
        wal.append(&after).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![keep, after]);
    }

    #[tokio::test]
    async fn handle_commits_concurrent_appends() {
        let path = tmp_path("handle_group_commit.wal");
        let handle = WalHandle::spawn(Wal::open(&path).unwrap());

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let h = handle.clone();
            tasks.push(tokio::spawn(async move { h.append(slot_created()).await }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(handle.appends_since_compact().await, 32);
        assert_eq!(Wal::replay(&path).unwrap().len(), 32);
    }
}
