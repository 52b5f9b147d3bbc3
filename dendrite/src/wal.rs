//! The transactional slot log.
//!
//! An append-only, line-oriented text file of authoritative slot writes:
//!
//! ```text
//! <seq>\t<iso8601>\t<origin>\t<object_id>\t<slot_name>\t<encoded_value>
//! ```
//!
//! Writers append and flush *before* the in-memory slot changes; replay
//! streams records in sequence order to rebuild a fresh kernel. Appending
//! is serial and non-reentrant: logging while logging is an invariant
//! violation and panics. Compaction writes a new file and renames it over
//! the old one; sequence numbers are never reused or rewritten.

use crate::error::{Error, Result};
use crate::textual;
use crate::value::{ObjectId, Value};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which subsystem authored a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Kernel,
    Bridge,
    Replay,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Origin::Kernel => "kernel",
            Origin::Bridge => "bridge",
            Origin::Replay => "replay",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Origin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Origin> {
        match s {
            "kernel" => Ok(Origin::Kernel),
            "bridge" => Ok(Origin::Bridge),
            "replay" => Ok(Origin::Replay),
            other => Err(Error::MalformedRecord(format!("unknown origin '{}'", other))),
        }
    }
}

/// One parsed log record.
#[derive(Clone, Debug)]
pub struct WalRecord {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub origin: Origin,
    pub object_id: ObjectId,
    pub slot_name: String,
    pub value: Value,
}

thread_local! {
    static APPENDING: Cell<bool> = Cell::new(false);
}

struct AppendGuard;

impl AppendGuard {
    fn enter() -> AppendGuard {
        APPENDING.with(|flag| {
            if flag.get() {
                panic!("slot log appender re-entered while appending");
            }
            flag.set(true);
        });
        AppendGuard
    }
}

impl Drop for AppendGuard {
    fn drop(&mut self) {
        APPENDING.with(|flag| flag.set(false));
    }
}

pub struct SlotLog {
    path: PathBuf,
    appender: Mutex<BufWriter<File>>,
    next_seq: AtomicU64,
}

impl SlotLog {
    /// Open (or create) the log and continue after its last sequence.
    pub fn open(path: impl AsRef<Path>) -> Result<SlotLog> {
        let path = path.as_ref().to_path_buf();
        let mut next_seq = 1;
        if path.exists() {
            read_records(&path, &mut |record| {
                next_seq = record.sequence + 1;
                Ok(())
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| Error::LogUnavailable(err.to_string()))?;
        tracing::debug!(path = %path.display(), next_seq, "opened slot log");
        Ok(SlotLog {
            path,
            appender: Mutex::new(BufWriter::new(file)),
            next_seq: AtomicU64::new(next_seq),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sequence of the most recent record, 0 when empty.
    pub fn last_sequence(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst) - 1
    }

    /// Append one record and flush it to stable storage. The returned
    /// sequence reflects commit order across threads.
    pub fn record(
        &self,
        object_id: ObjectId,
        slot_name: &str,
        value: &Value,
        origin: Origin,
    ) -> Result<u64> {
        let _guard = AppendGuard::enter();
        let mut appender = self.appender.lock();
        let sequence = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let line = format!(
            "{}\t{}\t{}\t{}\t{}\t{}\n",
            sequence,
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            origin,
            object_id,
            textual::escape_field(slot_name),
            textual::encode(value),
        );
        let committed = appender
            .write_all(line.as_bytes())
            .and_then(|_| appender.flush())
            .and_then(|_| appender.get_ref().sync_data());
        committed.map_err(|err| Error::LogUnavailable(err.to_string()))?;
        tracing::trace!(sequence, %object_id, slot_name, "logged slot write");
        Ok(sequence)
    }

    /// Stream every record, in sequence order, to `sink`.
    pub fn replay(&self, sink: &mut dyn FnMut(WalRecord) -> Result<()>) -> Result<()> {
        read_records(&self.path, sink)
    }

    /// Drop records before `seq` by writing a compacted file and renaming
    /// it into place.
    pub fn truncate_before(&self, seq: u64) -> Result<()> {
        let mut appender = self.appender.lock();
        appender
            .flush()
            .map_err(|err| Error::LogUnavailable(err.to_string()))?;

        let compact_path = self.path.with_extension("compact");
        let mut kept = 0usize;
        {
            let file = File::create(&compact_path)
                .map_err(|err| Error::LogUnavailable(err.to_string()))?;
            let mut writer = BufWriter::new(file);
            read_raw_lines(&self.path, &mut |sequence, line| {
                if sequence >= seq {
                    writer
                        .write_all(line.as_bytes())
                        .and_then(|_| writer.write_all(b"\n"))
                        .map_err(|err| Error::LogUnavailable(err.to_string()))?;
                    kept += 1;
                }
                Ok(())
            })?;
            writer
                .flush()
                .and_then(|_| writer.get_ref().sync_data())
                .map_err(|err| Error::LogUnavailable(err.to_string()))?;
        }
        std::fs::rename(&compact_path, &self.path)
            .map_err(|err| Error::LogUnavailable(err.to_string()))?;

        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|err| Error::LogUnavailable(err.to_string()))?;
        *appender = BufWriter::new(file);
        tracing::debug!(before = seq, kept, "compacted slot log");
        Ok(())
    }
}

fn read_records(path: &Path, sink: &mut dyn FnMut(WalRecord) -> Result<()>) -> Result<()> {
    read_raw_lines(path, &mut |_, line| sink(parse_line(line)?))
}

fn read_raw_lines(path: &Path, sink: &mut dyn FnMut(u64, &str) -> Result<()>) -> Result<()> {
    let file = File::open(path).map_err(|err| Error::LogUnavailable(err.to_string()))?;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|err| Error::LogUnavailable(err.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let sequence = leading_sequence(&line)?;
        sink(sequence, &line)?;
    }
    Ok(())
}

fn leading_sequence(line: &str) -> Result<u64> {
    let field = line.split('\t').next().unwrap_or_default().trim();
    field
        .parse::<u64>()
        .map_err(|_| Error::MalformedRecord(format!("bad sequence in '{}'", line)))
}

/// The reader is lenient about whitespace around fields; only the tab
/// separators are structural.
fn parse_line(line: &str) -> Result<WalRecord> {
    let mut fields = line.splitn(6, '\t').map(str::trim);
    let mut next = |what: &str| {
        fields
            .next()
            .ok_or_else(|| Error::MalformedRecord(format!("record lacks {}: '{}'", what, line)))
    };
    let sequence = next("a sequence")?
        .parse::<u64>()
        .map_err(|_| Error::MalformedRecord(format!("bad sequence in '{}'", line)))?;
    let timestamp = DateTime::parse_from_rfc3339(next("a timestamp")?)
        .map_err(|err| Error::MalformedRecord(format!("bad timestamp: {}", err)))?
        .with_timezone(&Utc);
    let origin = next("an origin")?.parse::<Origin>()?;
    let object_id = ObjectId(
        next("an object id")?
            .parse::<u64>()
            .map_err(|_| Error::MalformedRecord(format!("bad object id in '{}'", line)))?,
    );
    let slot_name = textual::unescape_field(next("a slot name")?)?;
    let value = textual::decode(next("a value")?)?;
    Ok(WalRecord {
        sequence,
        timestamp,
        origin,
        object_id,
        slot_name,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn collect(log: &SlotLog) -> Vec<WalRecord> {
        let mut out = Vec::new();
        log.replay(&mut |record| {
            out.push(record);
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn records_survive_reopen_with_their_sequences() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.wal");
        {
            let log = SlotLog::open(&path).unwrap();
            for i in 1..=5u64 {
                let seq = log
                    .record(
                        ObjectId(7),
                        &format!("k{}", i),
                        &Value::from(i as f64),
                        Origin::Kernel,
                    )
                    .unwrap();
                assert_eq!(seq, i);
            }
        }
        let log = SlotLog::open(&path).unwrap();
        let records = collect(&log);
        assert_eq!(records.len(), 5);
        let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        assert_eq!(records[2].slot_name, "k3");
        assert_eq!(records[2].value, Value::from(3.0));
        assert_eq!(records[2].origin, Origin::Kernel);

        // New writes continue the sequence.
        assert_eq!(
            log.record(ObjectId(7), "k6", &Value::from(6.0), Origin::Bridge)
                .unwrap(),
            6
        );
    }

    #[test]
    fn awkward_payloads_stay_line_oriented() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.wal");
        let log = SlotLog::open(&path).unwrap();
        log.record(
            ObjectId(1),
            "notes\twith\ttabs",
            &Value::from("line one\nline two\tand a tab"),
            Origin::Kernel,
        )
        .unwrap();
        // Boundary whitespace in slot names and values must survive the
        // lenient (trimming) reader.
        log.record(
            ObjectId(1),
            " padded name ",
            &Value::from("trailing space "),
            Origin::Kernel,
        )
        .unwrap();
        log.record(ObjectId(1), "plain", &Value::Nil, Origin::Kernel)
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);

        let records = collect(&log);
        assert_eq!(records[0].slot_name, "notes\twith\ttabs");
        assert_eq!(
            records[0].value,
            Value::from("line one\nline two\tand a tab")
        );
        assert_eq!(records[1].slot_name, " padded name ");
        assert_eq!(records[1].value, Value::from("trailing space "));
    }

    #[test]
    fn truncation_keeps_later_sequences_intact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.wal");
        let log = SlotLog::open(&path).unwrap();
        for i in 1..=5u64 {
            log.record(ObjectId(2), "k", &Value::from(i as f64), Origin::Kernel)
                .unwrap();
        }
        log.truncate_before(4).unwrap();

        let records = collect(&log);
        let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![4, 5]);

        // The appender survives compaction.
        assert_eq!(
            log.record(ObjectId(2), "k", &Value::from(6.0), Origin::Kernel)
                .unwrap(),
            6
        );
        assert_eq!(collect(&log).len(), 3);
    }

    #[test]
    fn concurrent_appends_linearize() {
        let dir = tempdir().unwrap();
        let log = Arc::new(SlotLog::open(dir.path().join("state.wal")).unwrap());
        let mut workers = Vec::new();
        for t in 0..4u64 {
            let log = Arc::clone(&log);
            workers.push(std::thread::spawn(move || {
                for i in 0..8u64 {
                    log.record(
                        ObjectId(t),
                        &format!("s{}", i),
                        &Value::from(i as f64),
                        Origin::Kernel,
                    )
                    .unwrap();
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        let records = collect(&log);
        assert_eq!(records.len(), 32);
        for (at, record) in records.iter().enumerate() {
            assert_eq!(record.sequence, at as u64 + 1);
        }
    }

    #[test]
    fn lenient_reader_tolerates_padded_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.wal");
        std::fs::write(
            &path,
            "1\t 2024-05-01T00:00:00.000000Z \t kernel \t 9 \tcolor\t s:red \n",
        )
        .unwrap();
        let log = SlotLog::open(&path).unwrap();
        let records = collect(&log);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].object_id, ObjectId(9));
        assert_eq!(records[0].value, Value::from("red"));
        assert_eq!(log.last_sequence(), 1);
    }

    #[test]
    fn malformed_lines_are_reported_not_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.wal");
        std::fs::write(&path, "not-a-record\n").unwrap();
        match SlotLog::open(&path).err() {
            Some(Error::MalformedRecord(_)) => {}
            other => panic!("expected MalformedRecord, got {:?}", other),
        }
    }
}
