//! Binary persistence of the track index.
//!
//! The file is a plain sequence of records with no header, version tag or
//! checksum. All integers and floats are little-endian:
//!
//! ```text
//! record  := id:i32 threat_level:i32 status:i32 sample_count:i32 sample*
//! sample  := lat:f64 lon:f64 timestamp:i32
//! ```
//!
//! Records are written in ascending id order. Loading replays them into a
//! fresh index through the normal create / append / insert path, so the
//! restored tree holds the same keys and contents but not necessarily the
//! same shape.
//!
//! A file cut short mid-record loads every complete record before the cut and
//! drops the partial one. That is the only recovery offered.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

use crate::tmap_index::TrackIndex;
use crate::tmap_track::{TargetRecord, TargetStatus};

/// Errors writing or reading the data file.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("target {id} has {count} samples, more than the format can hold")]
    TooManySamples { id: i32, count: usize },
}

/// Outcome of a load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Records restored into the index
    pub records: usize,
    /// Whether a trailing partial record was discarded
    pub truncated: bool,
    /// Records skipped because their id was already restored
    pub duplicates: usize,
}

// ── Primitive writers ───────────────────────────────────────────

fn write_i32_le(w: &mut dyn Write, v: i32) -> Result<(), PersistError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_f64_le(w: &mut dyn Write, v: f64) -> Result<(), PersistError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

// ── Primitive readers ───────────────────────────────────────────

/// Result of reading one fixed-size field.
enum Field<const N: usize> {
    Full([u8; N]),
    /// Clean end of stream before the first byte
    End,
    /// Stream ended part-way through the field
    Partial,
}

fn read_field<const N: usize>(r: &mut dyn Read) -> Result<Field<N>, PersistError> {
    let mut buf = [0u8; N];
    let mut filled = 0;
    while filled < N {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(match filled {
        0 => Field::End,
        n if n == N => Field::Full(buf),
        _ => Field::Partial,
    })
}

/// Reads a field that must be present; any shortfall counts as truncation.
fn read_required<const N: usize>(r: &mut dyn Read) -> Result<Option<[u8; N]>, PersistError> {
    match read_field::<N>(r)? {
        Field::Full(buf) => Ok(Some(buf)),
        Field::End | Field::Partial => Ok(None),
    }
}

fn read_i32_le(r: &mut dyn Read) -> Result<Option<i32>, PersistError> {
    Ok(read_required::<4>(r)?.map(i32::from_le_bytes))
}

fn read_f64_le(r: &mut dyn Read) -> Result<Option<f64>, PersistError> {
    Ok(read_required::<8>(r)?.map(f64::from_le_bytes))
}

// ── Records ─────────────────────────────────────────────────────

enum Decoded {
    Record(TargetRecord),
    End,
    Truncated,
}

fn write_record(w: &mut dyn Write, record: &TargetRecord) -> Result<(), PersistError> {
    let count = i32::try_from(record.sample_count()).map_err(|_| PersistError::TooManySamples {
        id: record.id(),
        count: record.sample_count(),
    })?;

    write_i32_le(w, record.id())?;
    write_i32_le(w, record.threat_level())?;
    write_i32_le(w, record.status().code())?;
    write_i32_le(w, count)?;
    for sample in record.trajectory() {
        write_f64_le(w, sample.lat)?;
        write_f64_le(w, sample.lon)?;
        write_i32_le(w, sample.timestamp)?;
    }
    Ok(())
}

fn read_record(r: &mut dyn Read) -> Result<Decoded, PersistError> {
    let id = match read_field::<4>(r)? {
        Field::Full(buf) => i32::from_le_bytes(buf),
        Field::End => return Ok(Decoded::End),
        Field::Partial => return Ok(Decoded::Truncated),
    };
    let (Some(threat_level), Some(status), Some(count)) =
        (read_i32_le(r)?, read_i32_le(r)?, read_i32_le(r)?)
    else {
        return Ok(Decoded::Truncated);
    };
    if count < 0 {
        warn!(target_id = id, count, "LOAD       | negative sample count, stopping");
        return Ok(Decoded::Truncated);
    }

    let mut record = TargetRecord::new(id, threat_level);
    record.restore_status(TargetStatus::from_code(status));
    for _ in 0..count {
        let (Some(lat), Some(lon), Some(timestamp)) =
            (read_f64_le(r)?, read_f64_le(r)?, read_i32_le(r)?)
        else {
            return Ok(Decoded::Truncated);
        };
        // Replays the lifecycle rule: samples under a Destroyed header are dropped.
        record.append_sample(lat, lon, timestamp);
    }
    Ok(Decoded::Record(record))
}

// ── Public API ──────────────────────────────────────────────────

/// Writes every record, tombstones included, in ascending id order.
/// Returns the number of records written.
pub fn save(index: &TrackIndex, sink: &mut dyn Write) -> Result<usize, PersistError> {
    let mut written = 0;
    for record in index {
        write_record(sink, record)?;
        written += 1;
    }
    sink.flush()?;
    Ok(written)
}

/// Rebuilds an index from `source`, stopping at end of stream or at the
/// first incomplete record.
pub fn load(source: &mut dyn Read) -> Result<(TrackIndex, LoadSummary), PersistError> {
    let mut index = TrackIndex::new();
    let mut summary = LoadSummary::default();

    loop {
        match read_record(source)? {
            Decoded::Record(record) => {
                let id = record.id();
                if index.try_insert(record).is_err() {
                    warn!(target_id = id, "LOAD       | duplicate id in data file, skipped");
                    summary.duplicates += 1;
                    continue;
                }
                summary.records += 1;
            }
            Decoded::End => break,
            Decoded::Truncated => {
                warn!(
                    restored = summary.records,
                    "LOAD       | data file truncated, partial record discarded"
                );
                summary.truncated = true;
                break;
            }
        }
    }
    Ok((index, summary))
}

/// Best-effort save to a file, replacing any previous contents.
pub fn save_to_path(index: &TrackIndex, path: impl AsRef<Path>) -> Result<usize, PersistError> {
    let path = path.as_ref();
    let mut writer = BufWriter::new(File::create(path)?);
    let written = save(index, &mut writer)?;
    info!(records = written, path = %path.display(), "SAVE       | session saved");
    Ok(written)
}

/// Loads from a file. A missing file yields an empty index.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<(TrackIndex, LoadSummary), PersistError> {
    let path = path.as_ref();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!(path = %path.display(), "LOAD       | no previous database, booting fresh");
            return Ok((TrackIndex::new(), LoadSummary::default()));
        }
        Err(e) => return Err(e.into()),
    };
    let (index, summary) = load(&mut BufReader::new(file))?;
    info!(
        records = summary.records,
        truncated = summary.truncated,
        path = %path.display(),
        "LOAD       | database restored"
    );
    Ok((index, summary))
}
