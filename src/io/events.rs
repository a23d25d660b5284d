//! Index-based list-mode files: fixed-size little-endian records of
//! detector index pairs.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use binrw::{binrw, BinRead, BinWrite};

use crate::error::{Error, Result};
use crate::measurement::{DetectorPair, IndexedEvent};

/// On-disk layout of one event: 24 bytes
#[binrw]
#[brw(little)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EventRecord {
    pub tr1: u32,
    pub ax1: u32,
    pub tr2: u32,
    pub ax2: u32,
    /// `+1` prompt, `-1` delayed
    pub weight: f32,
    #[brw(pad_after = 2)]
    pub tof_bin: u16,
}

pub const RECORD_SIZE: u64 = 24;

impl From<EventRecord> for IndexedEvent {
    fn from(EventRecord { tr1, ax1, tr2, ax2, weight, tof_bin }: EventRecord) -> Self {
        IndexedEvent { pair: DetectorPair::new((tr1, ax1), (tr2, ax2)), weight, tof_bin }
    }
}

impl From<&IndexedEvent> for EventRecord {
    fn from(event: &IndexedEvent) -> Self {
        let DetectorPair { transaxial: [tr1, tr2], axial: [ax1, ax2] } = event.pair;
        EventRecord { tr1, ax1, tr2, ax2, weight: event.weight, tof_bin: event.tof_bin }
    }
}

pub fn read(path: &Path) -> Result<Vec<IndexedEvent>> {
    if !path.exists() {
        return Err(Error::MissingResource { what: "event file".into(), path: Some(path.into()) })
    }
    let file = File::open(path)?;
    let bytes = file.metadata()?.len();
    if bytes % RECORD_SIZE != 0 {
        return Err(Error::BinaryFormat(format!(
            "{}: {bytes} bytes is not a whole number of {RECORD_SIZE}-byte events", path.display())))
    }
    let mut reader = BufReader::new(file);
    let events = (0..bytes / RECORD_SIZE)
        .map(|_| Ok(EventRecord::read(&mut reader)?.into()))
        .collect::<Result<Vec<IndexedEvent>>>()?;
    log::info!("read {} events from {}", crate::utils::group_digits(events.len()), path.display());
    Ok(events)
}

pub fn write(events: &[IndexedEvent], path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for event in events {
        EventRecord::from(event).write(&mut writer)?;
    }
    Ok(())
}
