//! Fixed-capacity setpoint table on a byte-addressable persistent medium.
//!
//! Slot `i` lives at byte offset `4 * i` as `[time_lo, time_hi, temp_lo, temp_hi]`.
//! An unset slot is four `0xFF` bytes.

use thiserror::Error;

use crate::types::{
    Profile, SetpointPoint, BYTES_PER_POINT, MAX_POINTS, PROFILE_REGION_BYTES,
};

const UNSET_BYTE: u8 = 0xFF;
const UNSET_TABLE: [u8; PROFILE_REGION_BYTES] = [UNSET_BYTE; PROFILE_REGION_BYTES];

#[derive(Debug, Error)]
pub enum MediumError {
    #[error("access of {len} bytes at offset {offset} exceeds medium size {size}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("commit failed: {0}")]
    Commit(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("medium holds {capacity} bytes; the profile table needs {required}")]
    Capacity { capacity: usize, required: usize },
    #[error("profile {stage} failed: {source}")]
    Persistence {
        stage: &'static str,
        #[source]
        source: MediumError,
    },
    #[error("profile {stage} failed: {source}; restoring the working copy also failed: {restore}")]
    Unrestored {
        stage: &'static str,
        #[source]
        source: MediumError,
        restore: MediumError,
    },
}

/// EEPROM-style medium: writes land in a working copy, `commit` makes them durable.
pub trait PersistentMedium {
    fn capacity(&self) -> usize;
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), MediumError>;
    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), MediumError>;
    fn commit(&mut self) -> Result<(), MediumError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUp {
    /// The medium had never held a profile and was initialised to an empty table.
    Genesis,
    Existing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    pub stored: usize,
    pub dropped: usize,
}

pub fn encode_slot(slot: Option<SetpointPoint>) -> [u8; BYTES_PER_POINT] {
    match slot {
        Some(point) => {
            let [time_lo, time_hi] = point.time_minutes.to_le_bytes();
            let [temp_lo, temp_hi] = point.temperature.to_le_bytes();
            [time_lo, time_hi, temp_lo, temp_hi]
        }
        None => [UNSET_BYTE; BYTES_PER_POINT],
    }
}

/// A slot is set iff its time decodes below the time limit.
pub fn decode_slot(bytes: [u8; BYTES_PER_POINT]) -> Option<SetpointPoint> {
    let point = SetpointPoint {
        time_minutes: u16::from_le_bytes([bytes[0], bytes[1]]),
        temperature: u16::from_le_bytes([bytes[2], bytes[3]]),
    };
    point.is_valid_time().then_some(point)
}

fn encode_table(profile: &Profile) -> [u8; PROFILE_REGION_BYTES] {
    let mut table = UNSET_TABLE;
    for (chunk, slot) in table
        .chunks_exact_mut(BYTES_PER_POINT)
        .zip(profile.slots().iter())
    {
        chunk.copy_from_slice(&encode_slot(*slot));
    }
    table
}

fn decode_table(table: &[u8; PROFILE_REGION_BYTES]) -> Profile {
    let mut profile = Profile::empty();
    for (index, chunk) in table.chunks_exact(BYTES_PER_POINT).enumerate() {
        profile.set_slot(index, decode_slot([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    profile
}

#[derive(Debug)]
pub struct ProfileStore<M> {
    medium: M,
}

impl<M: PersistentMedium> ProfileStore<M> {
    pub fn new(medium: M) -> Self {
        Self { medium }
    }

    pub fn medium(&self) -> &M {
        &self.medium
    }

    pub fn medium_mut(&mut self) -> &mut M {
        &mut self.medium
    }

    /// Run once at process start. An unset first slot or an all-zero region
    /// means nothing was ever saved; the table is rewritten as empty.
    pub fn ensure_initialized(&mut self) -> Result<BringUp, StoreError> {
        let capacity = self.medium.capacity();
        if capacity < PROFILE_REGION_BYTES {
            return Err(StoreError::Capacity {
                capacity,
                required: PROFILE_REGION_BYTES,
            });
        }

        let table = self.read_table().map_err(|source| StoreError::Persistence {
            stage: "bring-up read",
            source,
        })?;

        let first = decode_slot([table[0], table[1], table[2], table[3]]);
        if first.is_some() && table.iter().any(|byte| *byte != 0) {
            return Ok(BringUp::Existing);
        }

        self.reset()?;
        Ok(BringUp::Genesis)
    }

    /// Never fails: an unreadable medium yields an empty profile.
    pub fn load(&self) -> Profile {
        match self.read_table() {
            Ok(table) => decode_table(&table),
            Err(_) => Profile::empty(),
        }
    }

    /// Full-table rewrite. Points past `MAX_POINTS` are dropped; the tail is unset.
    pub fn save(&mut self, points: &[SetpointPoint]) -> Result<SaveReport, StoreError> {
        let stored = points.len().min(MAX_POINTS);
        let report = SaveReport {
            stored,
            dropped: points.len() - stored,
        };

        let previous = self.read_table().ok();
        if let Err(source) = self.write_and_commit(&UNSET_TABLE) {
            // Nothing became durable; put the working copy back as it was.
            let restore = match previous {
                Some(previous) => self.medium.write(0, &previous),
                None => Ok(()),
            };
            return Err(Self::failure("clear", source, restore));
        }

        let table = encode_table(&Profile::from_points(points));
        if let Err(source) = self.write_and_commit(&table) {
            // The durable copy is the cleared table; keep the working copy consistent.
            let restore = self.medium.write(0, &UNSET_TABLE);
            return Err(Self::failure("write", source, restore));
        }

        Ok(report)
    }

    fn failure(
        stage: &'static str,
        source: MediumError,
        restore: Result<(), MediumError>,
    ) -> StoreError {
        match restore {
            Ok(()) => StoreError::Persistence { stage, source },
            Err(restore) => StoreError::Unrestored {
                stage,
                source,
                restore,
            },
        }
    }

    pub fn reset(&mut self) -> Result<(), StoreError> {
        self.write_and_commit(&UNSET_TABLE)
            .map_err(|source| StoreError::Persistence {
                stage: "reset",
                source,
            })
    }

    fn read_table(&self) -> Result<[u8; PROFILE_REGION_BYTES], MediumError> {
        let mut table = [0_u8; PROFILE_REGION_BYTES];
        self.medium.read(0, &mut table)?;
        Ok(table)
    }

    fn write_and_commit(&mut self, table: &[u8; PROFILE_REGION_BYTES]) -> Result<(), MediumError> {
        self.medium.write(0, table)?;
        self.medium.commit()
    }
}

/// RAM-backed medium with a separate durable image and commit failure injection.
#[derive(Debug, Clone)]
pub struct MemoryMedium {
    working: Vec<u8>,
    durable: Vec<u8>,
    commits_before_failure: Option<usize>,
    writes_before_failure: Option<usize>,
    commits: usize,
}

impl MemoryMedium {
    /// Factory-blank medium, every byte `0xFF`.
    pub fn erased(size: usize) -> Self {
        Self::from_bytes(vec![UNSET_BYTE; size])
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            working: bytes.clone(),
            durable: bytes,
            commits_before_failure: None,
            writes_before_failure: None,
            commits: 0,
        }
    }

    /// Lets `successes` more commits through, then fails the next one.
    pub fn fail_commit_after(&mut self, successes: usize) {
        self.commits_before_failure = Some(successes);
    }

    /// Lets `successes` more writes through, then fails the next one.
    pub fn fail_write_after(&mut self, successes: usize) {
        self.writes_before_failure = Some(successes);
    }

    pub fn durable(&self) -> &[u8] {
        &self.durable
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), MediumError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.working.len() => Ok(()),
            _ => Err(MediumError::OutOfBounds {
                offset,
                len,
                size: self.working.len(),
            }),
        }
    }
}

impl PersistentMedium for MemoryMedium {
    fn capacity(&self) -> usize {
        self.working.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), MediumError> {
        self.check_bounds(offset, buf.len())?;
        buf.copy_from_slice(&self.working[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), MediumError> {
        self.check_bounds(offset, bytes.len())?;
        match self.writes_before_failure {
            Some(0) => {
                self.writes_before_failure = None;
                return Err(MediumError::Write("injected failure".to_string()));
            }
            Some(remaining) => self.writes_before_failure = Some(remaining - 1),
            None => {}
        }
        self.working[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), MediumError> {
        match self.commits_before_failure {
            Some(0) => {
                self.commits_before_failure = None;
                return Err(MediumError::Commit("injected failure".to_string()));
            }
            Some(remaining) => self.commits_before_failure = Some(remaining - 1),
            None => {}
        }
        self.durable.copy_from_slice(&self.working);
        self.commits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn store() -> ProfileStore<MemoryMedium> {
        ProfileStore::new(MemoryMedium::erased(PROFILE_REGION_BYTES))
    }

    fn points(raw: &[(u16, u16)]) -> Vec<SetpointPoint> {
        raw.iter()
            .map(|(time, temp)| SetpointPoint::new(*time, *temp))
            .collect()
    }

    #[test]
    fn save_then_load_pads_with_unset_slots() {
        let mut store = store();
        let saved = points(&[(0, 20), (30, 25), (60, 20)]);

        let report = store.save(&saved).unwrap();
        let loaded = store.load();

        assert_eq!(report, SaveReport { stored: 3, dropped: 0 });
        assert_eq!(loaded, Profile::from_points(&saved));
        assert_eq!(loaded.valid_count(), 3);
        assert!(loaded.slots()[3..].iter().all(Option::is_none));
    }

    #[test]
    fn load_is_idempotent() {
        let mut store = store();
        store.save(&points(&[(5, 100), (999, 0)])).unwrap();

        assert_eq!(store.load(), store.load());
    }

    #[test]
    fn save_drops_points_beyond_capacity() {
        let mut store = store();
        let many: Vec<SetpointPoint> = (0..20).map(|i| SetpointPoint::new(i * 10, i)).collect();

        let report = store.save(&many).unwrap();
        let loaded = store.load();

        assert_eq!(report, SaveReport { stored: MAX_POINTS, dropped: 5 });
        assert_eq!(loaded.valid_count(), MAX_POINTS);
        assert_eq!(loaded.slot(14), Some(SetpointPoint::new(140, 14)));
    }

    #[test]
    fn shorter_profile_overwrites_longer_one() {
        let mut store = store();
        store
            .save(&points(&[(0, 10), (10, 20), (20, 30), (30, 40)]))
            .unwrap();
        store.save(&points(&[(0, 50)])).unwrap();

        let loaded = store.load();

        assert_eq!(loaded.valid_count(), 1);
        assert_eq!(loaded.slot(0), Some(SetpointPoint::new(0, 50)));
        assert_eq!(loaded.slot(1), None);
    }

    #[test]
    fn persisted_layout_is_little_endian_with_ff_tail() {
        let mut store = store();
        store.save(&points(&[(0x0102, 0x0304)])).unwrap();

        let durable = store.medium().durable();

        assert_eq!(&durable[..4], &[0x02, 0x01, 0x04, 0x03]);
        assert!(durable[4..].iter().all(|byte| *byte == 0xFF));
    }

    #[test]
    fn slot_with_out_of_range_time_reads_as_unset() {
        assert_eq!(decode_slot([0xE8, 0x03, 0x10, 0x00]), None);
        assert_eq!(
            decode_slot([0xE7, 0x03, 0x10, 0x00]),
            Some(SetpointPoint::new(999, 16))
        );
        assert_eq!(decode_slot(encode_slot(None)), None);
    }

    #[test]
    fn reset_clears_every_slot() {
        let mut store = store();
        store.save(&points(&[(0, 20), (10, 40)])).unwrap();

        store.reset().unwrap();

        assert!(store.load().is_empty());
        assert!(store.medium().durable().iter().all(|byte| *byte == 0xFF));
    }

    #[test]
    fn bring_up_initialises_blank_medium() {
        let mut store = store();

        assert_eq!(store.ensure_initialized().unwrap(), BringUp::Genesis);
        assert_eq!(store.medium().commits(), 1);
        assert!(store.load().is_empty());
    }

    #[test]
    fn bring_up_replaces_legacy_zero_fill() {
        let mut store =
            ProfileStore::new(MemoryMedium::from_bytes(vec![0; PROFILE_REGION_BYTES]));
        assert_eq!(store.load().valid_count(), MAX_POINTS);

        assert_eq!(store.ensure_initialized().unwrap(), BringUp::Genesis);
        assert!(store.load().is_empty());
    }

    #[test]
    fn bring_up_keeps_existing_profile() {
        let mut store = store();
        store.save(&points(&[(0, 20), (10, 40)])).unwrap();
        let commits = store.medium().commits();

        assert_eq!(store.ensure_initialized().unwrap(), BringUp::Existing);
        assert_eq!(store.medium().commits(), commits);
        assert_eq!(store.load().valid_count(), 2);
    }

    #[test]
    fn failed_clear_reports_error_and_keeps_durable_profile() {
        let mut store = store();
        store.save(&points(&[(0, 20)])).unwrap();
        let durable_before = store.medium().durable().to_vec();
        store.medium_mut().fail_commit_after(0);

        let err = store.save(&points(&[(0, 99)])).unwrap_err();

        assert!(err.to_string().contains("clear"));
        assert_eq!(store.medium().durable(), durable_before.as_slice());
        assert_eq!(store.load().slot(0), Some(SetpointPoint::new(0, 20)));
    }

    #[test]
    fn failed_write_reads_back_as_no_data() {
        let mut store = store();
        store.save(&points(&[(0, 20), (10, 30)])).unwrap();
        store.medium_mut().fail_commit_after(1);

        let err = store.save(&points(&[(0, 99), (5, 98)])).unwrap_err();

        assert!(err.to_string().contains("write"));
        assert!(store.load().is_empty());
        assert!(store.medium().durable().iter().all(|byte| *byte == 0xFF));
    }

    #[test]
    fn failed_restore_is_part_of_the_error() {
        let mut store = store();
        store.save(&points(&[(0, 20)])).unwrap();
        store.medium_mut().fail_commit_after(0);
        store.medium_mut().fail_write_after(1);

        let err = store.save(&points(&[(0, 99)])).unwrap_err();

        assert!(matches!(
            err,
            StoreError::Unrestored {
                stage: "clear",
                source: MediumError::Commit(_),
                restore: MediumError::Write(_),
            }
        ));
        assert!(err.to_string().contains("restoring the working copy"));
        assert_eq!(&store.medium().durable()[..4], &[0, 0, 20, 0]);
    }

    #[test]
    fn bring_up_rejects_undersized_medium() {
        let mut store = ProfileStore::new(MemoryMedium::erased(PROFILE_REGION_BYTES - 4));

        let err = store.ensure_initialized().unwrap_err();

        assert!(matches!(
            err,
            StoreError::Capacity {
                capacity: 56,
                required: 60
            }
        ));
        assert_eq!(store.medium().commits(), 0);
    }

    #[test]
    fn any_profile_up_to_capacity_round_trips() {
        let corners = [(0, 0), (999, 999), (0, 999), (999, 0)];
        for count in 0..=MAX_POINTS {
            let saved: Vec<SetpointPoint> = (0..count)
                .map(|i| match i {
                    0 => SetpointPoint::new(0, 0),
                    i if i + 1 == count => SetpointPoint::new(999, 999),
                    i => {
                        let (time, temp) = corners[i % corners.len()];
                        SetpointPoint::new(time, temp)
                    }
                })
                .collect();
            let mut store = store();

            store.save(&saved).unwrap();

            assert_eq!(store.load(), Profile::from_points(&saved), "{count} points");
            assert_eq!(store.load().valid_count(), count);
        }
    }

    #[test]
    fn unreadable_medium_loads_empty_profile() {
        let store = ProfileStore::new(MemoryMedium::erased(8));

        assert!(store.load().is_empty());
    }
}
