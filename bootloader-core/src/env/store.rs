//! Append-only environment log over two flash banks.
//!
//! Bank A is the growing log. Bank B stays erased except for the brief window
//! of a compaction, when its first slot carries the rescue copy of the newest
//! record. A sealed rescue copy is therefore always at least as new as
//! anything in bank A and wins on load.

use core::fmt;

use super::record::{EnvRecord, RECORD_BYTES, RECORD_WORDS, RecordError, RecordWords, SlotState};
use crate::flash::{ERASED_WORD, Flash, FlashIoError, WORD_BYTES};
use crate::layout::{FlashLayout, RegionId};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EnvError {
    Flash(FlashIoError),
    /// Neither bank holds a sealed record.
    NoEnvironment,
    /// The newest sealed record does not decode.
    Corrupt(RecordError),
}

impl fmt::Display for EnvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvError::Flash(err) => write!(f, "flash: {err}"),
            EnvError::NoEnvironment => f.write_str("no environment record"),
            EnvError::Corrupt(err) => write!(f, "corrupt environment: {err}"),
        }
    }
}

impl From<FlashIoError> for EnvError {
    fn from(err: FlashIoError) -> Self {
        EnvError::Flash(err)
    }
}

impl From<RecordError> for EnvError {
    fn from(err: RecordError) -> Self {
        EnvError::Corrupt(err)
    }
}

/// Where [`EnvStore::load`] found the record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecordSource {
    Primary { slot: u32 },
    /// Found in bank B. [`EnvStore::load`] rebuilds bank A from it.
    Rescue,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Loaded {
    pub record: EnvRecord,
    pub source: RecordSource,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    Appended { slot: u32 },
    /// Bank A was collapsed to this single record.
    Compacted,
}

/// Slot counts for one bank.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BankOccupancy {
    pub sealed: u32,
    pub torn: u32,
    pub blank: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Occupancy {
    pub primary: BankOccupancy,
    pub rescue: BankOccupancy,
}

/// Log store bound to the environment banks of a layout.
#[derive(Copy, Clone, Debug)]
pub struct EnvStore {
    primary: u32,
    rescue: u32,
    bank_bytes: u32,
    slots: u32,
}

impl EnvStore {
    #[must_use]
    pub const fn new(layout: &FlashLayout) -> Self {
        Self {
            primary: layout.address(RegionId::EnvBankA, 0),
            rescue: layout.address(RegionId::EnvBankB, 0),
            bank_bytes: layout.env_bank_a.size,
            slots: layout.slots_per_bank(),
        }
    }

    #[must_use]
    pub const fn slots_per_bank(&self) -> u32 {
        self.slots
    }

    /// Returns the newest sealed record, repairing bank A first if the record
    /// had to come from bank B.
    pub fn load<F: Flash + ?Sized>(&self, flash: &mut F) -> Result<Loaded, EnvError> {
        let (loaded, words) = self.newest(flash)?;
        if loaded.source == RecordSource::Rescue {
            self.repair(flash, &words)?;
        }
        Ok(loaded)
    }

    /// Returns what [`EnvStore::load`] would, without erasing or programming.
    pub fn inspect<F: Flash + ?Sized>(&self, flash: &mut F) -> Result<Loaded, EnvError> {
        Ok(self.newest(flash)?.0)
    }

    fn newest<F: Flash + ?Sized>(&self, flash: &mut F) -> Result<(Loaded, RecordWords), EnvError> {
        let rescue = self.read_slot(flash, self.rescue, 0)?;
        if SlotState::classify(&rescue) == SlotState::Sealed {
            let loaded = Loaded {
                record: EnvRecord::decode(&rescue)?,
                source: RecordSource::Rescue,
            };
            return Ok((loaded, rescue));
        }

        let mut newest = None;
        for slot in 0..self.slots {
            let words = self.read_slot(flash, self.primary, slot)?;
            match SlotState::classify(&words) {
                SlotState::Blank => break,
                SlotState::Torn => {}
                SlotState::Sealed => newest = Some((slot, words)),
            }
        }

        let (slot, words) = newest.ok_or(EnvError::NoEnvironment)?;
        let loaded = Loaded {
            record: EnvRecord::decode(&words)?,
            source: RecordSource::Primary { slot },
        };
        Ok((loaded, words))
    }

    /// Appends `record` to bank A, compacting when no blank slot remains.
    pub fn save<F: Flash + ?Sized>(
        &self,
        flash: &mut F,
        record: &EnvRecord,
    ) -> Result<SaveOutcome, EnvError> {
        let words = record.encode();

        // A leftover rescue copy would shadow the append on the next load.
        let rescue = self.read_slot(flash, self.rescue, 0)?;
        if SlotState::classify(&rescue) != SlotState::Blank {
            self.compact(flash, &words)?;
            return Ok(SaveOutcome::Compacted);
        }

        for slot in 0..self.slots {
            let existing = self.read_slot(flash, self.primary, slot)?;
            if SlotState::classify(&existing) == SlotState::Blank {
                self.write_slot(flash, self.primary, slot, &words)?;
                return Ok(SaveOutcome::Appended { slot });
            }
        }

        self.compact(flash, &words)?;
        Ok(SaveOutcome::Compacted)
    }

    /// Counts sealed, torn, and blank slots in both banks.
    pub fn occupancy<F: Flash + ?Sized>(&self, flash: &mut F) -> Result<Occupancy, EnvError> {
        Ok(Occupancy {
            primary: self.bank_occupancy(flash, self.primary)?,
            rescue: self.bank_occupancy(flash, self.rescue)?,
        })
    }

    fn bank_occupancy<F: Flash + ?Sized>(
        &self,
        flash: &mut F,
        bank: u32,
    ) -> Result<BankOccupancy, EnvError> {
        let mut counts = BankOccupancy::default();
        for slot in 0..self.slots {
            match SlotState::classify(&self.read_slot(flash, bank, slot)?) {
                SlotState::Blank => counts.blank += 1,
                SlotState::Torn => counts.torn += 1,
                SlotState::Sealed => counts.sealed += 1,
            }
        }
        Ok(counts)
    }

    // Each step leaves at least one sealed copy behind: bank A keeps its log
    // until bank B holds the rescue copy, and bank B keeps the rescue copy
    // until bank A has been rewritten.
    fn compact<F: Flash + ?Sized>(&self, flash: &mut F, words: &RecordWords) -> Result<(), EnvError> {
        flash.erase(self.rescue, self.bank_bytes)?;
        self.write_slot(flash, self.rescue, 0, words)?;
        self.repair(flash, words)
    }

    fn repair<F: Flash + ?Sized>(&self, flash: &mut F, words: &RecordWords) -> Result<(), EnvError> {
        flash.erase(self.primary, self.bank_bytes)?;
        self.write_slot(flash, self.primary, 0, words)?;
        flash.erase(self.rescue, self.bank_bytes)?;
        Ok(())
    }

    fn read_slot<F: Flash + ?Sized>(
        &self,
        flash: &mut F,
        bank: u32,
        slot: u32,
    ) -> Result<RecordWords, FlashIoError> {
        let mut words = [ERASED_WORD; RECORD_WORDS];
        flash.read(&mut words, bank + slot * RECORD_BYTES)?;
        Ok(words)
    }

    fn write_slot<F: Flash + ?Sized>(
        &self,
        flash: &mut F,
        bank: u32,
        slot: u32,
        words: &RecordWords,
    ) -> Result<(), FlashIoError> {
        let address = bank + slot * RECORD_BYTES;
        let (body, status) = words.split_at(RECORD_WORDS - 1);
        flash.program(address, body)?;
        flash.program(address + RECORD_BYTES - WORD_BYTES, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::record::BootFlag;
    use crate::flash::sim::RamFlash;
    use crate::layout::Region;

    const LAYOUT: FlashLayout = FlashLayout {
        base: 0,
        flash_size: 0x1000,
        page_size: 0x100,
        env_bank_a: Region::new(0, 0x400),
        env_bank_b: Region::new(0x400, 0x400),
        current: Region::new(0x800, 0x300),
        update: Region::new(0xB00, 0x300),
        scratch: Region::new(0xE00, 0x100),
    };

    fn record(tag: u32) -> EnvRecord {
        let mut record = EnvRecord::factory_default(0x300);
        record.reserved[0] = tag;
        record
    }

    #[test]
    fn test_layout_is_valid() {
        assert_eq!(LAYOUT.validate(), Ok(()));
        assert_eq!(EnvStore::new(&LAYOUT).slots_per_bank(), 4);
    }

    #[test]
    fn blank_banks_report_no_environment() {
        let mut flash = RamFlash::<0x400>::new(0, 0x100);
        let store = EnvStore::new(&LAYOUT);
        assert_eq!(store.load(&mut flash), Err(EnvError::NoEnvironment));
    }

    #[test]
    fn appends_fill_slots_in_order() {
        let mut flash = RamFlash::<0x400>::new(0, 0x100);
        let store = EnvStore::new(&LAYOUT);

        for tag in 0..3 {
            assert_eq!(
                store.save(&mut flash, &record(tag)),
                Ok(SaveOutcome::Appended { slot: tag })
            );
        }

        let loaded = store.load(&mut flash).unwrap();
        assert_eq!(loaded.record.reserved[0], 2);
        assert_eq!(loaded.source, RecordSource::Primary { slot: 2 });
    }

    #[test]
    fn full_bank_compacts_to_single_record() {
        let mut flash = RamFlash::<0x400>::new(0, 0x100);
        let store = EnvStore::new(&LAYOUT);
        let slots = store.slots_per_bank();

        for tag in 0..slots {
            store.save(&mut flash, &record(tag)).unwrap();
        }
        assert_eq!(
            store.save(&mut flash, &record(99)),
            Ok(SaveOutcome::Compacted)
        );

        let occupancy = store.occupancy(&mut flash).unwrap();
        assert_eq!(occupancy.primary.sealed, 1);
        assert_eq!(occupancy.primary.blank, slots - 1);
        assert_eq!(occupancy.rescue.blank, slots);
        assert_eq!(store.load(&mut flash).unwrap().record.reserved[0], 99);
    }

    #[test]
    fn torn_slot_is_skipped_and_not_reused() {
        let mut flash = RamFlash::<0x400>::new(0, 0x100);
        let store = EnvStore::new(&LAYOUT);
        store.save(&mut flash, &record(1)).unwrap();

        flash.cut_after(10);
        assert!(store.save(&mut flash, &record(2)).is_err());
        flash.restore_power();

        assert_eq!(store.load(&mut flash).unwrap().record.reserved[0], 1);
        assert_eq!(
            store.save(&mut flash, &record(3)),
            Ok(SaveOutcome::Appended { slot: 2 })
        );
        assert_eq!(
            store.load(&mut flash).unwrap().source,
            RecordSource::Primary { slot: 2 }
        );
    }

    #[test]
    fn rescue_copy_is_adopted_and_bank_a_repaired() {
        let mut flash = RamFlash::<0x400>::new(0, 0x100);
        let store = EnvStore::new(&LAYOUT);
        store.save(&mut flash, &record(1)).unwrap();
        let rescue = record(7).with_flag(BootFlag::UpdateOk).encode();
        flash.program(0x400, &rescue).unwrap();

        let loaded = store.load(&mut flash).unwrap();

        assert_eq!(loaded.source, RecordSource::Rescue);
        assert_eq!(loaded.record.reserved[0], 7);
        let occupancy = store.occupancy(&mut flash).unwrap();
        assert_eq!(occupancy.primary.sealed, 1);
        assert_eq!(occupancy.rescue.sealed, 0);
        assert_eq!(
            store.load(&mut flash).unwrap().source,
            RecordSource::Primary { slot: 0 }
        );
    }

    #[test]
    fn inspect_reports_rescue_copy_without_repairing() {
        let mut flash = RamFlash::<0x400>::new(0, 0x100);
        let store = EnvStore::new(&LAYOUT);
        store.save(&mut flash, &record(1)).unwrap();
        flash.program(0x400, &record(7).encode()).unwrap();
        let steps = flash.steps();

        let inspected = store.inspect(&mut flash).unwrap();

        assert_eq!(inspected.source, RecordSource::Rescue);
        assert_eq!(inspected.record.reserved[0], 7);
        assert_eq!(flash.steps(), steps);
        assert_eq!(store.occupancy(&mut flash).unwrap().rescue.sealed, 1);
        assert_eq!(store.load(&mut flash).unwrap(), inspected);
    }

    #[test]
    fn leftover_rescue_copy_forces_compaction_on_save() {
        let mut flash = RamFlash::<0x400>::new(0, 0x100);
        let store = EnvStore::new(&LAYOUT);
        flash.program(0x400, &record(5).encode()).unwrap();

        assert_eq!(
            store.save(&mut flash, &record(6)),
            Ok(SaveOutcome::Compacted)
        );
        assert_eq!(store.load(&mut flash).unwrap().record.reserved[0], 6);
    }

    #[test]
    fn flash_failures_surface_unchanged() {
        let mut flash = RamFlash::<0x400>::new(0, 0x100);
        let store = EnvStore::new(&LAYOUT);
        flash.set_write_protection(true).unwrap();

        assert_eq!(
            store.save(&mut flash, &record(1)),
            Err(EnvError::Flash(FlashIoError::Program { address: 0 }))
        );
    }
}
