//! Environment access for the application that runs after the hand-off.
//!
//! The application owns the reserved words and is the only party that ever
//! asks for an update or confirms one. Every write appends through the same
//! log store the bootloader uses.

use core::fmt;

use crate::env::record::RESERVED_WORDS;
use crate::env::{BootFlag, EnvError, EnvRecord, EnvStore, ImageDescriptor, SwapProgress};
use crate::flash::{Flash, Word};
use crate::layout::FlashLayout;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AppEnvError {
    Env(EnvError),
    /// An update can only be requested from NORMAL.
    NotIdle(BootFlag),
    /// Only an unconfirmed update (UPDATE_COMPLETE) can be confirmed.
    NotAwaitingConfirmation(BootFlag),
    ReservedIndex(usize),
    EmptyImage,
    ImageTooLarge { size: u32, capacity: u32 },
}

impl fmt::Display for AppEnvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppEnvError::Env(err) => write!(f, "env: {err}"),
            AppEnvError::NotIdle(flag) => write!(f, "cannot request update while {flag}"),
            AppEnvError::NotAwaitingConfirmation(flag) => {
                write!(f, "nothing to confirm while {flag}")
            }
            AppEnvError::ReservedIndex(index) => {
                write!(f, "reserved index {index} out of range")
            }
            AppEnvError::EmptyImage => f.write_str("update image is empty"),
            AppEnvError::ImageTooLarge { size, capacity } => {
                write!(f, "image of {size:#x} bytes exceeds region of {capacity:#x}")
            }
        }
    }
}

impl From<EnvError> for AppEnvError {
    fn from(err: EnvError) -> Self {
        AppEnvError::Env(err)
    }
}

pub struct AppEnv {
    store: EnvStore,
    capacity: u32,
}

impl AppEnv {
    #[must_use]
    pub const fn new(layout: &FlashLayout) -> Self {
        Self {
            store: EnvStore::new(layout),
            capacity: layout.update.size,
        }
    }

    pub fn read<F: Flash + ?Sized>(&self, flash: &mut F) -> Result<EnvRecord, AppEnvError> {
        Ok(self.store.load(flash)?.record)
    }

    pub fn reserved<F: Flash + ?Sized>(
        &self,
        flash: &mut F,
        index: usize,
    ) -> Result<Word, AppEnvError> {
        let record = self.read(flash)?;
        record
            .reserved
            .get(index)
            .copied()
            .ok_or(AppEnvError::ReservedIndex(index))
    }

    pub fn set_reserved<F: Flash + ?Sized>(
        &self,
        flash: &mut F,
        index: usize,
        value: Word,
    ) -> Result<EnvRecord, AppEnvError> {
        if index >= RESERVED_WORDS {
            return Err(AppEnvError::ReservedIndex(index));
        }
        let mut record = self.read(flash)?;
        record.reserved[index] = value;
        self.write(flash, record)
    }

    /// Describes the image staged in the update region and arms the swap
    /// for the next reset.
    pub fn request_update<F: Flash + ?Sized>(
        &self,
        flash: &mut F,
        image: ImageDescriptor,
    ) -> Result<EnvRecord, AppEnvError> {
        if image.size == 0 {
            return Err(AppEnvError::EmptyImage);
        }
        if image.size > self.capacity {
            return Err(AppEnvError::ImageTooLarge {
                size: image.size,
                capacity: self.capacity,
            });
        }

        let mut record = self.read(flash)?;
        if record.boot_flag != BootFlag::Normal {
            return Err(AppEnvError::NotIdle(record.boot_flag));
        }
        record.image_update = image;
        let record = record
            .with_flag(BootFlag::Update)
            .with_progress(SwapProgress::ZERO);
        self.write(flash, record)
    }

    /// Marks the running update as good so the next reset commits it.
    pub fn confirm_update<F: Flash + ?Sized>(
        &self,
        flash: &mut F,
    ) -> Result<EnvRecord, AppEnvError> {
        let record = self.read(flash)?;
        if record.boot_flag != BootFlag::UpdateComplete {
            return Err(AppEnvError::NotAwaitingConfirmation(record.boot_flag));
        }
        self.write(flash, record.with_flag(BootFlag::UpdateOk))
    }

    fn write<F: Flash + ?Sized>(
        &self,
        flash: &mut F,
        record: EnvRecord,
    ) -> Result<EnvRecord, AppEnvError> {
        self.store.save(flash, &record)?;
        Ok(record)
    }
}
