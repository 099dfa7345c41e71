//! Flash region map shared by the log store, the swap engine, and the boot flow.
//!
//! Regions are expressed as offsets from the flash base so that the same
//! layout can be mounted on the simulator (base zero) or on real hardware.

use core::fmt;

use crate::env::record::RECORD_BYTES;

/// Contiguous span of flash relative to [`FlashLayout::base`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub offset: u32,
    pub size: u32,
}

impl Region {
    #[must_use]
    pub const fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    /// First offset past the end of the region.
    #[must_use]
    pub const fn end(self) -> u32 {
        self.offset + self.size
    }

    #[must_use]
    pub const fn overlaps(self, other: Region) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Identifies each region in diagnostics and layout errors.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegionId {
    EnvBankA,
    EnvBankB,
    Current,
    Update,
    Scratch,
}

impl RegionId {
    pub const ALL: [RegionId; 5] = [
        RegionId::EnvBankA,
        RegionId::EnvBankB,
        RegionId::Current,
        RegionId::Update,
        RegionId::Scratch,
    ];
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RegionId::EnvBankA => "env-bank-a",
            RegionId::EnvBankB => "env-bank-b",
            RegionId::Current => "current",
            RegionId::Update => "update",
            RegionId::Scratch => "scratch",
        };
        f.write_str(label)
    }
}

/// Reasons a layout cannot host the bootloader.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LayoutError {
    Misaligned(RegionId),
    Overlap(RegionId, RegionId),
    OutOfFlash(RegionId),
    BankSizeMismatch,
    BankTooSmall,
    AppSizeMismatch,
    ScratchTooLarge,
    EmptyScratch,
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::Misaligned(region) => write!(f, "{region} is not page aligned"),
            LayoutError::Overlap(a, b) => write!(f, "{a} overlaps {b}"),
            LayoutError::OutOfFlash(region) => write!(f, "{region} extends past end of flash"),
            LayoutError::BankSizeMismatch => f.write_str("environment banks differ in size"),
            LayoutError::BankTooSmall => {
                f.write_str("environment bank holds fewer than two record slots")
            }
            LayoutError::AppSizeMismatch => f.write_str("application regions differ in size"),
            LayoutError::ScratchTooLarge => {
                f.write_str("scratch region is not smaller than an application region")
            }
            LayoutError::EmptyScratch => f.write_str("scratch region is empty"),
        }
    }
}

/// Deployment constants describing where every region lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashLayout {
    /// Absolute address of offset zero.
    pub base: u32,
    pub flash_size: u32,
    /// Erase unit in bytes.
    pub page_size: u32,
    pub env_bank_a: Region,
    pub env_bank_b: Region,
    pub current: Region,
    pub update: Region,
    pub scratch: Region,
}

/// STM32F103xC: 256 KiB of 2 KiB pages with the bootloader in the first 24 KiB.
pub const STM32F103_LAYOUT: FlashLayout = FlashLayout {
    base: 0x0800_0000,
    flash_size: 0x0004_0000,
    page_size: 0x800,
    env_bank_a: Region::new(0x6000, 0x800),
    env_bank_b: Region::new(0x6800, 0x800),
    current: Region::new(0x7000, 0x1_9000),
    update: Region::new(0x2_0000, 0x1_9000),
    scratch: Region::new(0x3_9000, 0x5000),
};

impl FlashLayout {
    #[must_use]
    pub const fn region(&self, id: RegionId) -> Region {
        match id {
            RegionId::EnvBankA => self.env_bank_a,
            RegionId::EnvBankB => self.env_bank_b,
            RegionId::Current => self.current,
            RegionId::Update => self.update,
            RegionId::Scratch => self.scratch,
        }
    }

    /// Absolute address of `offset` bytes into `id`.
    #[must_use]
    pub const fn address(&self, id: RegionId, offset: u32) -> u32 {
        self.base + self.region(id).offset + offset
    }

    /// Number of whole record slots per environment bank.
    #[must_use]
    pub const fn slots_per_bank(&self) -> u32 {
        self.env_bank_a.size / RECORD_BYTES
    }

    /// Entry point handed to the application image: the start of its vector table.
    #[must_use]
    pub const fn application_entry(&self) -> u32 {
        self.address(RegionId::Current, 0)
    }

    /// Checks every structural constraint the swap engine and log store rely on.
    ///
    /// Page alignment matters beyond tidiness: copies erase whole pages, so a
    /// region that shares a page with its neighbour would lose data mid-swap.
    pub fn validate(&self) -> Result<(), LayoutError> {
        for id in RegionId::ALL {
            let region = self.region(id);
            if region.offset % self.page_size != 0 || region.size % self.page_size != 0 {
                return Err(LayoutError::Misaligned(id));
            }
            if region.end() > self.flash_size {
                return Err(LayoutError::OutOfFlash(id));
            }
        }

        for (index, first) in RegionId::ALL.iter().enumerate() {
            for second in &RegionId::ALL[index + 1..] {
                if self.region(*first).overlaps(self.region(*second)) {
                    return Err(LayoutError::Overlap(*first, *second));
                }
            }
        }

        if self.env_bank_a.size != self.env_bank_b.size {
            return Err(LayoutError::BankSizeMismatch);
        }
        if self.slots_per_bank() < 2 {
            return Err(LayoutError::BankTooSmall);
        }
        if self.current.size != self.update.size {
            return Err(LayoutError::AppSizeMismatch);
        }
        if self.scratch.size == 0 {
            return Err(LayoutError::EmptyScratch);
        }
        if self.scratch.size >= self.current.size {
            return Err(LayoutError::ScratchTooLarge);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> FlashLayout {
        FlashLayout {
            base: 0,
            flash_size: 0x4000,
            page_size: 0x400,
            env_bank_a: Region::new(0, 0x400),
            env_bank_b: Region::new(0x400, 0x400),
            current: Region::new(0x800, 0x1400),
            update: Region::new(0x1C00, 0x1400),
            scratch: Region::new(0x3000, 0x400),
        }
    }

    #[test]
    fn stm32f103_layout_is_valid() {
        assert_eq!(STM32F103_LAYOUT.validate(), Ok(()));
        assert_eq!(STM32F103_LAYOUT.slots_per_bank(), 8);
        assert_eq!(STM32F103_LAYOUT.application_entry(), 0x0800_7000);
    }

    #[test]
    fn rejects_overlapping_regions() {
        let mut layout = small();
        layout.scratch = Region::new(0x2C00, 0x400);
        assert_eq!(
            layout.validate(),
            Err(LayoutError::Overlap(RegionId::Update, RegionId::Scratch))
        );
    }

    #[test]
    fn rejects_unaligned_scratch() {
        let mut layout = small();
        layout.scratch = Region::new(0x3000, 0x300);
        assert_eq!(
            layout.validate(),
            Err(LayoutError::Misaligned(RegionId::Scratch))
        );
    }

    #[test]
    fn rejects_scratch_as_large_as_application() {
        let mut layout = small();
        layout.flash_size = 0x8000;
        layout.scratch = Region::new(0x4000, 0x1400);
        assert_eq!(layout.validate(), Err(LayoutError::ScratchTooLarge));
    }

    #[test]
    fn rejects_region_past_end_of_flash() {
        let mut layout = small();
        layout.scratch = Region::new(0x4000, 0x400);
        assert_eq!(
            layout.validate(),
            Err(LayoutError::OutOfFlash(RegionId::Scratch))
        );
    }

    #[test]
    fn rejects_single_slot_bank() {
        let mut layout = small();
        layout.page_size = 0x100;
        layout.env_bank_a = Region::new(0, 0x100);
        layout.env_bank_b = Region::new(0x400, 0x100);
        assert_eq!(layout.validate(), Err(LayoutError::BankTooSmall));
    }
}
