//! Flash primitive interface consumed by the bootloader core.
//!
//! Implementations wrap the MCU flash controller (or the RAM simulator in
//! [`sim`]). Every operation either completes or reports failure; there is no
//! partial-success reporting and nothing here retries.

pub mod sim;

use core::fmt;

/// Unit of programming and reading.
pub type Word = u32;

/// Value of a word after erase.
pub const ERASED_WORD: Word = 0xFFFF_FFFF;

pub const WORD_BYTES: u32 = 4;

/// Words moved per read/program burst by [`copy`].
pub const COPY_BUFFER_WORDS: u32 = 64;

/// Failure reported by a flash primitive. Addresses are absolute.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlashIoError {
    Erase { address: u32 },
    Program { address: u32 },
    /// Read-back after programming did not match.
    Verify { address: u32 },
    Read { address: u32 },
    OutOfBounds { address: u32 },
    Misaligned { address: u32 },
    WriteProtection,
}

impl fmt::Display for FlashIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashIoError::Erase { address } => write!(f, "erase failed at {address:#010x}"),
            FlashIoError::Program { address } => write!(f, "program failed at {address:#010x}"),
            FlashIoError::Verify { address } => write!(f, "verify failed at {address:#010x}"),
            FlashIoError::Read { address } => write!(f, "read failed at {address:#010x}"),
            FlashIoError::OutOfBounds { address } => {
                write!(f, "access past end of flash at {address:#010x}")
            }
            FlashIoError::Misaligned { address } => {
                write!(f, "unaligned access at {address:#010x}")
            }
            FlashIoError::WriteProtection => f.write_str("write protection change failed"),
        }
    }
}

/// Word-aligned NOR flash operations over an absolute address space.
pub trait Flash {
    /// Erases every erase unit touched by `[address, address + bytes)`.
    fn erase(&mut self, address: u32, bytes: u32) -> Result<(), FlashIoError>;

    /// Programs `words` starting at `address`, verifying each word by read-back.
    fn program(&mut self, address: u32, words: &[Word]) -> Result<(), FlashIoError>;

    /// Fills `buffer` from `address`; fails if the range crosses the end of flash.
    fn read(&mut self, buffer: &mut [Word], address: u32) -> Result<(), FlashIoError>;

    fn set_write_protection(&mut self, enabled: bool) -> Result<(), FlashIoError>;
}

impl<F: Flash + ?Sized> Flash for &mut F {
    fn erase(&mut self, address: u32, bytes: u32) -> Result<(), FlashIoError> {
        (**self).erase(address, bytes)
    }

    fn program(&mut self, address: u32, words: &[Word]) -> Result<(), FlashIoError> {
        (**self).program(address, words)
    }

    fn read(&mut self, buffer: &mut [Word], address: u32) -> Result<(), FlashIoError> {
        (**self).read(buffer, address)
    }

    fn set_write_protection(&mut self, enabled: bool) -> Result<(), FlashIoError> {
        (**self).set_write_protection(enabled)
    }
}

/// Number of words needed to hold `bytes`.
#[must_use]
pub const fn words_for(bytes: u32) -> u32 {
    bytes.div_ceil(WORD_BYTES)
}

/// Erases `destination` and streams `bytes` from `source` into it.
///
/// Both addresses must be word aligned; the byte count rounds up to whole
/// words. A zero-length copy touches nothing.
pub fn copy<F: Flash + ?Sized>(
    flash: &mut F,
    destination: u32,
    source: u32,
    bytes: u32,
) -> Result<(), FlashIoError> {
    if bytes == 0 {
        return Ok(());
    }

    flash.erase(destination, bytes)?;

    let total = words_for(bytes);
    let mut buffer = [ERASED_WORD; COPY_BUFFER_WORDS as usize];
    let mut done = 0u32;
    while done < total {
        let burst = (total - done).min(COPY_BUFFER_WORDS);
        let chunk = &mut buffer[..burst as usize];
        let offset = done * WORD_BYTES;
        flash.read(chunk, source + offset)?;
        flash.program(destination + offset, chunk)?;
        done += burst;
    }

    Ok(())
}
