//! [`Flash`] implementation over the embassy blocking flash driver.
//!
//! The core speaks absolute addresses and 32-bit words; embassy wants byte
//! slices at offsets from the start of flash. Every program is read back and
//! compared so a silent write failure surfaces as `Verify`.

use bootloader_core::flash::{Flash, FlashIoError, WORD_BYTES, Word};
use embassy_stm32::flash::{Blocking, Flash as HalFlash};

use super::option_bytes;

/// Words moved per driver call.
const BURST_WORDS: usize = 16;
const BURST_BYTES: u32 = 64;

pub struct BootFlash<'d> {
    inner: HalFlash<'d, Blocking>,
    base: u32,
    page_size: u32,
}

impl<'d> BootFlash<'d> {
    pub fn new(inner: HalFlash<'d, Blocking>, base: u32, page_size: u32) -> Self {
        Self {
            inner,
            base,
            page_size,
        }
    }

    fn offset(&self, address: u32) -> Result<u32, FlashIoError> {
        if address % WORD_BYTES != 0 {
            return Err(FlashIoError::Misaligned { address });
        }
        address
            .checked_sub(self.base)
            .ok_or(FlashIoError::OutOfBounds { address })
    }

    fn read_burst(&mut self, words: &mut [Word], address: u32) -> Result<(), FlashIoError> {
        let offset = self.offset(address)?;
        let mut bytes = [0u8; BURST_BYTES as usize];
        let bytes = &mut bytes[..words.len() * WORD_BYTES as usize];
        self.inner
            .blocking_read(offset, bytes)
            .map_err(|_| FlashIoError::Read { address })?;
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = Word::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }
}

impl Flash for BootFlash<'_> {
    fn erase(&mut self, address: u32, bytes: u32) -> Result<(), FlashIoError> {
        if bytes == 0 {
            return Ok(());
        }
        let offset = self.offset(address)?;
        let from = offset - offset % self.page_size;
        let to = (offset + bytes).next_multiple_of(self.page_size);
        self.inner
            .blocking_erase(from, to)
            .map_err(|_| FlashIoError::Erase { address })
    }

    fn program(&mut self, address: u32, words: &[Word]) -> Result<(), FlashIoError> {
        let mut at = address;
        let mut readback = [0; BURST_WORDS];
        for burst in words.chunks(BURST_WORDS) {
            let offset = self.offset(at)?;
            let mut bytes = [0u8; BURST_BYTES as usize];
            for (chunk, word) in bytes.chunks_exact_mut(4).zip(burst) {
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            self.inner
                .blocking_write(offset, &bytes[..burst.len() * WORD_BYTES as usize])
                .map_err(|_| FlashIoError::Program { address: at })?;

            let readback = &mut readback[..burst.len()];
            self.read_burst(readback, at)?;
            let mut word_at = at;
            for (got, want) in readback.iter().zip(burst) {
                if got != want {
                    return Err(FlashIoError::Verify { address: word_at });
                }
                word_at += WORD_BYTES;
            }

            at += BURST_BYTES;
        }
        Ok(())
    }

    fn read(&mut self, buffer: &mut [Word], address: u32) -> Result<(), FlashIoError> {
        let mut at = address;
        for burst in buffer.chunks_mut(BURST_WORDS) {
            self.read_burst(burst, at)?;
            at += BURST_BYTES;
        }
        Ok(())
    }

    fn set_write_protection(&mut self, enabled: bool) -> Result<(), FlashIoError> {
        option_bytes::set_write_protection(enabled).map_err(|_| FlashIoError::WriteProtection)
    }
}
