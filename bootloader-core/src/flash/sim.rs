//! RAM-backed NOR flash with power-cut injection.
//!
//! Programming can only clear bits and erase works on whole pages, matching
//! the hardware closely enough that torn writes and half-finished erases look
//! the way they would after a real brown-out. Each page erase and each word
//! program counts as one step; [`RamFlash::cut_after`] arms a budget of steps
//! after which the part goes dark until [`RamFlash::restore_power`].

use super::{ERASED_WORD, Flash, FlashIoError, WORD_BYTES, Word};

pub struct RamFlash<const WORDS: usize> {
    base: u32,
    page_size: u32,
    cells: [Word; WORDS],
    write_protected: bool,
    budget: Option<u32>,
    powered: bool,
    erases: u32,
    programs: u32,
}

impl<const WORDS: usize> RamFlash<WORDS> {
    /// Creates a fully erased part mapped at `base`.
    #[must_use]
    pub const fn new(base: u32, page_size: u32) -> Self {
        Self {
            base,
            page_size,
            cells: [ERASED_WORD; WORDS],
            write_protected: false,
            budget: None,
            powered: true,
            erases: 0,
            programs: 0,
        }
    }

    /// Allows `steps` more page erases or word programs, then cuts power.
    pub fn cut_after(&mut self, steps: u32) {
        self.budget = Some(steps);
    }

    pub fn restore_power(&mut self) {
        self.powered = true;
        self.budget = None;
    }

    #[must_use]
    pub fn is_powered(&self) -> bool {
        self.powered
    }

    #[must_use]
    pub fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    #[must_use]
    pub fn erase_count(&self) -> u32 {
        self.erases
    }

    #[must_use]
    pub fn program_count(&self) -> u32 {
        self.programs
    }

    /// Total mutating steps performed since creation.
    #[must_use]
    pub fn steps(&self) -> u32 {
        self.erases + self.programs
    }

    /// Raw view of `words` cells starting at `address`, bypassing power state.
    #[must_use]
    pub fn peek(&self, address: u32, words: usize) -> Option<&[Word]> {
        let start = self.index(address).ok()?;
        self.cells.get(start..start.checked_add(words)?)
    }

    fn index(&self, address: u32) -> Result<usize, FlashIoError> {
        if address % WORD_BYTES != 0 {
            return Err(FlashIoError::Misaligned { address });
        }
        let offset = address
            .checked_sub(self.base)
            .ok_or(FlashIoError::OutOfBounds { address })?;
        let index = (offset / WORD_BYTES) as usize;
        if index >= WORDS {
            return Err(FlashIoError::OutOfBounds { address });
        }
        Ok(index)
    }

    fn range(&self, address: u32, words: usize) -> Result<usize, FlashIoError> {
        let start = self.index(address)?;
        match start.checked_add(words) {
            Some(end) if end <= WORDS => Ok(start),
            _ => Err(FlashIoError::OutOfBounds { address }),
        }
    }

    fn spend_step(&mut self) -> bool {
        if !self.powered {
            return false;
        }
        match self.budget {
            Some(0) => {
                self.powered = false;
                false
            }
            Some(remaining) => {
                self.budget = Some(remaining - 1);
                true
            }
            None => true,
        }
    }
}

impl<const WORDS: usize> Flash for RamFlash<WORDS> {
    fn erase(&mut self, address: u32, bytes: u32) -> Result<(), FlashIoError> {
        if !self.powered || self.write_protected {
            return Err(FlashIoError::Erase { address });
        }
        if bytes == 0 {
            return Ok(());
        }

        let offset = address
            .checked_sub(self.base)
            .ok_or(FlashIoError::OutOfBounds { address })?;
        let first_page = offset / self.page_size;
        let last_page = (offset + (bytes - 1)) / self.page_size;
        let page_words = (self.page_size / WORD_BYTES) as usize;
        self.range(
            self.base + first_page * self.page_size,
            (last_page - first_page + 1) as usize * page_words,
        )?;

        for page in first_page..=last_page {
            let start = self.base + page * self.page_size;
            if !self.spend_step() {
                return Err(FlashIoError::Erase { address: start });
            }
            let index = self.index(start)?;
            self.cells[index..index + page_words].fill(ERASED_WORD);
            self.erases += 1;
        }

        Ok(())
    }

    fn program(&mut self, address: u32, words: &[Word]) -> Result<(), FlashIoError> {
        if !self.powered || self.write_protected {
            return Err(FlashIoError::Program { address });
        }
        let start = self.range(address, words.len())?;

        let mut at = address;
        for (cell, value) in self.cells[start..start + words.len()].iter_mut().zip(words) {
            match self.budget {
                Some(0) => {
                    self.powered = false;
                    return Err(FlashIoError::Program { address: at });
                }
                Some(remaining) => self.budget = Some(remaining - 1),
                None => {}
            }
            *cell &= *value;
            self.programs += 1;
            if *cell != *value {
                return Err(FlashIoError::Verify { address: at });
            }
            at += WORD_BYTES;
        }

        Ok(())
    }

    fn read(&mut self, buffer: &mut [Word], address: u32) -> Result<(), FlashIoError> {
        if !self.powered {
            return Err(FlashIoError::Read { address });
        }
        let start = self.range(address, buffer.len())?;
        buffer.copy_from_slice(&self.cells[start..start + buffer.len()]);
        Ok(())
    }

    fn set_write_protection(&mut self, enabled: bool) -> Result<(), FlashIoError> {
        if !self.powered {
            return Err(FlashIoError::WriteProtection);
        }
        self.write_protected = enabled;
        Ok(())
    }
}
