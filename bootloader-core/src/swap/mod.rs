//! Resumable exchange of the current and update regions through scratch.
//!
//! Each chunk moves in three persisted phases:
//!
//! 1. current → scratch, at `origin_offset`
//! 2. update → current, at `update_offset`
//! 3. scratch → update, at `origin_offset`
//!
//! A phase only overwrites data that an earlier persisted phase already
//! copied elsewhere, and its source is untouched until the next phase runs.
//! Re-running the phase named by the persisted marker is therefore always
//! safe, which is all that resumption after a power cut requires.

use core::fmt;

use crate::env::{EnvError, EnvRecord, EnvStore, SwapPhase, SwapProgress};
use crate::flash::{self, Flash, FlashIoError};
use crate::layout::{FlashLayout, RegionId};
use crate::telemetry::{BootEvent, TelemetrySink};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwapError {
    Flash(FlashIoError),
    Env(EnvError),
    /// An image descriptor claims more bytes than an application region holds.
    ImageTooLarge { size: u32, capacity: u32 },
    /// Persisted progress points outside the images it describes.
    ProgressOutOfRange,
    /// The layout has no scratch region to move chunks through.
    NoScratch,
}

impl fmt::Display for SwapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapError::Flash(err) => write!(f, "flash: {err}"),
            SwapError::Env(err) => write!(f, "env: {err}"),
            SwapError::ImageTooLarge { size, capacity } => {
                write!(f, "image of {size:#x} bytes exceeds region of {capacity:#x}")
            }
            SwapError::ProgressOutOfRange => f.write_str("swap progress out of range"),
            SwapError::NoScratch => f.write_str("no scratch region"),
        }
    }
}

impl From<FlashIoError> for SwapError {
    fn from(err: FlashIoError) -> Self {
        SwapError::Flash(err)
    }
}

impl From<EnvError> for SwapError {
    fn from(err: EnvError) -> Self {
        SwapError::Env(err)
    }
}

/// Result of a single [`SwapEngine::step`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// The phase completed and was persisted.
    Advanced(SwapPhase),
    /// Both images are exchanged; descriptors are swapped and progress zeroed,
    /// but nothing has been persisted yet.
    Finished,
}

/// Chunk iterations needed to exchange images of the given sizes.
///
/// Zero when there is no scratch to move chunks through.
#[must_use]
pub const fn iterations(current_size: u32, update_size: u32, scratch_size: u32) -> u32 {
    if scratch_size == 0 {
        return 0;
    }
    let current = current_size.div_ceil(scratch_size);
    let update = update_size.div_ceil(scratch_size);
    if current > update { current } else { update }
}

pub struct SwapEngine {
    layout: FlashLayout,
    store: EnvStore,
}

impl SwapEngine {
    #[must_use]
    pub const fn new(layout: &FlashLayout) -> Self {
        Self {
            layout: *layout,
            store: EnvStore::new(layout),
        }
    }

    /// Runs phases until both images have traded places.
    ///
    /// Resumes from whatever phase `record` says was last persisted. The
    /// returned record still carries the caller's boot flag.
    pub fn swap<F, T>(
        &self,
        flash: &mut F,
        mut record: EnvRecord,
        telemetry: &mut T,
    ) -> Result<EnvRecord, SwapError>
    where
        F: Flash + ?Sized,
        T: TelemetrySink + ?Sized,
    {
        loop {
            match self.step(flash, record, telemetry)? {
                (finished, StepOutcome::Finished) => return Ok(finished),
                (advanced, StepOutcome::Advanced(_)) => record = advanced,
            }
        }
    }

    /// Executes at most one phase and persists the record it produces.
    pub fn step<F, T>(
        &self,
        flash: &mut F,
        record: EnvRecord,
        telemetry: &mut T,
    ) -> Result<(EnvRecord, StepOutcome), SwapError>
    where
        F: Flash + ?Sized,
        T: TelemetrySink + ?Sized,
    {
        self.check_swap(&record)?;

        let progress = record.swap_progress;
        let current_size = record.image_current.size;
        let update_size = record.image_update.size;
        let scratch = self.layout.scratch.size;

        let next = match progress.phase {
            SwapPhase::Init | SwapPhase::SwapToUpdateDone => {
                if progress.origin_offset == current_size && progress.update_offset == update_size
                {
                    let mut finished = record;
                    core::mem::swap(&mut finished.image_current, &mut finished.image_update);
                    telemetry.record(BootEvent::SwapFinished);
                    return Ok((finished.with_progress(SwapProgress::ZERO), StepOutcome::Finished));
                }

                let chunk = scratch.min(current_size - progress.origin_offset);
                flash::copy(
                    flash,
                    self.layout.address(RegionId::Scratch, 0),
                    self.layout.address(RegionId::Current, progress.origin_offset),
                    chunk,
                )?;
                SwapProgress {
                    carried_size: chunk,
                    phase: SwapPhase::UserToSwapDone,
                    ..progress
                }
            }
            SwapPhase::UserToSwapDone => {
                let chunk = scratch.min(update_size - progress.update_offset);
                flash::copy(
                    flash,
                    self.layout.address(RegionId::Current, progress.update_offset),
                    self.layout.address(RegionId::Update, progress.update_offset),
                    chunk,
                )?;
                SwapProgress {
                    update_offset: progress.update_offset + chunk,
                    phase: SwapPhase::UpdateToUserDone,
                    ..progress
                }
            }
            SwapPhase::UpdateToUserDone => {
                flash::copy(
                    flash,
                    self.layout.address(RegionId::Update, progress.origin_offset),
                    self.layout.address(RegionId::Scratch, 0),
                    progress.carried_size,
                )?;
                SwapProgress {
                    origin_offset: progress.origin_offset + progress.carried_size,
                    carried_size: 0,
                    phase: SwapPhase::SwapToUpdateDone,
                    ..progress
                }
            }
        };

        let record = record.with_progress(next);
        self.store.save(flash, &record)?;
        telemetry.record(BootEvent::SwapPhaseDone {
            phase: next.phase,
            origin_offset: next.origin_offset,
            update_offset: next.update_offset,
        });
        Ok((record, StepOutcome::Advanced(next.phase)))
    }

    /// Copies the image held in the update region back over the current
    /// region, one scratch-sized chunk at a time.
    ///
    /// `swap_progress.update_offset` counts the bytes already copied and is
    /// persisted after every chunk. On return `image_current` describes the
    /// restored image and progress is zeroed; nothing else is persisted.
    pub fn restore<F, T>(
        &self,
        flash: &mut F,
        mut record: EnvRecord,
        telemetry: &mut T,
    ) -> Result<EnvRecord, SwapError>
    where
        F: Flash + ?Sized,
        T: TelemetrySink + ?Sized,
    {
        let total = record.image_update.size;
        self.check_scratch()?;
        self.check_fits(total)?;
        let progress = record.swap_progress;
        if progress.phase != SwapPhase::Init
            || progress.origin_offset != 0
            || progress.carried_size != 0
            || progress.update_offset > total
        {
            return Err(SwapError::ProgressOutOfRange);
        }

        let mut copied = progress.update_offset;
        while copied < total {
            let chunk = self.layout.scratch.size.min(total - copied);
            flash::copy(
                flash,
                self.layout.address(RegionId::Current, copied),
                self.layout.address(RegionId::Update, copied),
                chunk,
            )?;
            copied += chunk;
            record = record.with_progress(SwapProgress {
                update_offset: copied,
                ..SwapProgress::ZERO
            });
            self.store.save(flash, &record)?;
            telemetry.record(BootEvent::RestoreChunk { copied, total });
        }

        record.image_current = record.image_update;
        telemetry.record(BootEvent::RestoreFinished);
        Ok(record.with_progress(SwapProgress::ZERO))
    }

    fn check_fits(&self, size: u32) -> Result<(), SwapError> {
        let capacity = self.layout.current.size.min(self.layout.update.size);
        if size > capacity {
            return Err(SwapError::ImageTooLarge { size, capacity });
        }
        Ok(())
    }

    fn check_scratch(&self) -> Result<(), SwapError> {
        if self.layout.scratch.size == 0 {
            return Err(SwapError::NoScratch);
        }
        Ok(())
    }

    fn check_swap(&self, record: &EnvRecord) -> Result<(), SwapError> {
        self.check_scratch()?;
        self.check_fits(record.image_current.size)?;
        self.check_fits(record.image_update.size)?;

        let progress = record.swap_progress;
        if progress.origin_offset > record.image_current.size
            || progress.update_offset > record.image_update.size
            || progress.carried_size > self.layout.scratch.size
            || progress.origin_offset + progress.carried_size > record.image_current.size
        {
            return Err(SwapError::ProgressOutOfRange);
        }
        Ok(())
    }
}
