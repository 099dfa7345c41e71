//! Boot decision state machine.
//!
//! Runs once per power-on: load the environment, pick a [`Decision`] from its
//! boot flag, move image data if the decision calls for it, persist the next
//! flag, and finally hand control to the application or reset. The record is
//! threaded through each stage by value.

use core::fmt;
use core::time::Duration;

use crate::env::{BootFlag, EnvError, EnvRecord, EnvStore, Loaded, SwapPhase};
use crate::flash::{Flash, FlashIoError};
use crate::layout::{FlashLayout, LayoutError, STM32F103_LAYOUT};
use crate::swap::{SwapEngine, SwapError};
use crate::telemetry::{BootEvent, TelemetrySink};

/// Action chosen for the boot flag found at power-on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// NORMAL: jump straight to the current image.
    BootDirect,
    /// UPDATE: finish exchanging the images, then boot the new one.
    ContinueUpdate,
    /// UPDATE_COMPLETE: the new image never confirmed itself; restore the old one.
    Rollback,
    /// UPDATE_OK: the new image confirmed itself.
    Commit,
}

impl Decision {
    #[must_use]
    pub const fn for_flag(flag: BootFlag) -> Self {
        match flag {
            BootFlag::Normal => Decision::BootDirect,
            BootFlag::Update => Decision::ContinueUpdate,
            BootFlag::UpdateComplete => Decision::Rollback,
            BootFlag::UpdateOk => Decision::Commit,
        }
    }

    /// Flag persisted once the decision has been carried out, or `None` when
    /// the flag stays as it is.
    #[must_use]
    pub const fn next_flag(self) -> Option<BootFlag> {
        match self {
            Decision::BootDirect => None,
            Decision::ContinueUpdate => Some(BootFlag::UpdateComplete),
            Decision::Rollback | Decision::Commit => Some(BootFlag::Normal),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Decision::BootDirect => "boot-direct",
            Decision::ContinueUpdate => "continue-update",
            Decision::Rollback => "rollback",
            Decision::Commit => "commit",
        };
        f.write_str(label)
    }
}

/// Anything that stops the boot flow short of a hand-off.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BootError {
    Layout(LayoutError),
    Flash(FlashIoError),
    Env(EnvError),
    Swap(SwapError),
    /// The record combines a flag and progress that no transition produces.
    Inconsistent { flag: BootFlag, phase: SwapPhase },
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::Layout(err) => write!(f, "layout: {err}"),
            BootError::Flash(err) => write!(f, "flash: {err}"),
            BootError::Env(err) => write!(f, "env: {err}"),
            BootError::Swap(err) => write!(f, "swap: {err}"),
            BootError::Inconsistent { flag, phase } => {
                write!(f, "inconsistent record: flag {flag} with phase {phase}")
            }
        }
    }
}

impl From<LayoutError> for BootError {
    fn from(err: LayoutError) -> Self {
        BootError::Layout(err)
    }
}

impl From<FlashIoError> for BootError {
    fn from(err: FlashIoError) -> Self {
        BootError::Flash(err)
    }
}

impl From<EnvError> for BootError {
    fn from(err: EnvError) -> Self {
        BootError::Env(err)
    }
}

impl From<SwapError> for BootError {
    fn from(err: SwapError) -> Self {
        BootError::Swap(err)
    }
}

/// Deployment configuration for the boot flow.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BootConfig {
    pub layout: FlashLayout,
    /// Pause before the hand-off so pending log output can drain.
    pub handoff_settle: Duration,
    /// Logged countdown before a fatal reset.
    pub reset_countdown: Duration,
    /// Re-enable flash write protection just before the hand-off.
    pub protect_on_handoff: bool,
}

impl BootConfig {
    pub const DEFAULT: Self = Self::new(STM32F103_LAYOUT);

    #[must_use]
    pub const fn new(layout: FlashLayout) -> Self {
        Self {
            layout,
            handoff_settle: Duration::from_millis(500),
            reset_countdown: Duration::from_secs(3),
            protect_on_handoff: false,
        }
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Outcome of a successful [`Bootloader::boot`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootReport {
    /// Address of the application's vector table.
    pub entry: u32,
    pub decision: Decision,
    /// Record as persisted (or found, for a direct boot).
    pub record: EnvRecord,
}

/// Where the boot flow ends up.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Terminal {
    Handoff { address: u32 },
    Reset,
}

/// Blocking delay provider.
pub trait Delay {
    fn delay(&mut self, duration: Duration);
}

/// Board services that end the boot flow.
pub trait Platform: Delay {
    /// Transfers control to the image whose vector table starts at `address`.
    /// Irreversible.
    fn hand_off(&mut self, address: u32) -> !;

    fn reset(&mut self) -> !;
}

pub struct Bootloader<F, T> {
    config: BootConfig,
    store: EnvStore,
    engine: SwapEngine,
    flash: F,
    telemetry: T,
}

impl<F, T> Bootloader<F, T>
where
    F: Flash,
    T: TelemetrySink,
{
    #[must_use]
    pub fn new(config: BootConfig, flash: F, telemetry: T) -> Self {
        Self {
            store: EnvStore::new(&config.layout),
            engine: SwapEngine::new(&config.layout),
            config,
            flash,
            telemetry,
        }
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn telemetry(&self) -> &T {
        &self.telemetry
    }

    pub fn into_parts(self) -> (F, T) {
        (self.flash, self.telemetry)
    }

    /// Runs the decision for this power-on and persists its result.
    pub fn boot(&mut self) -> Result<BootReport, BootError> {
        self.config.layout.validate()?;

        self.flash.set_write_protection(false)?;
        self.telemetry
            .record(BootEvent::WriteProtection { enabled: false });

        let record = self.load_or_initialize()?;
        check_consistency(&record)?;

        let decision = Decision::for_flag(record.boot_flag);
        self.telemetry.record(BootEvent::Decided(decision));

        let record = match decision {
            Decision::BootDirect | Decision::Commit => record,
            Decision::ContinueUpdate => {
                self.engine
                    .swap(&mut self.flash, record, &mut self.telemetry)?
            }
            Decision::Rollback => {
                self.engine
                    .restore(&mut self.flash, record, &mut self.telemetry)?
            }
        };

        let record = match decision.next_flag() {
            Some(flag) => self.persist(record.with_flag(flag))?,
            None => record,
        };

        if self.config.protect_on_handoff {
            self.flash.set_write_protection(true)?;
            self.telemetry
                .record(BootEvent::WriteProtection { enabled: true });
        }

        Ok(BootReport {
            entry: self.config.layout.application_entry(),
            decision,
            record,
        })
    }

    /// Boots, then waits out the settle or reset delay. Never fails: every
    /// error turns into [`Terminal::Reset`].
    pub fn execute<D: Delay + ?Sized>(&mut self, delay: &mut D) -> Terminal {
        match self.boot() {
            Ok(report) => {
                self.telemetry.record(BootEvent::HandOff {
                    address: report.entry,
                });
                delay.delay(self.config.handoff_settle);
                Terminal::Handoff {
                    address: report.entry,
                }
            }
            Err(err) => {
                self.telemetry.record(BootEvent::Fatal(err));
                let seconds =
                    u32::try_from(self.config.reset_countdown.as_secs()).unwrap_or(u32::MAX);
                for remaining_secs in (1..=seconds).rev() {
                    self.telemetry
                        .record(BootEvent::ResetCountdown { remaining_secs });
                    delay.delay(Duration::from_secs(1));
                }
                Terminal::Reset
            }
        }
    }

    /// Boots and ends in the platform's hand-off or reset.
    pub fn run<P: Platform>(mut self, platform: &mut P) -> ! {
        match self.execute(platform) {
            Terminal::Handoff { address } => platform.hand_off(address),
            Terminal::Reset => platform.reset(),
        }
    }

    fn load_or_initialize(&mut self) -> Result<EnvRecord, BootError> {
        match self.store.load(&mut self.flash) {
            Ok(Loaded { record, source }) => {
                self.telemetry.record(BootEvent::EnvironmentLoaded {
                    flag: record.boot_flag,
                    source,
                });
                Ok(record)
            }
            Err(EnvError::NoEnvironment) => {
                let record = EnvRecord::factory_default(self.config.layout.current.size);
                self.store.save(&mut self.flash, &record)?;
                self.telemetry.record(BootEvent::EnvironmentInitialized);
                Ok(record)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn persist(&mut self, record: EnvRecord) -> Result<EnvRecord, BootError> {
        let outcome = self.store.save(&mut self.flash, &record)?;
        self.telemetry.record(BootEvent::EnvironmentSaved {
            flag: record.boot_flag,
            outcome,
        });
        Ok(record)
    }
}

// Only UPDATE records may be caught mid-swap, and only UPDATE_COMPLETE
// records may carry a rollback byte count.
fn check_consistency(record: &EnvRecord) -> Result<(), BootError> {
    let progress = record.swap_progress;
    let consistent = match record.boot_flag {
        BootFlag::Update => true,
        BootFlag::UpdateComplete => {
            progress.phase == SwapPhase::Init
                && progress.origin_offset == 0
                && progress.carried_size == 0
                && progress.update_offset <= record.image_update.size
        }
        BootFlag::Normal | BootFlag::UpdateOk => progress.is_zero(),
    };

    if consistent {
        Ok(())
    } else {
        Err(BootError::Inconsistent {
            flag: record.boot_flag,
            phase: progress.phase,
        })
    }
}
