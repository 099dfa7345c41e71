use cortex_m::interrupt;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use embassy_stm32 as hal;

use bootloader_core::boot::{BootConfig, Bootloader};

use crate::hw::Board;
use crate::hw::flash::BootFlash;
use crate::telemetry::DefmtTelemetry;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

#[cortex_m_rt::entry]
fn main() -> ! {
    let config = BootConfig::DEFAULT;
    let hal::Peripherals { FLASH, .. } = hal::init(hal::Config::default());

    defmt::info!(
        "bootloader: current={=u32:#x} update={=u32:#x} scratch={=u32:#x}",
        config.layout.current.size,
        config.layout.update.size,
        config.layout.scratch.size
    );

    let flash = BootFlash::new(
        hal::flash::Flash::new_blocking(FLASH),
        config.layout.base,
        config.layout.page_size,
    );
    Bootloader::new(config, flash, DefmtTelemetry::new()).run(&mut Board::new())
}
