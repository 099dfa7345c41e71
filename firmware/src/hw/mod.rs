//! Board services for the STM32F103 target.
//!
//! [`Board`] supplies the blocking delay, the jump into the application and
//! the system reset that end the boot flow. Flash access lives in [`flash`].

pub mod flash;
mod option_bytes;

use core::time::Duration;

use bootloader_core::boot::{Delay, Platform};
use cortex_m::peripheral::{NVIC, SCB};

/// Interrupt clear-enable/clear-pending words covering every STM32F103 IRQ.
const NVIC_WORDS: usize = 2;

pub struct Board;

impl Board {
    pub const fn new() -> Self {
        Self
    }
}

impl Delay for Board {
    fn delay(&mut self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        embassy_time::block_for(embassy_time::Duration::from_micros(micros));
    }
}

impl Platform for Board {
    fn hand_off(&mut self, address: u32) -> ! {
        cortex_m::interrupt::disable();
        unsafe {
            let nvic = &*NVIC::PTR;
            for word in 0..NVIC_WORDS {
                nvic.icer[word].write(u32::MAX);
                nvic.icpr[word].write(u32::MAX);
            }

            (*SCB::PTR).vtor.write(address);
            cortex_m::asm::dsb();
            cortex_m::asm::isb();

            // Loads MSP and the reset vector from the image's vector table.
            cortex_m::asm::bootload(address as *const u32)
        }
    }

    fn reset(&mut self) -> ! {
        SCB::sys_reset()
    }
}
