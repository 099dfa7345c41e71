use core::panic::PanicInfo;
use defmt::error;

// A panic mid-swap is recovered by the next boot from the persisted phase.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    error!("PANIC: {}", defmt::Display2Format(info));
    cortex_m::peripheral::SCB::sys_reset();
}
