#![no_std]

// Portable core of the swap bootloader.
//
// Everything that decides what happens to flash lives here so that the MCU
// firmware and the host emulator run the same code. Hardware access comes in
// through the `flash::Flash` and `boot::Platform` traits.

pub mod app_env;
pub mod boot;
pub mod env;
pub mod flash;
pub mod layout;
pub mod swap;
pub mod telemetry;
