#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

mod telemetry;

#[cfg(target_os = "none")]
mod hw;
#[cfg(target_os = "none")]
mod panic;
#[cfg(target_os = "none")]
mod runtime;

#[cfg(all(test, not(target_os = "none")))]
#[allow(dead_code)]
#[path = "hw/option_bytes.rs"]
mod option_bytes;

#[cfg(not(target_os = "none"))]
fn main() {}
