//! Whole-chip write protection through the STM32F1 option bytes.
//!
//! The WRP option bytes are only reloaded into `FLASH_WRPR` on reset, so a
//! change made here takes effect from the next boot. Until then erases and
//! programs keep failing, which the boot flow turns into a logged reset.
//!
//! `FLASH_WRPR` therefore says nothing about what a request earlier in the
//! same boot wrote. The programmed option bytes are the state to compare.

use core::ptr;

const FLASH_KEYR: *mut u32 = 0x4002_2004 as *mut u32;
const FLASH_OPTKEYR: *mut u32 = 0x4002_2008 as *mut u32;
const FLASH_SR: *mut u32 = 0x4002_200C as *mut u32;
const FLASH_CR: *mut u32 = 0x4002_2010 as *mut u32;
const FLASH_OBR: *const u32 = 0x4002_201C as *const u32;

const OB_RDP: *mut u16 = 0x1FFF_F800 as *mut u16;
const OB_USER: *mut u16 = 0x1FFF_F802 as *mut u16;
const OB_DATA0: *mut u16 = 0x1FFF_F804 as *mut u16;
const OB_DATA1: *mut u16 = 0x1FFF_F806 as *mut u16;
const OB_WRP: [*mut u16; 4] = [
    0x1FFF_F808 as *mut u16,
    0x1FFF_F80A as *mut u16,
    0x1FFF_F80C as *mut u16,
    0x1FFF_F80E as *mut u16,
];

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xCDEF_89AB;
const RDP_KEY: u16 = 0x00A5;

const SR_BSY: u32 = 1 << 0;
const SR_PGERR: u32 = 1 << 2;
const SR_WRPRTERR: u32 = 1 << 4;
const SR_EOP: u32 = 1 << 5;

const CR_OPTPG: u32 = 1 << 4;
const CR_OPTER: u32 = 1 << 5;
const CR_STRT: u32 = 1 << 6;
const CR_LOCK: u32 = 1 << 7;
const CR_OPTWRE: u32 = 1 << 9;

const OBR_RDPRT: u32 = 1 << 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OptionBytesError {
    /// Read protection is active; rewriting RDP would mass-erase the chip.
    ReadProtected,
    Program,
}

const WRP_PROTECT_ALL: u16 = 0x00;
const WRP_PROTECT_NONE: u16 = 0xFF;

pub fn set_write_protection(enabled: bool) -> Result<(), OptionBytesError> {
    let programmed = OB_WRP.map(|half| unsafe { ptr::read_volatile(half) });
    if programmed_as(programmed, enabled) {
        return Ok(());
    }

    let obr = unsafe { ptr::read_volatile(FLASH_OBR) };
    if obr & OBR_RDPRT != 0 {
        return Err(OptionBytesError::ReadProtected);
    }

    // USER keeps WDG_SW, nRST_STOP and nRST_STDBY; the data bytes are preserved.
    let user = 0xF8 | ((obr >> 2) & 0x7);
    let data0 = (obr >> 10) & 0xFF;
    let data1 = (obr >> 18) & 0xFF;
    let wrp = wrp_byte(enabled);

    unsafe {
        unlock();
        let result = erase().and_then(|()| {
            program(OB_RDP, RDP_KEY)?;
            program(OB_USER, low_half(user))?;
            program(OB_DATA0, low_half(data0))?;
            program(OB_DATA1, low_half(data1))?;
            for byte in OB_WRP {
                program(byte, wrp)?;
            }
            Ok(())
        });
        lock();
        result
    }
}

const fn wrp_byte(enabled: bool) -> u16 {
    if enabled { WRP_PROTECT_ALL } else { WRP_PROTECT_NONE }
}

/// Whether the WRP option bytes already select `enabled` for every sector.
///
/// Each option byte sits in the low half of its word with the complement
/// above it; an erased word reads `0xFFFF`.
fn programmed_as(wrp: [u16; 4], enabled: bool) -> bool {
    let wanted = wrp_byte(enabled);
    wrp.iter().all(|&half| half & 0xFF == wanted)
}

fn low_half(value: u32) -> u16 {
    u16::try_from(value & 0xFFFF).unwrap_or(u16::MAX)
}

unsafe fn unlock() {
    unsafe {
        if ptr::read_volatile(FLASH_CR) & CR_LOCK != 0 {
            ptr::write_volatile(FLASH_KEYR, KEY1);
            ptr::write_volatile(FLASH_KEYR, KEY2);
        }
        if ptr::read_volatile(FLASH_CR) & CR_OPTWRE == 0 {
            ptr::write_volatile(FLASH_OPTKEYR, KEY1);
            ptr::write_volatile(FLASH_OPTKEYR, KEY2);
        }
    }
}

unsafe fn lock() {
    unsafe {
        let cr = ptr::read_volatile(FLASH_CR);
        ptr::write_volatile(FLASH_CR, (cr & !(CR_OPTPG | CR_OPTER | CR_OPTWRE)) | CR_LOCK);
    }
}

unsafe fn erase() -> Result<(), OptionBytesError> {
    unsafe {
        wait_idle()?;
        set_cr(CR_OPTER);
        set_cr(CR_STRT);
        let result = wait_idle();
        clear_cr(CR_OPTER);
        result
    }
}

unsafe fn program(address: *mut u16, value: u16) -> Result<(), OptionBytesError> {
    unsafe {
        set_cr(CR_OPTPG);
        ptr::write_volatile(address, value);
        let result = wait_idle();
        clear_cr(CR_OPTPG);
        result
    }
}

unsafe fn wait_idle() -> Result<(), OptionBytesError> {
    unsafe {
        while ptr::read_volatile(FLASH_SR) & SR_BSY != 0 {}
        let sr = ptr::read_volatile(FLASH_SR);
        ptr::write_volatile(FLASH_SR, SR_EOP | SR_PGERR | SR_WRPRTERR);
        if sr & (SR_PGERR | SR_WRPRTERR) != 0 {
            return Err(OptionBytesError::Program);
        }
        Ok(())
    }
}

unsafe fn set_cr(bits: u32) {
    unsafe {
        let cr = ptr::read_volatile(FLASH_CR);
        ptr::write_volatile(FLASH_CR, cr | bits);
    }
}

unsafe fn clear_cr(bits: u32) {
    unsafe {
        let cr = ptr::read_volatile(FLASH_CR);
        ptr::write_volatile(FLASH_CR, cr & !bits);
    }
}
