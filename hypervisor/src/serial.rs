//! PL011 UART console output.
//!
//! Logging must work from trap context, so the writer is a spin mutex
//! around a few register pokes and never allocates.

use core::fmt;
use spin::Mutex;

/// QEMU virt / typical SBSA PL011 base. Real hardware would discover this
/// from the SPCR table; the console subsystem proper is outside the core.
const PL011_BASE: u64 = 0x0900_0000;

const UARTDR: u64 = 0x00;
const UARTFR: u64 = 0x18;

const UARTFR_TXFF: u32 = 1 << 5;

pub fn base_phys() -> u64 {
    PL011_BASE
}

struct Pl011;

impl Pl011 {
    #[cfg(target_arch = "aarch64")]
    fn putb(&self, b: u8) {
        let base = crate::memory::phys_to_virt(PL011_BASE);
        unsafe {
            let fr = (base + UARTFR) as *const u32;
            while fr.read_volatile() & UARTFR_TXFF != 0 {
                core::hint::spin_loop();
            }
            ((base + UARTDR) as *mut u32).write_volatile(b as u32);
        }
    }

    #[cfg(not(target_arch = "aarch64"))]
    fn putb(&self, _b: u8) {}
}

impl fmt::Write for Pl011 {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            if b == b'\n' {
                self.putb(b'\r');
            }
            self.putb(b);
        }
        Ok(())
    }
}

static WRITER: Mutex<Pl011> = Mutex::new(Pl011);

pub fn init() {
    // The firmware already configured baud rate and line control; we only
    // ever transmit.
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = write!(WRITER.lock(), "{}", args);
}
