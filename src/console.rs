//! Console glue: putbuf() output to the serial port and blocking keyboard
//! input for input_getc(). The keyboard ISR feeds a byte queue; readers
//! park on a semaphore until a key arrives.

use alloc::collections::VecDeque;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::scheduler::Semaphore;

static INPUT: Mutex<VecDeque<u8>> = Mutex::new(VecDeque::new());

lazy_static! {
    static ref INPUT_AVAILABLE: Semaphore = Semaphore::new(0);
}

/// Write SIZE bytes to the console.
pub fn putbuf(buf: &[u8]) {
    use core::fmt::Write;
    let mut serial = crate::serial::SERIAL1.lock();
    for &b in buf {
        if b == b'\n' {
            let _ = serial.write_str("\r");
        }
        serial.send(b);
    }
}

/// Block until a key is available, then return it.
pub fn input_getc() -> u8 {
    INPUT_AVAILABLE.down();
    INPUT.lock().pop_front().expect("input semaphore out of sync")
}

/// Queue one byte of input. Called from the keyboard ISR.
pub fn push_input(byte: u8) {
    INPUT.lock().push_back(byte);
    INPUT_AVAILABLE.up();
}

/// Scancode set 1 -> ASCII, unshifted. Unmapped keys and releases give 0.
pub fn scancode_to_ascii(scancode: u8) -> u8 {
    const MAP: [u8; 58] = [
        0, 27, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 8, b'\t',
        b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n', 0, b'a',
        b's', b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`', 0, b'\\', b'z', b'x',
        b'c', b'v', b'b', b'n', b'm', b',', b'.', b'/', 0, b'*', 0, b' ',
    ];
    if (scancode as usize) < MAP.len() {
        MAP[scancode as usize]
    } else {
        0
    }
}
