//! PS/2 keyboard input queue. IRQ1 pushes translated bytes; `input_getc`
//! blocks on a counting semaphore until a byte arrives, so `read(0, ..)`
//! suspends instead of spinning.

use crate::sync::Semaphore;
use alloc::collections::VecDeque;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::port::Port;

/// Set-1 scancode to ASCII, unshifted then shifted. Covers the printable
/// keys a console needs.
static UNSHIFTED: [u8; 0x3B] = [
    0, 27, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 8, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n', 0, b'a', b's',
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', 0, b'*', 0, b' ', 0,
];

static SHIFTED: [u8; 0x3B] = [
    0, 27, b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*', b'(', b')', b'_', b'+', 8, b'\t',
    b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I', b'O', b'P', b'{', b'}', b'\n', 0, b'A', b'S',
    b'D', b'F', b'G', b'H', b'J', b'K', b'L', b':', b'"', b'~', 0, b'|', b'Z', b'X', b'C', b'V',
    b'B', b'N', b'M', b'<', b'>', b'?', 0, b'*', 0, b' ', 0,
];

const LSHIFT_DOWN: u8 = 0x2A;
const RSHIFT_DOWN: u8 = 0x36;
const LSHIFT_UP: u8 = 0xAA;
const RSHIFT_UP: u8 = 0xB6;

struct KeyboardState {
    shift: bool,
    buffer: VecDeque<u8>,
}

lazy_static! {
    static ref STATE: Mutex<KeyboardState> = Mutex::new(KeyboardState {
        shift: false,
        buffer: VecDeque::new(),
    });
}

/// One permit per buffered byte.
static AVAILABLE: Semaphore = Semaphore::new(0);

pub fn init() {
    // Drain a residual scancode left by the 8042 controller.
    let mut port: Port<u8> = Port::new(0x60);
    let _ = unsafe { port.read() };
    crate::log_info!("PS/2 keyboard driver initialized.");
}

/// Translate and enqueue a raw scancode. Interrupt context.
pub fn push_scancode(scancode: u8) {
    let mut state = STATE.lock();
    match scancode {
        LSHIFT_DOWN | RSHIFT_DOWN => state.shift = true,
        LSHIFT_UP | RSHIFT_UP => state.shift = false,
        code if (code as usize) < UNSHIFTED.len() => {
            let table = if state.shift { &SHIFTED } else { &UNSHIFTED };
            let byte = table[code as usize];
            if byte != 0 {
                state.buffer.push_back(byte);
                drop(state);
                AVAILABLE.up();
            }
        }
        _ => {} // key release or unmapped
    }
}

/// Blocking read of one byte of console input.
pub fn input_getc() -> u8 {
    AVAILABLE.down();
    x86_64::instructions::interrupts::without_interrupts(|| {
        STATE
            .lock()
            .buffer
            .pop_front()
            .expect("keyboard semaphore out of sync with buffer")
    })
}
