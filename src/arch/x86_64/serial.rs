//! 16550A serial console on COM1.
//!
//! Output backs the kernel logger; input feeds the non-blocking `cgetc`
//! system call.

use spin::Mutex;
use x86_64::instructions::port::Port;

const COM1: u16 = 0x3F8;

pub struct SerialPort {
    data: Port<u8>,
    int_enable: Port<u8>,
    fifo_ctrl: Port<u8>,
    line_ctrl: Port<u8>,
    modem_ctrl: Port<u8>,
    line_status: Port<u8>,
}

impl SerialPort {
    pub const unsafe fn new(base: u16) -> Self {
        SerialPort {
            data: Port::new(base),
            int_enable: Port::new(base + 1),
            fifo_ctrl: Port::new(base + 2),
            line_ctrl: Port::new(base + 3),
            modem_ctrl: Port::new(base + 4),
            line_status: Port::new(base + 5),
        }
    }

    pub fn init(&mut self) {
        unsafe {
            self.int_enable.write(0x00);
            self.line_ctrl.write(0x80); // DLAB on
            self.data.write(0x03); // 38400 baud, divisor lo
            self.int_enable.write(0x00); // divisor hi
            self.line_ctrl.write(0x03); // 8N1
            self.fifo_ctrl.write(0xC7);
            self.modem_ctrl.write(0x0B);
        }
    }

    fn transmit_empty(&mut self) -> bool {
        unsafe { self.line_status.read() & 0x20 != 0 }
    }

    pub fn putb(&mut self, byte: u8) {
        while !self.transmit_empty() {
            core::hint::spin_loop();
        }
        unsafe { self.data.write(byte) }
    }

    /// Non-blocking read: `None` when no byte is pending.
    pub fn getb(&mut self) -> Option<u8> {
        unsafe {
            if self.line_status.read() & 0x01 != 0 {
                Some(self.data.read())
            } else {
                None
            }
        }
    }
}

static COM1_PORT: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(COM1) });

pub fn init() {
    COM1_PORT.lock().init();
}

pub fn write_str(s: &str) {
    let mut port = COM1_PORT.lock();
    for b in s.bytes() {
        if b == b'\n' {
            port.putb(b'\r');
        }
        port.putb(b);
    }
}

/// Non-blocking console read, 0 when no input is waiting.
pub fn getc() -> u8 {
    COM1_PORT.lock().getb().unwrap_or(0)
}
