//! 16550 UART serial port emulation.
//!
//! A subset of the 16550 register file, big enough for polled consoles: the
//! guest reads LSR until a byte is available or the transmitter is free, then
//! moves data through THR/RBR one byte at a time.
//!
//! Two ring queues connect the device to the host:
//!
//! ```text
//!  host thread ──write──► host_to_guest ──RBR──► guest
//!  guest ──THR──► guest_to_host ──read──► host thread
//! ```
//!
//! The guest side lives on the vCPU thread via [`PortDevice`]; the host side
//! is a cloneable [`SerialHandle`] used by reader/writer threads. Interrupts,
//! FIFOs and the divisor latch are stubbed: DLAB-era registers read as zero
//! and writes to them are ignored, which polled guests never notice.

use std::sync::Arc;

use super::portio::PortDevice;
use super::queue::ByteQueue;

/// Standard PC serial port base addresses.
pub const COM1: u16 = 0x3F8;
#[allow(dead_code)]
pub const COM2: u16 = 0x2F8;
#[allow(dead_code)]
pub const COM3: u16 = 0x3E8;
#[allow(dead_code)]
pub const COM4: u16 = 0x2E8;

/// Number of I/O ports a UART occupies.
const SERIAL_PORT_COUNT: u16 = 8;

/// Default depth of each direction's queue.
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Register offsets from the port base.
mod regs {
    /// Transmitter Holding Register (write) / Receiver Buffer Register (read).
    pub const THR_RBR: u16 = 0;
    /// Interrupt Enable Register.
    pub const IER: u16 = 1;
    /// Interrupt Identification (read) / FIFO Control (write).
    pub const IIR_FCR: u16 = 2;
    /// Line Control Register.
    pub const LCR: u16 = 3;
    /// Modem Control Register.
    pub const MCR: u16 = 4;
    /// Line Status Register.
    pub const LSR: u16 = 5;
    /// Modem Status Register.
    pub const MSR: u16 = 6;
    /// Scratch Register.
    pub const SCR: u16 = 7;
}

/// Line Status Register bits.
mod lsr {
    /// Data Ready: a received byte is waiting in RBR.
    pub const DR: u8 = 0x01;
    /// Transmitter Holding Register Empty: THR accepts a byte.
    pub const THRE: u8 = 0x20;
}

/// Guest-facing side of the UART.
pub struct Serial {
    base: u16,
    host_to_guest: Arc<ByteQueue>,
    guest_to_host: Arc<ByteQueue>,
}

/// Host-facing side of the UART; clone freely across threads.
#[derive(Clone)]
pub struct SerialHandle {
    host_to_guest: Arc<ByteQueue>,
    guest_to_host: Arc<ByteQueue>,
}

impl Serial {
    /// Create a UART at `base` with the default queue depth.
    pub fn new(base: u16) -> (Self, SerialHandle) {
        Self::with_capacity(base, DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a UART whose queues hold `capacity` bytes each.
    pub fn with_capacity(base: u16, capacity: usize) -> (Self, SerialHandle) {
        let host_to_guest = Arc::new(ByteQueue::new(capacity));
        let guest_to_host = Arc::new(ByteQueue::new(capacity));

        let handle = SerialHandle {
            host_to_guest: host_to_guest.clone(),
            guest_to_host: guest_to_host.clone(),
        };
        let serial = Self {
            base,
            host_to_guest,
            guest_to_host,
        };
        (serial, handle)
    }

    /// The I/O ports this device must be registered on.
    pub fn ports(&self) -> Vec<u16> {
        (self.base..self.base + SERIAL_PORT_COUNT).collect()
    }

    fn read_reg(&mut self, offset: u16) -> u8 {
        match offset {
            // Receive: pop one byte, zero when nothing is pending.
            regs::THR_RBR => self.host_to_guest.pop().unwrap_or(0),
            regs::LSR => {
                // The transmitter always accepts; the ring drops on overflow.
                let mut status = lsr::THRE;
                if !self.host_to_guest.is_empty() {
                    status |= lsr::DR;
                }
                status
            }
            regs::IER | regs::IIR_FCR | regs::LCR | regs::MCR | regs::MSR | regs::SCR => 0,
            _ => 0,
        }
    }

    fn write_reg(&mut self, offset: u16, value: u8) {
        if offset == regs::THR_RBR {
            // Transmit: a full ring drops the byte, like an unread FIFO.
            self.guest_to_host.push(value);
        }
        // All other register writes are accepted and ignored.
    }
}

impl PortDevice for Serial {
    fn in8(&mut self, port: u16) -> Option<u8> {
        let offset = port.checked_sub(self.base)?;
        if offset >= SERIAL_PORT_COUNT {
            return None;
        }
        Some(self.read_reg(offset))
    }

    fn out8(&mut self, port: u16, value: u8) -> bool {
        match port.checked_sub(self.base) {
            Some(offset) if offset < SERIAL_PORT_COUNT => {
                self.write_reg(offset, value);
                true
            }
            _ => false,
        }
    }
}

impl SerialHandle {
    /// Drain bytes the guest transmitted; returns how many were copied.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        self.guest_to_host.read(buf)
    }

    /// Queue bytes for the guest to receive; returns how many fit.
    pub fn write(&self, buf: &[u8]) -> usize {
        self.host_to_guest.write(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn com1() -> (Serial, SerialHandle) {
        Serial::new(COM1)
    }

    #[test]
    fn test_ports_cover_the_register_file() {
        let (serial, _) = com1();
        assert_eq!(serial.ports(), (0x3F8..0x400).collect::<Vec<u16>>());
    }

    #[test]
    fn test_lsr_reflects_pending_data() {
        let (mut serial, handle) = com1();

        // Idle: transmitter empty, no data ready.
        let status = serial.in8(COM1 + regs::LSR).unwrap();
        assert_eq!(status & lsr::THRE, lsr::THRE);
        assert_eq!(status & lsr::DR, 0);

        handle.write(b"x");
        let status = serial.in8(COM1 + regs::LSR).unwrap();
        assert_eq!(status & lsr::DR, lsr::DR);
        assert_eq!(status & lsr::THRE, lsr::THRE);

        // Reading RBR consumes the byte and clears DR.
        assert_eq!(serial.in8(COM1).unwrap(), b'x');
        let status = serial.in8(COM1 + regs::LSR).unwrap();
        assert_eq!(status & lsr::DR, 0);
    }

    #[test]
    fn test_rbr_reads_zero_when_empty() {
        let (mut serial, _handle) = com1();
        assert_eq!(serial.in8(COM1).unwrap(), 0);
    }

    #[test]
    fn test_guest_transmit_reaches_host_in_order() {
        let (mut serial, handle) = com1();
        for &byte in b"Hello World\n" {
            assert!(serial.out8(COM1, byte));
        }

        let mut buf = [0u8; 64];
        let n = handle.read(&mut buf);
        assert_eq!(&buf[..n], b"Hello World\n");
    }

    #[test]
    fn test_host_bytes_delivered_in_order() {
        let (mut serial, handle) = com1();
        assert_eq!(handle.write(b"abc"), 3);
        assert_eq!(serial.in8(COM1).unwrap(), b'a');
        assert_eq!(serial.in8(COM1).unwrap(), b'b');
        assert_eq!(serial.in8(COM1).unwrap(), b'c');
        assert_eq!(serial.in8(COM1).unwrap(), 0);
    }

    #[test]
    fn test_stub_registers_read_zero_and_ignore_writes() {
        let (mut serial, _handle) = com1();
        for offset in [regs::IER, regs::IIR_FCR, regs::LCR, regs::MCR, regs::MSR, regs::SCR] {
            assert!(serial.out8(COM1 + offset, 0xFF));
            assert_eq!(serial.in8(COM1 + offset).unwrap(), 0);
        }
    }

    #[test]
    fn test_ports_outside_the_bank_are_unhandled() {
        let (mut serial, _handle) = com1();
        assert_eq!(serial.in8(COM1 - 1), None);
        assert_eq!(serial.in8(COM1 + 8), None);
        assert!(!serial.out8(COM1 + 8, 0));
    }
}
