//! ATAPI CD-ROM emulation.
//!
//! A single read-only drive, master on the primary ATA bus, driven through
//! the PACKET interface. The model is deliberately loose: the status
//! register always reports DRQ with BSY clear (always ready, never busy),
//! and the guest never has to issue an ATA PACKET command byte; shoving a
//! SCSI packet into the data register is enough.
//!
//! # Transaction shape
//!
//! The sector-count register doubles as the PACKET phase indicator. A READ
//! transaction looks like this from the guest:
//!
//! 1. Six 16-bit writes to the data register deliver the 12-byte SCSI packet.
//! 2. A sector-count read decodes the packet, fetches one 2048-byte sector
//!    from the backing file and answers `DATA_TRANSMIT`.
//! 3. 1024 16-bit reads from the data register stream the sector out.
//! 4. The next sector-count read answers `COMMAND_COMPLETE` and re-arms the
//!    drive; reads after that return the ATAPI signature again.
//!
//! Only SCSI READ(12) is decoded. Anything else is logged and dropped; the
//! guest then streams zeros, because the transmit cursor is left parked at
//! the end of the sector buffer.
//!
//! Reads on the sector-count/LBA registers with the master selected return
//! the ATAPI identification signature `(0x01, 0x01, 0x14, 0xEB)`; with any
//! other drive selected they return zero. The secondary bus is a mirror that
//! accepts writes and answers zeros.

use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;

use super::portio::PortDevice;

/// Primary ATA bus I/O base.
pub const PRIMARY_BASE: u16 = 0x1F0;
/// Secondary ATA bus I/O base.
pub const SECONDARY_BASE: u16 = 0x170;
/// Device control registers; writes are accepted and ignored.
const PRIMARY_DCR: u16 = 0x3F6;
const SECONDARY_DCR: u16 = 0x376;

/// Register offsets from an ATA bus base.
mod regs {
    /// 16-bit data window.
    pub const DATA: u16 = 0;
    pub const FEATURES: u16 = 1;
    pub const SECTOR_COUNT: u16 = 2;
    pub const LBA_LO: u16 = 3;
    pub const LBA_MI: u16 = 4;
    pub const LBA_HI: u16 = 5;
    /// Drive select.
    pub const DRIVE: u16 = 6;
    /// Status (read) / command (write).
    pub const STATUS: u16 = 7;
}

/// Status register bits.
mod status {
    /// Data Request: ready to move data.
    pub const DRQ: u8 = 1 << 3;
}

/// Drive-select byte for the bus master.
const DRIVE_MASTER: u8 = 0x00;

/// ATAPI identification signature, read back from the LBA registers.
mod signature {
    pub const LBA_LO: u8 = 0x01;
    pub const LBA_MI: u8 = 0x14;
    pub const LBA_HI: u8 = 0xEB;
}

/// PACKET interface phases, reported through the sector-count register.
/// `AWAIT_COMMAND` doubles as the signature's sector-count byte.
const PHASE_AWAIT_COMMAND: u8 = 1;
const PHASE_DATA_TRANSMIT: u8 = 2;
const PHASE_COMMAND_COMPLETE: u8 = 3;

/// CD-ROM block size.
pub const SECTOR_SIZE: usize = 2048;

/// SCSI command packet size on the ATAPI transport.
const PACKET_SIZE: usize = 12;

/// SCSI READ(12) opcode, the one command the model understands.
const SCSI_READ_12: u8 = 0xA8;

/// Single-drive ATAPI CD-ROM behind the primary ATA ports.
pub struct Atapi {
    selected_drive: u8,
    /// A full packet has been shifted in and awaits decoding.
    receiving: bool,
    /// Sector words have been handed out since the last phase read.
    sending: bool,
    packet: [u8; PACKET_SIZE],
    packet_len: usize,
    sector: [u8; SECTOR_SIZE],
    /// Byte position of the next 16-bit data-register read.
    cursor: usize,
    backing: File,
}

impl Atapi {
    /// Create a drive backed by `backing` (typically an ISO image).
    pub fn new(backing: File) -> Self {
        Self {
            selected_drive: DRIVE_MASTER,
            receiving: false,
            sending: false,
            packet: [0; PACKET_SIZE],
            packet_len: 0,
            sector: [0; SECTOR_SIZE],
            // Parked at the end: stray data reads return zeros.
            cursor: SECTOR_SIZE,
            backing,
        }
    }

    /// Every I/O port the drive must be registered on: both ATA register
    /// banks plus the device control registers.
    pub fn ports() -> Vec<u16> {
        let mut ports: Vec<u16> = (PRIMARY_BASE..PRIMARY_BASE + 8)
            .chain(SECONDARY_BASE..SECONDARY_BASE + 8)
            .collect();
        ports.push(PRIMARY_DCR);
        ports.push(SECONDARY_DCR);
        ports
    }

    /// Sector-count read: the PACKET phase machine.
    fn sector_count_read(&mut self) -> u8 {
        if self.sending {
            self.cursor = 0;
            self.sending = false;
            return PHASE_COMMAND_COMPLETE;
        }
        if self.receiving {
            self.handle_packet();
            self.packet_len = 0;
            self.receiving = false;
            return PHASE_DATA_TRANSMIT;
        }
        PHASE_AWAIT_COMMAND
    }

    /// Decode the queued SCSI packet and prime the sector buffer.
    fn handle_packet(&mut self) {
        if self.packet[0] != SCSI_READ_12 {
            eprintln!("[ATAPI] unsupported SCSI opcode {:#04x}", self.packet[0]);
            // Transaction dropped; the cursor stays parked so the guest
            // streams zeros.
            return;
        }

        // READ(12) carries the LBA big-endian in bytes 2..6. The transfer
        // length is ignored: one sector per transaction.
        let lba = u32::from_be_bytes([
            self.packet[2],
            self.packet[3],
            self.packet[4],
            self.packet[5],
        ]);

        self.sector.fill(0);
        let offset = u64::from(lba) * SECTOR_SIZE as u64;
        let mut filled = 0;
        while filled < SECTOR_SIZE {
            match self
                .backing
                .read_at(&mut self.sector[filled..], offset + filled as u64)
            {
                Ok(0) => break, // past EOF; the tail stays zero
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    eprintln!("[ATAPI] read of LBA {lba} failed: {e}");
                    break;
                }
            }
        }
        self.cursor = 0;
    }
}

impl PortDevice for Atapi {
    fn in8(&mut self, port: u16) -> Option<u8> {
        if let Some(offset) = port.checked_sub(PRIMARY_BASE).filter(|o| *o < 8) {
            let master = self.selected_drive == DRIVE_MASTER;
            return match offset {
                // Only the master drive exists; anything else reads zero.
                regs::SECTOR_COUNT..=regs::LBA_HI if !master => Some(0),
                regs::SECTOR_COUNT => Some(self.sector_count_read()),
                regs::LBA_LO => Some(signature::LBA_LO),
                regs::LBA_MI => Some(signature::LBA_MI),
                regs::LBA_HI => Some(signature::LBA_HI),
                regs::STATUS => Some(status::DRQ),
                _ => None,
            };
        }
        if let Some(offset) = port.checked_sub(SECONDARY_BASE).filter(|o| *o < 8) {
            // Mirror bus: the signature registers answer zero.
            return matches!(offset, regs::SECTOR_COUNT..=regs::LBA_HI).then_some(0);
        }
        None
    }

    fn out8(&mut self, port: u16, value: u8) -> bool {
        if port == PRIMARY_DCR || port == SECONDARY_DCR {
            return true;
        }
        for base in [PRIMARY_BASE, SECONDARY_BASE] {
            if let Some(offset) = port.checked_sub(base).filter(|o| *o < 8) {
                return match offset {
                    regs::DRIVE => {
                        self.selected_drive = value;
                        true
                    }
                    // Feature/count/LBA writes and command bytes are taken
                    // and ignored; the drive is stateless there.
                    regs::FEATURES..=regs::LBA_HI => true,
                    regs::STATUS if base == PRIMARY_BASE => true,
                    _ => false,
                };
            }
        }
        false
    }

    fn in16(&mut self, port: u16) -> Option<u16> {
        if port != PRIMARY_BASE + regs::DATA {
            return None;
        }
        if self.cursor >= SECTOR_SIZE {
            return Some(0);
        }
        self.sending = true;
        let word = u16::from_le_bytes([self.sector[self.cursor], self.sector[self.cursor + 1]]);
        self.cursor += 2;
        Some(word)
    }

    fn out16(&mut self, port: u16, value: u16) -> bool {
        if port != PRIMARY_BASE + regs::DATA {
            return false;
        }
        if self.packet_len > PACKET_SIZE - 2 {
            return true;
        }
        self.receiving = true;
        self.packet[self.packet_len..self.packet_len + 2].copy_from_slice(&value.to_le_bytes());
        self.packet_len += 2;
        true
    }
}
