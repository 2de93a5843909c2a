//! Port-mapped I/O dispatch.
//!
//! x86 guests reach platform devices through IN/OUT instructions on a 16-bit
//! port space. The bus keeps a flat 65,536-entry table mapping each port to
//! the device claiming it; the run loop feeds every I/O exit through here.
//!
//! A device claims as many ports as it likes (the UART claims eight, the
//! ATAPI model around twenty) and sees the absolute port number on every
//! access, so one implementation can serve several register banks.
//!
//! Width support is per-device and per-port: the [`PortDevice`] methods
//! default to "not handled", and the run loop decides what an unhandled
//! access means (log, zeros on reads, keep running). BIOS-style guests probe
//! undefined ports routinely, so unclaimed ports are not an error.
//!
//! Devices register before the run loop starts; the table is read-only
//! afterwards and needs no locking.

/// Number of x86 I/O ports.
pub const PORT_COUNT: usize = 1 << 16;

/// A device reachable through I/O ports.
///
/// Implement only the widths the hardware supports; the defaults report the
/// access as unhandled.
pub trait PortDevice: Send {
    /// 8-bit read. `None` means the device does not serve this access.
    fn in8(&mut self, _port: u16) -> Option<u8> {
        None
    }

    /// 8-bit write. `false` means the device does not serve this access.
    fn out8(&mut self, _port: u16, _value: u8) -> bool {
        false
    }

    /// 16-bit read.
    fn in16(&mut self, _port: u16) -> Option<u16> {
        None
    }

    /// 16-bit write.
    fn out16(&mut self, _port: u16, _value: u16) -> bool {
        false
    }
}

/// Flat port-to-device dispatch table.
pub struct PortBus {
    /// Per-port index into `devices`.
    ports: Vec<Option<u16>>,
    devices: Vec<Box<dyn PortDevice>>,
}

impl PortBus {
    pub fn new() -> Self {
        Self {
            ports: vec![None; PORT_COUNT],
            devices: Vec::new(),
        }
    }

    /// Register `device` on every port in `ports`, overwriting previous
    /// claims. Returns the device id.
    pub fn register(&mut self, ports: &[u16], device: Box<dyn PortDevice>) -> u16 {
        let id = self.devices.len() as u16;
        self.devices.push(device);
        for &port in ports {
            self.ports[port as usize] = Some(id);
        }
        id
    }

    /// Release a single port. The owning device keeps its other ports.
    pub fn unregister(&mut self, port: u16) {
        self.ports[port as usize] = None;
    }

    /// Dispatch an 8-bit read; `None` when nobody serves it.
    pub fn in8(&mut self, port: u16) -> Option<u8> {
        let id = self.ports[port as usize]?;
        self.devices[id as usize].in8(port)
    }

    /// Dispatch an 8-bit write; `false` when nobody serves it.
    pub fn out8(&mut self, port: u16, value: u8) -> bool {
        match self.ports[port as usize] {
            Some(id) => self.devices[id as usize].out8(port, value),
            None => false,
        }
    }

    /// Dispatch a 16-bit read.
    pub fn in16(&mut self, port: u16) -> Option<u16> {
        let id = self.ports[port as usize]?;
        self.devices[id as usize].in16(port)
    }

    /// Dispatch a 16-bit write.
    pub fn out16(&mut self, port: u16, value: u16) -> bool {
        match self.ports[port as usize] {
            Some(id) => self.devices[id as usize].out16(port, value),
            None => false,
        }
    }
}

impl Default for PortBus {
    fn default() -> Self {
        Self::new()
    }
}
