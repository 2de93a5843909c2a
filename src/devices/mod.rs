//! Device emulation for the VMM.

pub mod atapi;
pub mod mmio;
pub mod portio;
pub mod queue;
pub mod screen;
pub mod serial;

pub use atapi::Atapi;
pub use mmio::{MmioBus, MmioDevice, MmioError};
pub use portio::{PortBus, PortDevice};
pub use queue::ByteQueue;
pub use screen::{DisplaySink, Screen, FB_BPP, FB_HEIGHT, FB_WIDTH};
pub use serial::{Serial, SerialHandle, COM1};
