//! Guest image loading.
//!
//! Three boot protocols are supported, each implemented by a thin loader
//! that writes the image into guest memory through the memory manager and
//! sets the registers its handoff convention demands:
//!
//! - **Raw flat binary** ([`load_raw`]): copied to 0x7C00 like a boot
//!   sector, entered at its first byte. Works in real or protected mode;
//!   the image has to match whatever mode the vCPU was initialized in.
//! - **Linux bzImage** ([`load_bzimage`]): the x86 boot protocol, 32-bit
//!   entry. Setup sectors are staged in the real-mode segment, the
//!   protected-mode kernel goes to the 1 MiB mark, and `boot_params` is
//!   assembled at [`layout::BOOT_PARAMS_ADDR`] with the command line and the
//!   E820 map. Entered at `code32_start` with RSI pointing at boot_params.
//! - **Multiboot1 ELF** ([`load_multiboot`]): PT_LOAD segments placed at
//!   their physical addresses, a `multiboot_info` built below the loaded
//!   kernel, and the magic/info-pointer handoff in EAX/EBX.
//!
//! [`detect_kind`] sniffs the image so the CLI can pick a loader without
//! being told.

mod bzimage;
mod multiboot;
mod raw;

pub use bzimage::load_bzimage;
pub use multiboot::load_multiboot;
pub use raw::load_raw;

use thiserror::Error;

use crate::kvm::{KvmError, MemoryError};

/// Guest-physical addresses the loaders place things at.
pub mod layout {
    /// Load address for raw flat binaries (the traditional boot-sector spot).
    pub const RAW_LOAD_ADDR: u64 = 0x7C00;

    /// The Linux `boot_params` ("zero page") staging address.
    pub const BOOT_PARAMS_ADDR: u64 = 0x1_0000;

    /// Real-mode segment where the bzImage setup sectors are staged. The
    /// kernel command line lives near the top of this segment's heap.
    pub const REAL_MODE_ADDR: u64 = 0x9_0000;

    /// End of the real-mode heap, relative to [`REAL_MODE_ADDR`].
    pub const REAL_MODE_HEAP_END: u64 = 0xE000;

    /// Protected-mode kernel load address (the 1 MiB mark).
    pub const KERNEL_ADDR: u64 = 0x10_0000;

    /// Where the multiboot information structure is built.
    pub const MULTIBOOT_INFO_ADDR: u64 = 0xC1_0000;

    /// Where the multiboot command line is copied.
    pub const MULTIBOOT_CMDLINE_ADDR: u64 = 0xC2_0000;

    /// Where the multiboot memory-map array is written.
    pub const MULTIBOOT_MMAP_ADDR: u64 = 0xC3_0000;
}

/// Errors from image loading.
#[derive(Error, Debug)]
pub enum BootError {
    /// The image file could not be read.
    #[error("failed to read guest image: {0}")]
    ReadImage(#[source] std::io::Error),

    /// The image does not parse as the expected kernel format.
    #[error("invalid kernel image: {0}")]
    InvalidKernel(String),

    /// The image does not parse as a 32-bit ELF.
    #[error("invalid ELF image: {0}")]
    InvalidElf(String),

    /// The command line does not fit the protocol's buffer.
    #[error("command line too long: {len} bytes (max {max})")]
    CmdlineTooLong { len: usize, max: usize },

    /// Guest memory rejected a loader write.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// Register setup failed.
    #[error(transparent)]
    Kvm(#[from] KvmError),
}

/// Image formats the loaders understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Raw,
    BzImage,
    Multiboot,
}

/// Sniff the loader an image wants: the bzImage `HdrS` magic wins, then the
/// ELF magic, and anything else is treated as a raw binary.
pub fn detect_kind(image: &[u8]) -> ImageKind {
    if image.len() >= 0x208 && image[0x202..0x206] == *b"HdrS" {
        return ImageKind::BzImage;
    }
    if image.len() >= 4 && image[..4] == *b"\x7fELF" {
        return ImageKind::Multiboot;
    }
    ImageKind::Raw
}
