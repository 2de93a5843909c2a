//! Linux bzImage loader.
//!
//! A bzImage is three things back to back: a legacy boot sector, real-mode
//! setup code carrying the setup header, and the protected-mode kernel. For
//! a direct 32-bit boot the VMM plays bootloader:
//!
//! 1. The setup sectors are staged at [`layout::REAL_MODE_ADDR`]; the kernel
//!    does not run them, but the protocol keeps the command line in that
//!    segment's heap.
//! 2. The protected-mode kernel is copied to the 1 MiB mark.
//! 3. `boot_params` (the "zero page") is assembled at
//!    [`layout::BOOT_PARAMS_ADDR`]: seeded from the image's own first page so
//!    the setup header arrives intact, then patched field by field the way a
//!    bootloader announces itself, and finished with the E820 map taken from
//!    the VM's memory manager.
//! 4. Registers: RSI carries the boot_params address, RIP the 32-bit entry
//!    point from `code32_start`. The vCPU must be in protected mode.
//!
//! ```text
//! +------------------+ 0x0000
//! |   Boot Sector    | 512 bytes
//! +------------------+ 0x0200
//! |   Setup Header   |   (setup_sects × 512 bytes) ──► 0x90000
//! |   & Setup Code   |
//! +------------------+
//! | Protected-Mode   |   ──► 0x100000, entered at code32_start
//! |     Kernel       |
//! +------------------+
//! ```
//!
//! Reference: <https://www.kernel.org/doc/html/latest/arch/x86/boot.html>

use super::{layout, BootError};
use crate::kvm::{E820Entry, Vm};

/// "HdrS", the boot-protocol magic at offset 0x202.
const BOOT_MAGIC: u32 = 0x5372_6448;

/// Minimum boot protocol version; `heap_end_ptr` exists from 2.02 on.
const MIN_BOOT_VERSION: u16 = 0x0202;

/// boot_params is one page.
const BOOT_PARAMS_SIZE: usize = 4096;

/// The zero page has room for this many E820 entries.
const E820_MAX_ENTRIES: usize = 128;

/// Size of one E820 entry in the zero page (base, size, type).
const E820_ENTRY_SIZE: usize = 20;

/// Command-line budget in the real-mode heap.
const CMDLINE_MAX_SIZE: usize = 2048;

/// Byte offsets into the image / zero page, from the boot protocol spec.
mod offsets {
    /// Number of 512-byte setup sectors (0 means 4, for ancient kernels).
    pub const SETUP_SECTS: usize = 0x1F1;
    /// Video mode requested by the loader.
    pub const VID_MODE: usize = 0x1FA;
    /// "HdrS".
    pub const BOOT_MAGIC: usize = 0x202;
    /// Boot protocol version.
    pub const VERSION: usize = 0x206;
    /// Loader type; 0xFF is "undefined bootloader".
    pub const TYPE_OF_LOADER: usize = 0x210;
    /// Load flags.
    pub const LOADFLAGS: usize = 0x211;
    /// 32-bit entry point of the protected-mode kernel.
    pub const CODE32_START: usize = 0x214;
    /// Initrd address and size; zeroed, no initrd support.
    pub const RAMDISK_IMAGE: usize = 0x218;
    pub const RAMDISK_SIZE: usize = 0x21C;
    /// End of the usable real-mode heap.
    pub const HEAP_END_PTR: usize = 0x224;
    /// Physical address of the command line.
    pub const CMD_LINE_PTR: usize = 0x228;
    /// Number of valid E820 entries.
    pub const E820_ENTRIES: usize = 0x1E8;
    /// The E820 array itself.
    pub const E820_TABLE: usize = 0x2D0;
}

/// `loadflags` bits the loader owns.
mod loadflags {
    /// The protected-mode kernel sits at 1 MiB, not 64 KiB.
    pub const LOADED_HIGH: u8 = 1 << 0;
    /// Do not reload the segment registers in the entry stub.
    pub const KEEP_SEGMENTS: u8 = 1 << 6;
    /// `heap_end_ptr` is valid.
    pub const CAN_USE_HEAP: u8 = 1 << 7;
}

fn read_u16(image: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([image[offset], image[offset + 1]])
}

fn read_u32(image: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        image[offset],
        image[offset + 1],
        image[offset + 2],
        image[offset + 3],
    ])
}

/// Load a bzImage and set up the 32-bit boot protocol handoff.
pub fn load_bzimage(vm: &Vm, image: &[u8], cmdline: &str) -> Result<(), BootError> {
    if image.len() < 0x250 {
        return Err(BootError::InvalidKernel(
            "image too small to contain a setup header".into(),
        ));
    }

    let magic = read_u32(image, offsets::BOOT_MAGIC);
    if magic != BOOT_MAGIC {
        return Err(BootError::InvalidKernel(format!(
            "bad boot magic: expected {BOOT_MAGIC:#x}, got {magic:#x}"
        )));
    }

    let version = read_u16(image, offsets::VERSION);
    if version < MIN_BOOT_VERSION {
        return Err(BootError::InvalidKernel(format!(
            "boot protocol {version:#x} is older than the supported {MIN_BOOT_VERSION:#x}"
        )));
    }

    let setup_sects = match image[offsets::SETUP_SECTS] {
        0 => 4,
        n => n as usize,
    };
    let setup_size = (setup_sects + 1) * 512;
    if setup_size >= image.len() {
        return Err(BootError::InvalidKernel(
            "setup sectors exceed the image size".into(),
        ));
    }

    // Stage the real-mode half and place the kernel at the 1 MiB mark.
    vm.memory().write(layout::REAL_MODE_ADDR, &image[..setup_size])?;
    vm.memory().write(layout::KERNEL_ADDR, &image[setup_size..])?;

    // Zero page: seed it from the image so the whole setup header (and
    // whatever follows it that the kernel version cares about) comes along.
    let mut params = [0u8; BOOT_PARAMS_SIZE];
    let seed = image.len().min(BOOT_PARAMS_SIZE);
    params[..seed].copy_from_slice(&image[..seed]);

    params[offsets::VID_MODE..offsets::VID_MODE + 2].copy_from_slice(&0xFFFFu16.to_le_bytes());
    params[offsets::TYPE_OF_LOADER] = 0xFF;
    params[offsets::LOADFLAGS] |=
        loadflags::LOADED_HIGH | loadflags::KEEP_SEGMENTS | loadflags::CAN_USE_HEAP;
    params[offsets::RAMDISK_IMAGE..offsets::RAMDISK_IMAGE + 4].fill(0);
    params[offsets::RAMDISK_SIZE..offsets::RAMDISK_SIZE + 4].fill(0);

    // The heap ends just under the command line, which sits at the top of
    // the real-mode segment.
    let heap_end = (layout::REAL_MODE_HEAP_END - 0x200) as u16;
    let cmd_line_ptr = (layout::REAL_MODE_ADDR + u64::from(heap_end)) as u32;
    params[offsets::HEAP_END_PTR..offsets::HEAP_END_PTR + 2]
        .copy_from_slice(&heap_end.to_le_bytes());
    params[offsets::CMD_LINE_PTR..offsets::CMD_LINE_PTR + 4]
        .copy_from_slice(&cmd_line_ptr.to_le_bytes());

    let e820 = vm.memory().e820();
    if e820.len() > E820_MAX_ENTRIES {
        return Err(BootError::InvalidKernel(format!(
            "{} memory regions exceed the zero page's {E820_MAX_ENTRIES}-entry E820 table",
            e820.len()
        )));
    }
    write_e820(&mut params, &e820);

    vm.memory().write(layout::BOOT_PARAMS_ADDR, &params)?;

    write_cmdline(vm, u64::from(cmd_line_ptr), cmdline)?;

    let code32_start = read_u32(image, offsets::CODE32_START);
    let mut regs = vm.get_regs()?;
    regs.rsi = layout::BOOT_PARAMS_ADDR;
    regs.rip = u64::from(code32_start);
    vm.set_regs(&regs)?;

    eprintln!(
        "[Boot] bzImage: protocol {:#x}, {} setup sectors, {} kernel bytes, entry {:#x}",
        version,
        setup_sects,
        image.len() - setup_size,
        code32_start
    );
    Ok(())
}

fn write_e820(params: &mut [u8], table: &[E820Entry]) {
    for (i, entry) in table.iter().enumerate() {
        let at = offsets::E820_TABLE + i * E820_ENTRY_SIZE;
        params[at..at + 8].copy_from_slice(&entry.base.to_le_bytes());
        params[at + 8..at + 16].copy_from_slice(&entry.size.to_le_bytes());
        params[at + 16..at + 20].copy_from_slice(&(entry.kind as u32).to_le_bytes());
    }
    params[offsets::E820_ENTRIES] = table.len() as u8;
}

fn write_cmdline(vm: &Vm, addr: u64, cmdline: &str) -> Result<(), BootError> {
    if cmdline.len() >= CMDLINE_MAX_SIZE {
        return Err(BootError::CmdlineTooLong {
            len: cmdline.len(),
            max: CMDLINE_MAX_SIZE - 1,
        });
    }

    let mut buf = Vec::with_capacity(cmdline.len() + 1);
    buf.extend_from_slice(cmdline.as_bytes());
    buf.push(0);
    vm.memory().write(addr, &buf)?;

    eprintln!("[Boot] command line at {addr:#x}: {cmdline}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvm::{self, RegionKind, VcpuConfig};

    /// A syntactically valid bzImage: one setup sector beyond the boot
    /// sector, a recognizable kernel payload, protocol 2.06.
    fn fake_bzimage() -> Vec<u8> {
        let mut image = vec![0u8; 2 * 512];
        image[offsets::SETUP_SECTS] = 1;
        image[offsets::BOOT_MAGIC..offsets::BOOT_MAGIC + 4].copy_from_slice(b"HdrS");
        image[offsets::VERSION..offsets::VERSION + 2]
            .copy_from_slice(&0x0206u16.to_le_bytes());
        image[offsets::CODE32_START..offsets::CODE32_START + 4]
            .copy_from_slice(&0x0010_0000u32.to_le_bytes());
        image.extend_from_slice(&[0xF4; 512]); // "kernel": a sector of hlt
        image
    }

    fn kvm_vm() -> Option<kvm::Vm> {
        let Ok(mut vm) = kvm::create_vm() else {
            eprintln!("skipping: /dev/kvm is not usable in this environment");
            return None;
        };
        vm.alloc(0, 4 << 20, RegionKind::Ram).unwrap();
        vm.vcpu_init(&VcpuConfig {
            irqchip: false,
            pit: false,
            ..Default::default()
        })
        .unwrap();
        Some(vm)
    }

    #[test]
    fn test_rejects_bad_magic() {
        let Some(vm) = kvm_vm() else { return };
        let mut image = fake_bzimage();
        image[offsets::BOOT_MAGIC] = 0;
        assert!(matches!(
            load_bzimage(&vm, &image, "console=ttyS0"),
            Err(BootError::InvalidKernel(_))
        ));
    }

    #[test]
    fn test_rejects_old_protocol() {
        let Some(vm) = kvm_vm() else { return };
        let mut image = fake_bzimage();
        image[offsets::VERSION..offsets::VERSION + 2]
            .copy_from_slice(&0x0200u16.to_le_bytes());
        assert!(matches!(
            load_bzimage(&vm, &image, ""),
            Err(BootError::InvalidKernel(_))
        ));
    }

    #[test]
    fn test_loads_kernel_and_zero_page() {
        let Some(vm) = kvm_vm() else { return };
        let image = fake_bzimage();
        load_bzimage(&vm, &image, "console=ttyS0").unwrap();

        // Kernel payload (after boot sector + 1 setup sector) at 1 MiB.
        let mut kernel = [0u8; 16];
        vm.memory().read(layout::KERNEL_ADDR, &mut kernel).unwrap();
        assert_eq!(kernel, [0xF4; 16]);

        // Zero page carries the patched header fields.
        let mut params = [0u8; BOOT_PARAMS_SIZE];
        vm.memory()
            .read(layout::BOOT_PARAMS_ADDR, &mut params)
            .unwrap();
        assert_eq!(params[offsets::TYPE_OF_LOADER], 0xFF);
        assert_eq!(
            params[offsets::LOADFLAGS]
                & (loadflags::LOADED_HIGH | loadflags::KEEP_SEGMENTS | loadflags::CAN_USE_HEAP),
            loadflags::LOADED_HIGH | loadflags::KEEP_SEGMENTS | loadflags::CAN_USE_HEAP
        );
        // One RAM region => one usable E820 entry.
        assert_eq!(params[offsets::E820_ENTRIES], 1);
        let base = read_u32(&params, offsets::E820_TABLE) as u64;
        assert_eq!(base, 0);

        // Command line where cmd_line_ptr points.
        let ptr = u64::from(read_u32(&params, offsets::CMD_LINE_PTR));
        assert_eq!(ptr, layout::REAL_MODE_ADDR + 0xDE00);
        let mut cmd = [0u8; 16];
        vm.memory().read(ptr, &mut cmd).unwrap();
        assert_eq!(&cmd[..14], b"console=ttyS0\0");

        // Handoff registers.
        let regs = vm.get_regs().unwrap();
        assert_eq!(regs.rsi, layout::BOOT_PARAMS_ADDR);
        assert_eq!(regs.rip, 0x10_0000);
    }

    #[test]
    fn test_rejects_oversized_cmdline() {
        let Some(vm) = kvm_vm() else { return };
        let image = fake_bzimage();
        let cmdline = "x".repeat(CMDLINE_MAX_SIZE);
        assert!(matches!(
            load_bzimage(&vm, &image, &cmdline),
            Err(BootError::CmdlineTooLong { .. })
        ));
    }
}
