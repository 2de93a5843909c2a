//! Multiboot1 ELF loader.
//!
//! Boots 32-bit ELF kernels that follow the multiboot convention: the
//! loader walks the program headers, places every PT_LOAD segment at its
//! physical address (zeroing the BSS tail), builds a `multiboot_info`
//! structure, and enters the kernel with the bootloader magic in EAX and the
//! info pointer in EBX.
//!
//! The info structure advertises two things: the command line and the
//! memory map, translated entry for entry from the VM's E820 snapshot. Both
//! live in dedicated guest-physical spots above the usual kernel link
//! addresses (see [`layout`]).
//!
//! The ELF is parsed by hand; only the handful of 32-bit header fields the
//! walk needs are touched.
//!
//! Reference: <https://www.gnu.org/software/grub/manual/multiboot/multiboot.html>

use super::{layout, BootError};
use crate::kvm::Vm;

/// Value the kernel expects in EAX at entry.
const BOOTLOADER_MAGIC: u64 = 0x2BAD_B002;

/// `multiboot_info.flags` bits for the fields we populate.
mod info_flags {
    /// `cmdline` is valid.
    pub const CMDLINE: u32 = 1 << 2;
    /// `mmap_addr`/`mmap_length` are valid.
    pub const MEM_MAP: u32 = 1 << 6;
}

/// Byte offsets into `multiboot_info`.
mod info_offsets {
    pub const FLAGS: usize = 0;
    pub const CMDLINE: usize = 16;
    pub const MMAP_LENGTH: usize = 44;
    pub const MMAP_ADDR: usize = 48;
}

/// `sizeof(multiboot_info)`.
const INFO_SIZE: usize = 116;

/// Each mmap record: a 20-byte payload preceded by its own size field.
const MMAP_ENTRY_SIZE: usize = 24;

/// Command-line budget.
const CMDLINE_MAX_SIZE: usize = 2048;

/// The 32-bit ELF header fields the loader reads.
mod elf {
    pub const MAGIC: [u8; 4] = *b"\x7fELF";
    /// ELFCLASS32 in e_ident[EI_CLASS].
    pub const EI_CLASS: usize = 4;
    pub const CLASS32: u8 = 1;
    pub const E_ENTRY: usize = 0x18;
    pub const E_PHOFF: usize = 0x1C;
    pub const E_PHENTSIZE: usize = 0x2A;
    pub const E_PHNUM: usize = 0x2C;
    /// Minimum header sizes.
    pub const EHDR_SIZE: usize = 52;
    pub const PHDR_SIZE: usize = 32;
    /// Loadable segment type.
    pub const PT_LOAD: u32 = 1;
    /// Program header field offsets.
    pub const P_TYPE: usize = 0;
    pub const P_OFFSET: usize = 4;
    pub const P_PADDR: usize = 12;
    pub const P_FILESZ: usize = 16;
    pub const P_MEMSZ: usize = 20;
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

/// Load a multiboot1 ELF kernel and set up its handoff.
pub fn load_multiboot(vm: &Vm, image: &[u8], cmdline: &str) -> Result<(), BootError> {
    if image.len() < elf::EHDR_SIZE {
        return Err(BootError::InvalidElf("image shorter than an ELF header".into()));
    }
    if image[..4] != elf::MAGIC {
        return Err(BootError::InvalidElf("bad ELF magic".into()));
    }
    if image[elf::EI_CLASS] != elf::CLASS32 {
        return Err(BootError::InvalidElf("only 32-bit ELF kernels are supported".into()));
    }

    let entry = read_u32(image, elf::E_ENTRY);
    let phoff = read_u32(image, elf::E_PHOFF) as usize;
    let phentsize = read_u16(image, elf::E_PHENTSIZE) as usize;
    let phnum = read_u16(image, elf::E_PHNUM) as usize;

    if phentsize < elf::PHDR_SIZE {
        return Err(BootError::InvalidElf(format!(
            "program header entry size {phentsize} too small"
        )));
    }
    let table_end = phoff + phnum * phentsize;
    if table_end > image.len() {
        return Err(BootError::InvalidElf(
            "program header table extends past the image".into(),
        ));
    }

    let mut loaded = 0usize;
    for i in 0..phnum {
        let phdr = &image[phoff + i * phentsize..];
        if read_u32(phdr, elf::P_TYPE) != elf::PT_LOAD {
            continue;
        }

        let p_offset = read_u32(phdr, elf::P_OFFSET) as usize;
        let p_paddr = u64::from(read_u32(phdr, elf::P_PADDR));
        let p_filesz = read_u32(phdr, elf::P_FILESZ) as usize;
        let p_memsz = read_u32(phdr, elf::P_MEMSZ) as usize;

        if p_offset + p_filesz > image.len() {
            return Err(BootError::InvalidElf(format!(
                "segment {i} extends past the image"
            )));
        }

        vm.memory().write(p_paddr, &image[p_offset..p_offset + p_filesz])?;
        if p_memsz > p_filesz {
            // BSS tail.
            vm.memory()
                .write(p_paddr + p_filesz as u64, &vec![0u8; p_memsz - p_filesz])?;
        }
        loaded += 1;
    }
    if loaded == 0 {
        return Err(BootError::InvalidElf("no loadable segments".into()));
    }

    write_cmdline(vm, cmdline)?;
    let mmap_length = write_memory_map(vm)?;
    write_info(vm, mmap_length)?;

    let mut regs = vm.get_regs()?;
    regs.rax = BOOTLOADER_MAGIC;
    regs.rbx = layout::MULTIBOOT_INFO_ADDR;
    regs.rip = u64::from(entry);
    vm.set_regs(&regs)?;

    eprintln!(
        "[Boot] multiboot ELF: {loaded} segments, entry {entry:#x}, info at {:#x}",
        layout::MULTIBOOT_INFO_ADDR
    );
    Ok(())
}

fn write_cmdline(vm: &Vm, cmdline: &str) -> Result<(), BootError> {
    if cmdline.len() >= CMDLINE_MAX_SIZE {
        return Err(BootError::CmdlineTooLong {
            len: cmdline.len(),
            max: CMDLINE_MAX_SIZE - 1,
        });
    }
    let mut buf = Vec::with_capacity(cmdline.len() + 1);
    buf.extend_from_slice(cmdline.as_bytes());
    buf.push(0);
    vm.memory().write(layout::MULTIBOOT_CMDLINE_ADDR, &buf)?;
    Ok(())
}

/// Translate the E820 snapshot into multiboot mmap records. Returns the
/// array's byte length.
fn write_memory_map(vm: &Vm) -> Result<u32, BootError> {
    let table = vm.memory().e820();
    let mut mmap = Vec::with_capacity(table.len() * MMAP_ENTRY_SIZE);
    for entry in &table {
        // Each record announces the size of its remainder first.
        mmap.extend_from_slice(&(MMAP_ENTRY_SIZE as u32 - 4).to_le_bytes());
        mmap.extend_from_slice(&entry.base.to_le_bytes());
        mmap.extend_from_slice(&entry.size.to_le_bytes());
        // Multiboot types match E820: 1 usable, everything else reserved.
        mmap.extend_from_slice(&(entry.kind as u32).to_le_bytes());
    }
    vm.memory().write(layout::MULTIBOOT_MMAP_ADDR, &mmap)?;
    Ok(mmap.len() as u32)
}

fn write_info(vm: &Vm, mmap_length: u32) -> Result<(), BootError> {
    let mut info = [0u8; INFO_SIZE];
    let flags = info_flags::CMDLINE | info_flags::MEM_MAP;
    info[info_offsets::FLAGS..info_offsets::FLAGS + 4].copy_from_slice(&flags.to_le_bytes());
    info[info_offsets::CMDLINE..info_offsets::CMDLINE + 4]
        .copy_from_slice(&(layout::MULTIBOOT_CMDLINE_ADDR as u32).to_le_bytes());
    info[info_offsets::MMAP_LENGTH..info_offsets::MMAP_LENGTH + 4]
        .copy_from_slice(&mmap_length.to_le_bytes());
    info[info_offsets::MMAP_ADDR..info_offsets::MMAP_ADDR + 4]
        .copy_from_slice(&(layout::MULTIBOOT_MMAP_ADDR as u32).to_le_bytes());
    vm.memory().write(layout::MULTIBOOT_INFO_ADDR, &info)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvm::{self, RegionKind, VcpuConfig};

    /// A minimal 32-bit ELF with one PT_LOAD segment: 8 code bytes at
    /// 0x20_0000 plus an 8-byte BSS, entry at the segment start.
    fn fake_elf(code: &[u8]) -> Vec<u8> {
        let phoff = elf::EHDR_SIZE;
        let data_off = phoff + elf::PHDR_SIZE;

        let mut image = vec![0u8; data_off];
        image[..4].copy_from_slice(&elf::MAGIC);
        image[elf::EI_CLASS] = elf::CLASS32;
        image[elf::E_ENTRY..elf::E_ENTRY + 4].copy_from_slice(&0x0020_0000u32.to_le_bytes());
        image[elf::E_PHOFF..elf::E_PHOFF + 4].copy_from_slice(&(phoff as u32).to_le_bytes());
        image[elf::E_PHENTSIZE..elf::E_PHENTSIZE + 2]
            .copy_from_slice(&(elf::PHDR_SIZE as u16).to_le_bytes());
        image[elf::E_PHNUM..elf::E_PHNUM + 2].copy_from_slice(&1u16.to_le_bytes());

        let ph = phoff;
        image[ph + elf::P_TYPE..ph + elf::P_TYPE + 4]
            .copy_from_slice(&elf::PT_LOAD.to_le_bytes());
        image[ph + elf::P_OFFSET..ph + elf::P_OFFSET + 4]
            .copy_from_slice(&(data_off as u32).to_le_bytes());
        image[ph + elf::P_PADDR..ph + elf::P_PADDR + 4]
            .copy_from_slice(&0x0020_0000u32.to_le_bytes());
        image[ph + elf::P_FILESZ..ph + elf::P_FILESZ + 4]
            .copy_from_slice(&(code.len() as u32).to_le_bytes());
        image[ph + elf::P_MEMSZ..ph + elf::P_MEMSZ + 4]
            .copy_from_slice(&((code.len() + 8) as u32).to_le_bytes());

        image.extend_from_slice(code);
        image
    }

    fn kvm_vm() -> Option<kvm::Vm> {
        let Ok(mut vm) = kvm::create_vm() else {
            eprintln!("skipping: /dev/kvm is not usable in this environment");
            return None;
        };
        vm.alloc(0, 16 << 20, RegionKind::Ram).unwrap();
        vm.vcpu_init(&VcpuConfig {
            irqchip: false,
            pit: false,
            ..Default::default()
        })
        .unwrap();
        Some(vm)
    }

    #[test]
    fn test_rejects_non_elf() {
        let Some(vm) = kvm_vm() else { return };
        assert!(matches!(
            load_multiboot(&vm, &[0u8; 64], ""),
            Err(BootError::InvalidElf(_))
        ));
    }

    #[test]
    fn test_rejects_elf64() {
        let Some(vm) = kvm_vm() else { return };
        let mut image = fake_elf(&[0xF4; 8]);
        image[elf::EI_CLASS] = 2; // ELFCLASS64
        assert!(matches!(
            load_multiboot(&vm, &image, ""),
            Err(BootError::InvalidElf(_))
        ));
    }

    #[test]
    fn test_loads_segments_info_and_registers() {
        let Some(vm) = kvm_vm() else { return };
        let code = [0x90, 0x90, 0x90, 0x90, 0xF4, 0, 0, 0];
        // Pre-dirty the BSS area to check the zeroing.
        vm.memory().write(0x0020_0000 + 8, &[0xFF; 8]).unwrap();

        load_multiboot(&vm, &fake_elf(&code), "/bin/init").unwrap();

        let mut seg = [0u8; 16];
        vm.memory().read(0x0020_0000, &mut seg).unwrap();
        assert_eq!(&seg[..8], &code);
        assert_eq!(&seg[8..], &[0u8; 8]);

        // Info structure: flags, cmdline pointer, mmap pointer.
        let mut info = [0u8; INFO_SIZE];
        vm.memory()
            .read(layout::MULTIBOOT_INFO_ADDR, &mut info)
            .unwrap();
        assert_eq!(
            read_u32(&info, info_offsets::FLAGS),
            info_flags::CMDLINE | info_flags::MEM_MAP
        );
        assert_eq!(
            u64::from(read_u32(&info, info_offsets::CMDLINE)),
            layout::MULTIBOOT_CMDLINE_ADDR
        );
        assert_eq!(
            u64::from(read_u32(&info, info_offsets::MMAP_ADDR)),
            layout::MULTIBOOT_MMAP_ADDR
        );
        // One RAM region => one 24-byte record.
        assert_eq!(read_u32(&info, info_offsets::MMAP_LENGTH), 24);

        let mut cmd = [0u8; 10];
        vm.memory()
            .read(layout::MULTIBOOT_CMDLINE_ADDR, &mut cmd)
            .unwrap();
        assert_eq!(&cmd, b"/bin/init\0");

        let mut record = [0u8; 24];
        vm.memory()
            .read(layout::MULTIBOOT_MMAP_ADDR, &mut record)
            .unwrap();
        assert_eq!(read_u32(&record, 0), 20);
        assert_eq!(read_u32(&record, 20), 1); // usable RAM

        let regs = vm.get_regs().unwrap();
        assert_eq!(regs.rax, BOOTLOADER_MAGIC);
        assert_eq!(regs.rbx, layout::MULTIBOOT_INFO_ADDR);
        assert_eq!(regs.rip, 0x0020_0000);
    }
}
