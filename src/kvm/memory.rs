//! Guest-physical memory management.
//!
//! The guest sees a physical address space assembled from regions with three
//! different semantics:
//!
//! - **RAM**: backed by an anonymous host mmap and registered with KVM as a
//!   memory slot. Guest loads and stores hit host memory directly.
//! - **MMIO**: a deliberate hole. No host backing, no slot; every guest access
//!   traps to the VMM as an MMIO exit and is emulated.
//! - **Framebuffer**: backed and slotted like RAM, but tagged so the display
//!   thread knows where to scrape pixels from and so the guest's memory map
//!   reports it as reserved.
//!
//! ```text
//! Guest Physical              Host Virtual
//! ┌──────────────┐ 0x0
//! │ RAM          │ ─────────► mmap (slot 0)
//! ├──────────────┤
//! │ MMIO hole    │    (no backing, traps to the VMM)
//! ├──────────────┤
//! │ Framebuffer  │ ─────────► mmap (slot 1)
//! └──────────────┘
//! ```
//!
//! Regions may not overlap. Their insertion order is preserved because the
//! E820 table handed to the guest is a snapshot of the region list.
//!
//! Memory slot numbers are never reused within a VM's lifetime: KVM keys
//! slots by number, and recycling a freed number for a different region is a
//! reliable way to confuse the kernel side.
//!
//! The region table sits behind a mutex: the vCPU thread and the display
//! thread both read guest memory, and a device model may grow the table after
//! boot.

use std::sync::Mutex;

use thiserror::Error;
use vm_memory::MmapRegion;

/// Host page size assumed for guest RAM alignment.
pub const PAGE_SIZE: u64 = 4096;

/// Round `value` up to the next page boundary.
pub const fn align_up(value: u64) -> u64 {
    (value + (PAGE_SIZE - 1)) & !(PAGE_SIZE - 1)
}

/// Round `value` down to a page boundary.
pub const fn align_down(value: u64) -> u64 {
    value & !(PAGE_SIZE - 1)
}

/// Whether `value` is page-aligned.
pub const fn is_aligned(value: u64) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

/// Errors from guest memory management.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The requested region intersects an existing one.
    #[error("guest region {guest_phys:#x}+{size:#x} overlaps an existing region")]
    Overlap { guest_phys: u64, size: u64 },

    /// Zero-sized regions are not representable.
    #[error("guest region must have a non-zero size")]
    EmptyRegion,

    /// No region contains the given guest-physical address.
    #[error("no region backs guest address {0:#x}")]
    Unmapped(u64),

    /// The region at the given address does not support the access
    /// (for example a host-side write into an MMIO hole).
    #[error("region at guest address {0:#x} does not support this access")]
    WrongKind(u64),

    /// The host refused to back the region with anonymous memory.
    #[error("failed to mmap guest memory: {0}")]
    Mmap(String),

    /// The hypervisor rejected the memory-slot registration.
    #[error("failed to register memory slot: {0}")]
    Slot(#[source] std::io::Error),
}

/// Semantics of a guest-physical region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Host-backed RAM, usable by the guest.
    Ram,
    /// Unbacked hole; accesses trap to the VMM.
    Mmio,
    /// Host-backed pixel memory, reserved in the guest's memory map.
    Framebuffer,
}

/// E820 region types reported to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum E820Type {
    /// Usable RAM.
    Usable = 1,
    /// Reserved; the guest must not treat it as RAM.
    Reserved = 2,
}

/// One entry of the exported E820 memory map.
#[derive(Debug, Clone, Copy)]
pub struct E820Entry {
    pub base: u64,
    pub size: u64,
    pub kind: E820Type,
}

/// The host-hypervisor surface the memory manager needs.
///
/// [`GuestMemory`] talks to KVM only through this trait so the region logic
/// can be exercised without /dev/kvm. The KVM VM file descriptor implements
/// it by issuing `KVM_SET_USER_MEMORY_REGION`.
pub trait SlotBackend {
    /// Map `size` bytes of host memory at `host_addr` into the guest at
    /// `guest_phys`, under the given slot number.
    fn register_slot(
        &self,
        slot: u32,
        guest_phys: u64,
        size: u64,
        host_addr: u64,
    ) -> std::io::Result<()>;

    /// Drop the mapping for `slot` by shrinking it to zero bytes.
    ///
    /// Some host kernels refuse this; callers must tolerate an error and fall
    /// back to plain munmap.
    fn clear_slot(&self, slot: u32, guest_phys: u64, host_addr: u64) -> std::io::Result<()>;
}

/// One guest-physical region.
struct Region {
    guest_phys: u64,
    size: u64,
    kind: RegionKind,
    slot: Option<u32>,
    mapping: Option<MmapRegion>,
}

impl Region {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.guest_phys && addr < self.guest_phys + self.size
    }

    /// Half-open interval intersection test.
    fn overlaps(&self, guest_phys: u64, size: u64) -> bool {
        self.guest_phys < guest_phys + size && guest_phys < self.guest_phys + self.size
    }
}

struct MemoryState {
    /// Regions in insertion order (the E820 export depends on it).
    regions: Vec<Region>,
    /// Next memory slot number; monotonically increasing, never recycled.
    next_slot: u32,
}

/// The guest-physical memory map of one VM.
pub struct GuestMemory {
    state: Mutex<MemoryState>,
}

impl GuestMemory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                regions: Vec::new(),
                next_slot: 0,
            }),
        }
    }

    /// Add a region at `guest_phys`.
    ///
    /// RAM and framebuffer regions get an anonymous host mapping of exactly
    /// `size` bytes and a fresh memory slot registered through `slots`; MMIO
    /// regions are recorded only. Fails if the region would overlap an
    /// existing one. KVM requires page alignment for backed regions; callers
    /// round sizes with [`align_up`].
    pub fn alloc(
        &self,
        slots: &impl SlotBackend,
        guest_phys: u64,
        size: u64,
        kind: RegionKind,
    ) -> Result<(), MemoryError> {
        if size == 0 {
            return Err(MemoryError::EmptyRegion);
        }

        let mut state = self.state.lock().unwrap();
        if state.regions.iter().any(|r| r.overlaps(guest_phys, size)) {
            return Err(MemoryError::Overlap { guest_phys, size });
        }

        let region = match kind {
            RegionKind::Mmio => Region {
                guest_phys,
                size,
                kind,
                slot: None,
                mapping: None,
            },
            RegionKind::Ram | RegionKind::Framebuffer => {
                let mapping = MmapRegion::new(size as usize)
                    .map_err(|e| MemoryError::Mmap(e.to_string()))?;

                // If the slot registration fails the mapping is dropped, and
                // with it the mmap, before we return.
                let slot = state.next_slot;
                slots
                    .register_slot(slot, guest_phys, size, mapping.as_ptr() as u64)
                    .map_err(MemoryError::Slot)?;
                state.next_slot += 1;

                Region {
                    guest_phys,
                    size,
                    kind,
                    slot: Some(slot),
                    mapping: Some(mapping),
                }
            }
        };

        state.regions.push(region);
        Ok(())
    }

    /// Copy `buf` into guest RAM at `dest`.
    ///
    /// The copy is truncated at the end of the containing region; the number
    /// of bytes written is returned. Only RAM accepts host-side writes.
    pub fn write(&self, dest: u64, buf: &[u8]) -> Result<usize, MemoryError> {
        let state = self.state.lock().unwrap();
        let region = state
            .regions
            .iter()
            .find(|r| r.contains(dest))
            .ok_or(MemoryError::Unmapped(dest))?;

        if region.kind != RegionKind::Ram {
            return Err(MemoryError::WrongKind(dest));
        }
        let mapping = region.mapping.as_ref().ok_or(MemoryError::WrongKind(dest))?;

        let offset = (dest - region.guest_phys) as usize;
        let len = buf.len().min(region.size as usize - offset);
        // SAFETY: offset + len is bounded by the region size, which equals the
        // mapping size, and the mapping lives as long as the region table.
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), mapping.as_ptr().add(offset), len);
        }
        Ok(len)
    }

    /// Copy guest memory at `src` into `buf`.
    ///
    /// Defined for RAM and framebuffer regions; truncated at the region end.
    pub fn read(&self, src: u64, buf: &mut [u8]) -> Result<usize, MemoryError> {
        let state = self.state.lock().unwrap();
        let region = state
            .regions
            .iter()
            .find(|r| r.contains(src))
            .ok_or(MemoryError::Unmapped(src))?;

        let mapping = region.mapping.as_ref().ok_or(MemoryError::WrongKind(src))?;

        let offset = (src - region.guest_phys) as usize;
        let len = buf.len().min(region.size as usize - offset);
        // SAFETY: bounds as in `write`.
        unsafe {
            std::ptr::copy_nonoverlapping(mapping.as_ptr().add(offset), buf.as_mut_ptr(), len);
        }
        Ok(len)
    }

    /// The host virtual address corresponding to `guest_phys`, for any region
    /// that carries a host mapping.
    pub fn host_addr(&self, guest_phys: u64) -> Option<u64> {
        let state = self.state.lock().unwrap();
        let region = state.regions.iter().find(|r| r.contains(guest_phys))?;
        let mapping = region.mapping.as_ref()?;
        Some(mapping.as_ptr() as u64 + (guest_phys - region.guest_phys))
    }

    /// Snapshot the memory map as E820 entries, in region insertion order.
    ///
    /// RAM exports as usable; MMIO holes and the framebuffer as reserved.
    pub fn e820(&self) -> Vec<E820Entry> {
        let state = self.state.lock().unwrap();
        state
            .regions
            .iter()
            .map(|r| E820Entry {
                base: r.guest_phys,
                size: r.size,
                kind: match r.kind {
                    RegionKind::Ram => E820Type::Usable,
                    RegionKind::Mmio | RegionKind::Framebuffer => E820Type::Reserved,
                },
            })
            .collect()
    }

    /// Tear the memory map down, asking the hypervisor to drop each slot.
    ///
    /// Slot removal is known to be refused by some host kernels; a rejection
    /// is logged and the host mapping is released by the region drop anyway.
    pub fn release(&self, slots: &impl SlotBackend) {
        let mut state = self.state.lock().unwrap();
        for region in state.regions.drain(..) {
            if let (Some(slot), Some(mapping)) = (region.slot, region.mapping.as_ref()) {
                if let Err(e) = slots.clear_slot(slot, region.guest_phys, mapping.as_ptr() as u64) {
                    eprintln!("[KVM] slot {slot} not cleared ({e}); munmap only");
                }
            }
        }
    }
}

impl Default for GuestMemory {
    fn default() -> Self {
        Self::new()
    }
}

/// Slot backend that records nothing; for exercising the region logic
/// without a hypervisor.
#[cfg(test)]
pub(crate) struct NullSlots;

#[cfg(test)]
impl SlotBackend for NullSlots {
    fn register_slot(&self, _: u32, _: u64, _: u64, _: u64) -> std::io::Result<()> {
        Ok(())
    }

    fn clear_slot(&self, _: u32, _: u64, _: u64) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_rejected() {
        let mem = GuestMemory::new();
        mem.alloc(&NullSlots, 0, 0x1000, RegionKind::Ram).unwrap();
        let err = mem
            .alloc(&NullSlots, 0x800, 0x1000, RegionKind::Ram)
            .unwrap_err();
        assert!(matches!(err, MemoryError::Overlap { .. }));
    }

    #[test]
    fn test_adjacent_regions_allowed() {
        let mem = GuestMemory::new();
        mem.alloc(&NullSlots, 0, 0x1000, RegionKind::Ram).unwrap();
        mem.alloc(&NullSlots, 0x1000, 0x1000, RegionKind::Ram)
            .unwrap();
    }

    #[test]
    fn test_write_read_round_trip() {
        let mem = GuestMemory::new();
        mem.alloc(&NullSlots, 0, 1 << 20, RegionKind::Ram).unwrap();

        let data: Vec<u8> = (0..100u8).collect();
        assert_eq!(mem.write(0x1234, &data).unwrap(), 100);

        let mut out = vec![0u8; 100];
        assert_eq!(mem.read(0x1234, &mut out).unwrap(), 100);
        assert_eq!(out, data);
    }

    #[test]
    fn test_write_truncated_at_region_end() {
        let mem = GuestMemory::new();
        mem.alloc(&NullSlots, 0, 0x1000, RegionKind::Ram).unwrap();
        assert_eq!(mem.write(0x1000 - 4, &[0xAA; 8]).unwrap(), 4);
    }

    #[test]
    fn test_mmio_region_refuses_access() {
        let mem = GuestMemory::new();
        mem.alloc(&NullSlots, 0x1000, 0x1000, RegionKind::Mmio)
            .unwrap();
        assert!(matches!(
            mem.write(0x1000, &[1]).unwrap_err(),
            MemoryError::WrongKind(0x1000)
        ));
        let mut buf = [0u8; 1];
        assert!(matches!(
            mem.read(0x1000, &mut buf).unwrap_err(),
            MemoryError::WrongKind(0x1000)
        ));
    }

    #[test]
    fn test_framebuffer_readable_not_host_writable() {
        let mem = GuestMemory::new();
        mem.alloc(&NullSlots, 0, 0x1000, RegionKind::Framebuffer)
            .unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(mem.read(0, &mut buf).unwrap(), 4);
        assert!(matches!(
            mem.write(0, &[1]).unwrap_err(),
            MemoryError::WrongKind(0)
        ));
    }

    #[test]
    fn test_unmapped_address() {
        let mem = GuestMemory::new();
        assert!(matches!(
            mem.write(0x5000, &[1]).unwrap_err(),
            MemoryError::Unmapped(0x5000)
        ));
    }

    #[test]
    fn test_zero_size_rejected() {
        let mem = GuestMemory::new();
        assert!(matches!(
            mem.alloc(&NullSlots, 0, 0, RegionKind::Ram).unwrap_err(),
            MemoryError::EmptyRegion
        ));
    }

    #[test]
    fn test_e820_insertion_order_and_types() {
        let mem = GuestMemory::new();
        mem.alloc(&NullSlots, 0, 1 << 30, RegionKind::Ram).unwrap();
        mem.alloc(&NullSlots, 0xC000_0000, 0x1000, RegionKind::Mmio)
            .unwrap();
        mem.alloc(&NullSlots, 0xD000_0000, 0x1000, RegionKind::Ram)
            .unwrap();

        let table = mem.e820();
        assert_eq!(table.len(), 3);
        assert_eq!(table[0].base, 0);
        assert_eq!(table[0].size, 1 << 30);
        assert_eq!(table[0].kind, E820Type::Usable);
        assert_eq!(table[1].base, 0xC000_0000);
        assert_eq!(table[1].kind, E820Type::Reserved);
        assert_eq!(table[2].kind, E820Type::Usable);
    }

    #[test]
    fn test_host_addr_translates_region_base() {
        let mem = GuestMemory::new();
        mem.alloc(&NullSlots, 0x10_0000, 0x2000, RegionKind::Ram)
            .unwrap();

        let base = mem.host_addr(0x10_0000).unwrap();
        assert_eq!(mem.host_addr(0x10_0800).unwrap(), base + 0x800);
        assert_eq!(mem.host_addr(0x5000), None);
    }

    #[test]
    fn test_mmio_has_no_host_addr() {
        let mem = GuestMemory::new();
        mem.alloc(&NullSlots, 0x1000, 0x1000, RegionKind::Mmio)
            .unwrap();
        assert_eq!(mem.host_addr(0x1000), None);
    }

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_down(PAGE_SIZE + 1), PAGE_SIZE);
        assert!(is_aligned(PAGE_SIZE * 3));
        assert!(!is_aligned(PAGE_SIZE + 2));
    }
}
