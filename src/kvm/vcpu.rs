//! Virtual CPU management.
//!
//! A [`Vcpu`] wraps the KVM vCPU file descriptor and owns the CPU-state side
//! of guest bring-up: general and special register access and the initial
//! execution-mode setup.
//!
//! # Execution modes
//!
//! Two modes are supported, selected at [`Vcpu::set_mode`] time:
//!
//! - **Real mode**: the CS selector and base are zeroed; the guest starts out
//!   in 16-bit real mode as a PC would after reset.
//! - **32-bit protected mode**: a flat two-descriptor model is installed
//!   through the special registers (KVM fills the hidden descriptor caches
//!   directly, so no GDT needs to exist in guest memory): a code segment at
//!   selector 0x08 and a data segment at 0x10, both base 0, limit 0xFFFFFFFF,
//!   4 KiB granularity, 32-bit default operand size. CR0.PE is set.
//!
//! In both cases the general registers are zeroed and RFLAGS gets its
//! always-one bit. The instruction pointer is deliberately left for the
//! loaders: each boot protocol has its own entry-point and register handoff
//! rules (see [`crate::boot`]).

use kvm_bindings::{kvm_regs, kvm_segment, kvm_sregs};

use super::KvmError;

/// Build an x86 segment selector from a GDT index, table indicator and RPL.
const fn segment_selector(index: u16, ti: u16, rpl: u16) -> u16 {
    (index << 3) | ((ti & 0x1) << 2) | (rpl & 0x3)
}

/// GDT descriptor type bits for code and data segments.
mod gdt_type {
    /// Data segment: writable.
    pub const WRITABLE: u8 = 1 << 1;
    /// Code segment: readable.
    pub const READABLE: u8 = 1 << 1;
    /// Code segment: executable.
    pub const EXECUTABLE: u8 = 1 << 3;
}

/// CR0 control register bits.
mod cr0 {
    /// Protection enable.
    pub const PE: u64 = 1 << 0;
}

/// RFLAGS bit 1 is reserved and always reads as one.
const RFLAGS_RESERVED: u64 = 1 << 1;

/// Initial execution mode of the vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    /// 16-bit real mode.
    Real,
    /// 32-bit protected mode with a flat segment model.
    Protected,
}

/// Wrapper around the KVM vCPU file descriptor.
pub struct Vcpu {
    fd: kvm_ioctls::VcpuFd,
}

impl Vcpu {
    pub(crate) fn new(fd: kvm_ioctls::VcpuFd) -> Self {
        Self { fd }
    }

    /// Get the general-purpose registers.
    pub fn get_regs(&self) -> Result<kvm_regs, KvmError> {
        self.fd.get_regs().map_err(KvmError::GetRegisters)
    }

    /// Set the general-purpose registers.
    pub fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.fd.set_regs(regs).map_err(KvmError::SetRegisters)
    }

    /// Get the special registers.
    pub fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.fd.get_sregs().map_err(KvmError::GetRegisters)
    }

    /// Set the special registers.
    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.fd.set_sregs(sregs).map_err(KvmError::SetRegisters)
    }

    /// Enter the guest; returns on the next VM exit.
    pub(crate) fn run(&mut self) -> Result<kvm_ioctls::VcpuExit<'_>, kvm_ioctls::Error> {
        self.fd.run()
    }

    /// Put the vCPU into its initial execution mode.
    pub fn set_mode(&self, mode: CpuMode) -> Result<(), KvmError> {
        match mode {
            CpuMode::Real => self.enter_real_mode(),
            CpuMode::Protected => self.enter_protected_mode(),
        }
    }

    fn enter_real_mode(&self) -> Result<(), KvmError> {
        let mut sregs = self.get_sregs()?;
        sregs.cs.selector = 0;
        sregs.cs.base = 0;
        self.set_sregs(&sregs)?;

        self.reset_regs()
    }

    fn enter_protected_mode(&self) -> Result<(), KvmError> {
        let mut sregs = self.get_sregs()?;

        let code = kvm_segment {
            base: 0,
            limit: 0xFFFF_FFFF,
            selector: segment_selector(1, 0, 0),
            type_: gdt_type::READABLE | gdt_type::EXECUTABLE,
            present: 1,
            dpl: 0,
            db: 1, // 32-bit default operand size
            s: 1,  // code or data
            l: 0,
            g: 1, // 4 KiB granularity
            avl: 0,
            unusable: 0,
            padding: 0,
        };
        let data = kvm_segment {
            selector: segment_selector(2, 0, 0),
            type_: gdt_type::WRITABLE,
            ..code
        };

        sregs.cr0 |= cr0::PE;
        sregs.cs = code;
        sregs.ss = data;
        sregs.ds = data;
        sregs.es = data;
        sregs.fs = data;
        sregs.gs = data;
        self.set_sregs(&sregs)?;

        self.reset_regs()
    }

    /// Zero the general registers, leaving only the reserved RFLAGS bit.
    fn reset_regs(&self) -> Result<(), KvmError> {
        let regs = kvm_regs {
            rflags: RFLAGS_RESERVED,
            ..Default::default()
        };
        self.set_regs(&regs)
    }

    /// Print the general registers to stderr.
    pub fn dump_regs(&self) -> Result<(), KvmError> {
        let regs = self.get_regs()?;
        eprintln!(
            "[KVM] rax={:#018x} rbx={:#018x} rcx={:#018x} rdx={:#018x}",
            regs.rax, regs.rbx, regs.rcx, regs.rdx
        );
        eprintln!(
            "[KVM] rsi={:#018x} rdi={:#018x} rsp={:#018x} rbp={:#018x}",
            regs.rsi, regs.rdi, regs.rsp, regs.rbp
        );
        eprintln!(
            "[KVM] r8 ={:#018x} r9 ={:#018x} r10={:#018x} r11={:#018x}",
            regs.r8, regs.r9, regs.r10, regs.r11
        );
        eprintln!(
            "[KVM] r12={:#018x} r13={:#018x} r14={:#018x} r15={:#018x}",
            regs.r12, regs.r13, regs.r14, regs.r15
        );
        eprintln!(
            "[KVM] rip={:#018x} rflags={:#018x}",
            regs.rip, regs.rflags
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_selector() {
        assert_eq!(segment_selector(1, 0, 0), 0x08);
        assert_eq!(segment_selector(2, 0, 0), 0x10);
        assert_eq!(segment_selector(1, 1, 3), 0x0F);
    }
}
