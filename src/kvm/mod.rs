//! KVM (Kernel-based Virtual Machine) wrapper module.
//!
//! Everything that talks to the host kernel's virtualization interface lives
//! here. The VMM communicates with KVM through ioctls on three file
//! descriptors:
//!
//! - `/dev/kvm` - system-level operations (create VMs, query supported CPUID)
//! - VM file descriptor - VM-level operations (memory slots, vCPU creation,
//!   in-kernel IRQ chip and PIT)
//! - vCPU file descriptor - vCPU-level operations (registers, run)
//!
//! ```text
//! User Space (VMM)                    Kernel Space (KVM)
//! ┌──────────────┐                   ┌──────────────────┐
//! │   graphite   │                   │   KVM Module     │
//! │              │    ioctl()        │  ┌────────────┐  │
//! │  Vm ─────────┼──────────────────►│  │ VM State   │  │
//! │              │                   │  └────────────┘  │
//! │  Vcpu ───────┼──────────────────►│  ┌────────────┐  │
//! │              │                   │  │ vCPU State │  │
//! └──────────────┘                   │  └────────────┘  │
//!                                    └──────────────────┘
//! ```
//!
//! # Execution model
//!
//! The thread that owns the [`Vm`] drives the run loop: it enters the guest
//! with `KVM_RUN`, and KVM returns whenever the guest performs an operation
//! the host must emulate (a VM exit). Port I/O exits are routed to the
//! VM's [`crate::devices::PortBus`], MMIO exits to its
//! [`crate::devices::MmioBus`], and HLT is treated as a diagnostic pause.
//! Every other exit reason tears the loop down.
//!
//! The guest-physical address space is managed by [`GuestMemory`]: host-backed
//! RAM and framebuffer regions become KVM memory slots, MMIO holes stay
//! unbacked so guest accesses trap out to the VMM.

mod memory;
mod vcpu;
mod vm;

pub use memory::{
    align_down, align_up, is_aligned, E820Entry, E820Type, GuestMemory, MemoryError, RegionKind,
    SlotBackend, PAGE_SIZE,
};
#[cfg(test)]
pub(crate) use memory::NullSlots;
pub use vcpu::{CpuMode, Vcpu};
pub use vm::{RunAction, Vm, VcpuConfig};

use kvm_ioctls::Kvm;
use thiserror::Error;

/// Errors that can occur during KVM operations.
#[derive(Error, Debug)]
pub enum KvmError {
    /// Failed to open the /dev/kvm device.
    ///
    /// This usually means KVM is not available (module not loaded, or no
    /// nested virtualization), or the user lacks permission on /dev/kvm.
    #[error("failed to open /dev/kvm: {0}")]
    OpenKvm(#[source] kvm_ioctls::Error),

    /// Failed to create a new VM.
    #[error("failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    /// Failed to set the TSS address (required by Intel VT-x).
    #[error("failed to set TSS address: {0}")]
    SetTssAddress(#[source] kvm_ioctls::Error),

    /// Failed to set the identity map address.
    #[error("failed to set identity map address: {0}")]
    SetIdentityMap(#[source] kvm_ioctls::Error),

    /// Failed to create the in-kernel IRQ chip.
    #[error("failed to create IRQ chip: {0}")]
    CreateIrqChip(#[source] kvm_ioctls::Error),

    /// Failed to create the in-kernel PIT.
    #[error("failed to create PIT2: {0}")]
    CreatePit2(#[source] kvm_ioctls::Error),

    /// Failed to create a vCPU.
    #[error("failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    /// Failed to get supported CPUID entries from KVM.
    #[error("failed to get supported CPUID: {0}")]
    GetSupportedCpuid(#[source] kvm_ioctls::Error),

    /// Failed to set CPUID entries on the vCPU.
    #[error("failed to set CPUID: {0}")]
    SetCpuid(#[source] kvm_ioctls::Error),

    /// Failed to get CPU registers.
    #[error("failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    /// Failed to set CPU registers.
    #[error("failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    /// The KVM_RUN ioctl itself failed.
    #[error("failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),

    /// A vCPU entry point was called before `vcpu_init`.
    #[error("vCPU is not initialized")]
    VcpuNotInitialized,

    /// The guest triggered a VM exit the run loop does not handle.
    #[error("unhandled VM exit: {0}")]
    UnknownExit(String),
}

/// Open the KVM device and create a new virtual machine.
///
/// The returned [`Vm`] owns the system and VM file descriptors, an empty
/// guest-physical memory map, and empty port-I/O and MMIO dispatch tables.
/// Call [`Vm::alloc`] to populate guest memory and [`Vm::vcpu_init`] to make
/// it runnable.
pub fn create_vm() -> Result<Vm, KvmError> {
    let kvm = Kvm::new().map_err(KvmError::OpenKvm)?;
    let fd = kvm.create_vm().map_err(KvmError::CreateVm)?;

    Ok(Vm::new(kvm, fd))
}
