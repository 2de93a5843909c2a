//! Virtual machine ownership and the run loop.
//!
//! The [`Vm`] ties the whole machine together: the KVM file descriptors, the
//! single vCPU, the guest-physical memory map, the port-I/O and MMIO dispatch
//! tables, and (optionally) the framebuffer scraper thread. Devices register
//! into the per-VM tables before the run loop starts; nothing here is
//! process-global.
//!
//! # vCPU bring-up
//!
//! Before the vCPU exists, KVM wants a handful of x86-specific VM components:
//!
//! - **TSS region**: Intel VT-x insists on a 3-page Task State Segment area
//!   even though no hardware task switching happens. The address must not
//!   collide with any memory or MMIO region.
//! - **Identity map page**: one page used internally by VT-x when the guest
//!   runs with paging off.
//! - **IRQ chip**: optional in-kernel PIC + IOAPIC emulation, so interrupt
//!   delivery does not bounce through userspace.
//! - **PIT**: optional in-kernel 8254 timer, wanted by kernels that calibrate
//!   against it during early boot.
//!
//! After creating the vCPU, the host's supported CPUID is retrieved and
//! uploaded, with the hypervisor-signature leaf overwritten so guests that
//! look can tell who is underneath them.
//!
//! # The run loop
//!
//! [`Vm::step`] performs one `KVM_RUN` and dispatches the resulting exit:
//!
//! | Exit | Action |
//! |------|--------|
//! | I/O out, size 1/2 | port bus `out8`/`out16` |
//! | I/O in, size 1/2 | port bus `in8`/`in16`, zeros on miss |
//! | I/O, other sizes | logged, guest continues |
//! | MMIO write | MMIO bus fan-out |
//! | MMIO read | MMIO bus fan-out, zeros on miss |
//! | HLT | reported to the caller |
//! | anything else | fatal `UnknownExit` |
//!
//! [`Vm::run`] loops over `step`, treating HLT as a diagnostic: it logs,
//! dumps the registers, naps for a couple of seconds and resumes. Unhandled
//! port and MMIO accesses are logged with a cap so a guest probing the
//! platform (BIOS-style) cannot flood stderr.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kvm_bindings::{
    kvm_pit_config, kvm_regs, kvm_sregs, kvm_userspace_memory_region, KVM_MAX_CPUID_ENTRIES,
};
use kvm_ioctls::{Kvm, VcpuExit};

use super::memory::{GuestMemory, MemoryError, RegionKind, SlotBackend};
use super::vcpu::{CpuMode, Vcpu};
use super::KvmError;
use crate::devices::screen::{DisplaySink, Screen, ScreenError};
use crate::devices::{MmioBus, PortBus};

/// CPUID function number of the hypervisor vendor-signature leaf.
const CPUID_SIGNATURE_FUNCTION: u32 = 0x4000_0000;

/// "GRPHITEHYPERVISR", four ASCII words across eax/ebx/ecx/edx.
const CPUID_SIGNATURE: [&[u8; 4]; 4] = [b"GRPH", b"ITEH", b"YPER", b"VISR"];

/// Pause between a diagnostic HLT dump and resuming the guest.
const HALT_PAUSE: Duration = Duration::from_secs(2);

/// Cap on unhandled-access log lines.
const UNHANDLED_LOG_LIMIT: u64 = 32;

/// Configuration for [`Vm::vcpu_init`].
pub struct VcpuConfig {
    /// Initial execution mode.
    pub mode: CpuMode,
    /// Guest-physical address of the 3-page TSS region.
    pub tss_addr: u64,
    /// Guest-physical address of the identity map page.
    pub identity_map_addr: u64,
    /// Create the in-kernel PIC + IOAPIC.
    pub irqchip: bool,
    /// Create the in-kernel PIT (channel timer, flags 0).
    pub pit: bool,
}

impl Default for VcpuConfig {
    /// Protected mode with the control pages parked high in the 4 GiB hole,
    /// IRQ chip and PIT enabled.
    fn default() -> Self {
        Self {
            mode: CpuMode::Protected,
            tss_addr: 0xFFFF_D000,
            identity_map_addr: 0xFFFF_C000,
            irqchip: true,
            pit: true,
        }
    }
}

/// Outcome of a single run-loop step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunAction {
    /// The exit was dispatched; run again.
    Continue,
    /// The guest executed HLT.
    Halted,
}

/// A virtual machine: KVM handles, memory map, dispatch tables, one vCPU.
pub struct Vm {
    kvm: Kvm,
    fd: kvm_ioctls::VmFd,
    vcpu: Option<Vcpu>,
    memory: Arc<GuestMemory>,
    /// Port-I/O dispatch table. Register devices before calling `run`.
    pub ports: PortBus,
    /// MMIO dispatch table. Register regions before calling `run`.
    pub mmio: MmioBus,
    screen: Option<Screen>,
    unhandled_io: u64,
}

impl SlotBackend for kvm_ioctls::VmFd {
    fn register_slot(
        &self,
        slot: u32,
        guest_phys: u64,
        size: u64,
        host_addr: u64,
    ) -> std::io::Result<()> {
        let region = kvm_userspace_memory_region {
            slot,
            flags: 0,
            guest_phys_addr: guest_phys,
            memory_size: size,
            userspace_addr: host_addr,
        };
        // SAFETY: the caller (GuestMemory) keeps the host mapping alive for
        // as long as the region stays in its table, which outlives the slot.
        unsafe { self.set_user_memory_region(region) }
            .map_err(|e| std::io::Error::from_raw_os_error(e.errno()))
    }

    fn clear_slot(&self, slot: u32, guest_phys: u64, host_addr: u64) -> std::io::Result<()> {
        let region = kvm_userspace_memory_region {
            slot,
            flags: 0,
            guest_phys_addr: guest_phys,
            memory_size: 0,
            userspace_addr: host_addr,
        };
        // SAFETY: a zero-sized region removes the slot; no memory is handed
        // to the kernel.
        unsafe { self.set_user_memory_region(region) }
            .map_err(|e| std::io::Error::from_raw_os_error(e.errno()))
    }
}

impl Vm {
    pub(super) fn new(kvm: Kvm, fd: kvm_ioctls::VmFd) -> Self {
        Self {
            kvm,
            fd,
            vcpu: None,
            memory: Arc::new(GuestMemory::new()),
            ports: PortBus::new(),
            mmio: MmioBus::new(),
            screen: None,
            unhandled_io: 0,
        }
    }

    /// The guest-physical memory map.
    pub fn memory(&self) -> &Arc<GuestMemory> {
        &self.memory
    }

    /// Add a guest-physical region; see [`GuestMemory::alloc`].
    pub fn alloc(&self, guest_phys: u64, size: u64, kind: RegionKind) -> Result<(), MemoryError> {
        self.memory.alloc(&self.fd, guest_phys, size, kind)
    }

    /// Allocate the guest framebuffer at `fb_phys` and start the display
    /// thread that scrapes it into `sink`.
    pub fn attach_screen(
        &mut self,
        fb_phys: u64,
        sink: Box<dyn DisplaySink>,
    ) -> Result<(), ScreenError> {
        let screen = Screen::new(self.memory.clone(), &self.fd, fb_phys, sink)?;
        self.screen = Some(screen);
        Ok(())
    }

    /// Create and configure the vCPU.
    ///
    /// Sets the TSS and identity-map addresses, optionally instantiates the
    /// in-kernel IRQ chip and PIT, creates vCPU 0, uploads the host's
    /// supported CPUID with the signature leaf replaced, and enters the
    /// requested execution mode. The instruction pointer is left untouched;
    /// loaders set it along with their protocol registers.
    pub fn vcpu_init(&mut self, config: &VcpuConfig) -> Result<(), KvmError> {
        self.fd
            .set_tss_address(config.tss_addr as usize)
            .map_err(KvmError::SetTssAddress)?;
        self.fd
            .set_identity_map_address(config.identity_map_addr)
            .map_err(KvmError::SetIdentityMap)?;

        if config.irqchip {
            self.fd.create_irq_chip().map_err(KvmError::CreateIrqChip)?;
        }
        if config.pit {
            self.fd
                .create_pit2(kvm_pit_config::default())
                .map_err(KvmError::CreatePit2)?;
        }

        let fd = self.fd.create_vcpu(0).map_err(KvmError::CreateVcpu)?;

        // The guest sees the host's CPUID, except that the hypervisor
        // signature leaf identifies this VMM instead of KVM itself.
        let mut cpuid = self
            .kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(KvmError::GetSupportedCpuid)?;
        for entry in cpuid.as_mut_slice() {
            if entry.function == CPUID_SIGNATURE_FUNCTION {
                entry.eax = u32::from_le_bytes(*CPUID_SIGNATURE[0]);
                entry.ebx = u32::from_le_bytes(*CPUID_SIGNATURE[1]);
                entry.ecx = u32::from_le_bytes(*CPUID_SIGNATURE[2]);
                entry.edx = u32::from_le_bytes(*CPUID_SIGNATURE[3]);
            }
        }
        fd.set_cpuid2(&cpuid).map_err(KvmError::SetCpuid)?;

        let vcpu = Vcpu::new(fd);
        vcpu.set_mode(config.mode)?;
        self.vcpu = Some(vcpu);

        eprintln!("[KVM] vCPU 0 initialized in {:?} mode", config.mode);
        Ok(())
    }

    fn vcpu(&self) -> Result<&Vcpu, KvmError> {
        self.vcpu.as_ref().ok_or(KvmError::VcpuNotInitialized)
    }

    /// Get the vCPU's general-purpose registers.
    pub fn get_regs(&self) -> Result<kvm_regs, KvmError> {
        self.vcpu()?.get_regs()
    }

    /// Set the vCPU's general-purpose registers.
    pub fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.vcpu()?.set_regs(regs)
    }

    /// Get the vCPU's special registers.
    pub fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.vcpu()?.get_sregs()
    }

    /// Set the vCPU's special registers.
    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.vcpu()?.set_sregs(sregs)
    }

    /// Print the vCPU's registers to stderr.
    pub fn dump_regs(&self) -> Result<(), KvmError> {
        self.vcpu()?.dump_regs()
    }

    /// Run the guest until the next VM exit and dispatch it.
    pub fn step(&mut self) -> Result<RunAction, KvmError> {
        let vcpu = self.vcpu.as_mut().ok_or(KvmError::VcpuNotInitialized)?;

        let exit = match vcpu.run() {
            Ok(exit) => exit,
            // A signal or a pending host interrupt kicked us out of the
            // guest; nothing to dispatch.
            Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => {
                return Ok(RunAction::Continue)
            }
            Err(e) => return Err(KvmError::Run(e)),
        };

        match exit {
            VcpuExit::IoOut(port, data) => {
                let handled = match data.len() {
                    1 => self.ports.out8(port, data[0]),
                    2 => self.ports.out16(port, u16::from_le_bytes([data[0], data[1]])),
                    _ => false,
                };
                if !handled {
                    log_unhandled(
                        &mut self.unhandled_io,
                        format_args!("OUT port {:#06x} size {}", port, data.len()),
                    );
                }
                Ok(RunAction::Continue)
            }

            VcpuExit::IoIn(port, data) => {
                let handled = match data.len() {
                    1 => match self.ports.in8(port) {
                        Some(value) => {
                            data[0] = value;
                            true
                        }
                        None => false,
                    },
                    2 => match self.ports.in16(port) {
                        Some(value) => {
                            data[..2].copy_from_slice(&value.to_le_bytes());
                            true
                        }
                        None => false,
                    },
                    _ => false,
                };
                if !handled {
                    // The guest reads zeros from ports nobody claims.
                    data.fill(0);
                    log_unhandled(
                        &mut self.unhandled_io,
                        format_args!("IN port {:#06x} size {}", port, data.len()),
                    );
                }
                Ok(RunAction::Continue)
            }

            VcpuExit::MmioWrite(addr, data) => {
                if !self.mmio.handle_write(addr, data) {
                    log_unhandled(
                        &mut self.unhandled_io,
                        format_args!("MMIO write {:#010x} len {}", addr, data.len()),
                    );
                }
                Ok(RunAction::Continue)
            }

            VcpuExit::MmioRead(addr, data) => {
                // The bus zero-fills, so a miss reads as zeros either way.
                if !self.mmio.handle_read(addr, data) {
                    log_unhandled(
                        &mut self.unhandled_io,
                        format_args!("MMIO read {:#010x} len {}", addr, data.len()),
                    );
                }
                Ok(RunAction::Continue)
            }

            VcpuExit::Hlt => Ok(RunAction::Halted),

            VcpuExit::Shutdown => Err(KvmError::UnknownExit("Shutdown".into())),
            VcpuExit::InternalError => Err(KvmError::UnknownExit("InternalError".into())),
            VcpuExit::FailEntry(reason, _) => {
                Err(KvmError::UnknownExit(format!("FailEntry({reason:#x})")))
            }
            VcpuExit::SystemEvent(event, _) => {
                Err(KvmError::UnknownExit(format!("SystemEvent({event})")))
            }
            other => Err(KvmError::UnknownExit(format!("{other:?}"))),
        }
    }

    /// Drive the run loop until it fails.
    ///
    /// HLT is not fatal here: the registers are dumped for diagnosis and the
    /// guest is resumed after a short pause. The loop ends only on a run
    /// error or an unknown exit reason.
    pub fn run(&mut self) -> Result<(), KvmError> {
        loop {
            match self.step()? {
                RunAction::Continue => {}
                RunAction::Halted => {
                    eprintln!("[VMM] guest executed HLT, dumping registers");
                    self.dump_regs()?;
                    thread::sleep(HALT_PAUSE);
                }
            }
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        if let Some(mut screen) = self.screen.take() {
            screen.shutdown();
        }
        // Ask KVM to drop each slot; rejected removals are only logged, the
        // anonymous mappings are munmapped when the region table drains.
        self.memory.release(&self.fd);
    }
}

fn log_unhandled(count: &mut u64, what: std::fmt::Arguments<'_>) {
    *count += 1;
    if *count <= UNHANDLED_LOG_LIMIT {
        eprintln!("[I/O] unhandled {what}");
        if *count == UNHANDLED_LOG_LIMIT {
            eprintln!("[I/O] further unhandled accesses will not be logged");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot;
    use crate::devices::{MmioDevice, Serial, SerialHandle, COM1};
    use std::sync::Mutex;

    const MIB: u64 = 1 << 20;

    /// Tests below drive a real vCPU and are skipped where /dev/kvm is not
    /// usable (no module, no permission, no nested virt).
    fn kvm_available() -> bool {
        if super::super::create_vm().is_err() {
            eprintln!("skipping: /dev/kvm is not usable in this environment");
            return false;
        }
        true
    }

    /// A VM with RAM at 0, a COM1 serial port, and a vCPU in protected mode
    /// without the in-kernel IRQ chip (so HLT exits reach userspace).
    fn test_vm() -> (Vm, SerialHandle) {
        let mut vm = super::super::create_vm().unwrap();
        vm.alloc(0, MIB, RegionKind::Ram).unwrap();

        let (serial, handle) = Serial::new(COM1);
        let ports = serial.ports();
        vm.ports.register(&ports, Box::new(serial));

        vm.vcpu_init(&VcpuConfig {
            irqchip: false,
            pit: false,
            ..Default::default()
        })
        .unwrap();
        (vm, handle)
    }

    fn step_until_halt(vm: &mut Vm) {
        for _ in 0..10_000 {
            if vm.step().unwrap() == RunAction::Halted {
                return;
            }
        }
        panic!("guest did not halt");
    }

    #[test]
    fn test_protected_mode_entry() {
        if !kvm_available() {
            return;
        }
        let (vm, _handle) = test_vm();

        let sregs = vm.get_sregs().unwrap();
        assert_eq!(sregs.cr0 & 1, 1, "CR0.PE should be set");
        assert_eq!(sregs.cs.selector, 0x08);
        assert_eq!(sregs.cs.limit, 0xFFFF_FFFF);
        assert_eq!(sregs.cs.db, 1);
        assert_eq!(sregs.cs.g, 1);
        for seg in [sregs.ss, sregs.ds, sregs.es, sregs.fs, sregs.gs] {
            assert_eq!(seg.selector, 0x10);
            assert_eq!(seg.limit, 0xFFFF_FFFF);
        }
    }

    #[test]
    fn test_real_mode_entry() {
        if !kvm_available() {
            return;
        }
        let mut vm = super::super::create_vm().unwrap();
        vm.alloc(0, MIB, RegionKind::Ram).unwrap();
        vm.vcpu_init(&VcpuConfig {
            mode: CpuMode::Real,
            irqchip: false,
            pit: false,
            ..Default::default()
        })
        .unwrap();

        let sregs = vm.get_sregs().unwrap();
        assert_eq!(sregs.cs.selector, 0);
        assert_eq!(sregs.cs.base, 0);
    }

    #[test]
    fn test_out_reaches_serial() {
        if !kvm_available() {
            return;
        }
        let (mut vm, handle) = test_vm();

        // mov edx, 0x3f8; mov al, 'A'; out dx, al; hlt
        let code = [0xBA, 0xF8, 0x03, 0x00, 0x00, 0xB0, b'A', 0xEE, 0xF4];
        boot::load_raw(&vm, &code).unwrap();

        step_until_halt(&mut vm);

        let mut buf = [0u8; 8];
        assert_eq!(handle.read(&mut buf), 1);
        assert_eq!(buf[0], b'A');
    }

    #[test]
    fn test_hello_world_image() {
        if !kvm_available() {
            return;
        }
        let (mut vm, handle) = test_vm();

        let mut code = vec![0xBA, 0xF8, 0x03, 0x00, 0x00]; // mov edx, 0x3f8
        for &byte in b"Hello World\n" {
            code.extend_from_slice(&[0xB0, byte, 0xEE]); // mov al, byte; out dx, al
        }
        code.push(0xF4); // hlt
        boot::load_raw(&vm, &code).unwrap();

        step_until_halt(&mut vm);

        let mut buf = [0u8; 64];
        let n = handle.read(&mut buf);
        assert_eq!(&buf[..n], b"Hello World\n");
    }

    #[test]
    fn test_guest_echoes_host_bytes() {
        if !kvm_available() {
            return;
        }
        let (mut vm, handle) = test_vm();
        assert_eq!(handle.write(b"abc"), 3);

        // mov edx, 0x3f8; then three times: in al, dx; out dx, al; hlt
        let mut code = vec![0xBA, 0xF8, 0x03, 0x00, 0x00];
        for _ in 0..3 {
            code.extend_from_slice(&[0xEC, 0xEE]);
        }
        code.push(0xF4);
        boot::load_raw(&vm, &code).unwrap();

        step_until_halt(&mut vm);

        let mut buf = [0u8; 8];
        let n = handle.read(&mut buf);
        assert_eq!(&buf[..n], b"abc");
    }

    /// MMIO device that records every write it sees.
    struct WriteTap {
        writes: std::sync::Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
    }

    impl MmioDevice for WriteTap {
        fn read(&mut self, _addr: u64, _data: &mut [u8]) {}

        fn write(&mut self, addr: u64, data: &[u8]) {
            self.writes.lock().unwrap().push((addr, data.to_vec()));
        }
    }

    struct FrameCounter {
        frames: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl crate::devices::DisplaySink for FrameCounter {
        fn present(&mut self, _pixels: &[u8]) {
            self.frames
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    #[test]
    fn test_attach_screen_scrapes_frames() {
        if !kvm_available() {
            return;
        }
        let (mut vm, _handle) = test_vm();

        let frames = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        vm.attach_screen(
            0xC200_0000,
            Box::new(FrameCounter {
                frames: frames.clone(),
            }),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(120));
        drop(vm); // joins the scraper
        assert!(frames.load(std::sync::atomic::Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_mmio_write_tap() {
        if !kvm_available() {
            return;
        }
        let (mut vm, _handle) = test_vm();

        let writes = std::sync::Arc::new(Mutex::new(Vec::new()));
        vm.mmio
            .register(
                0xC000_0000,
                0x0100_0000,
                Box::new(WriteTap {
                    writes: writes.clone(),
                }),
            )
            .unwrap();

        // mov eax, 0xdeadbeef; mov [0xc0000000], eax; hlt
        let code = [
            0xB8, 0xEF, 0xBE, 0xAD, 0xDE, // mov eax, imm32
            0xA3, 0x00, 0x00, 0x00, 0xC0, // mov [0xc0000000], eax
            0xF4,
        ];
        boot::load_raw(&vm, &code).unwrap();

        step_until_halt(&mut vm);

        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, 0xC000_0000);
        assert_eq!(writes[0].1, vec![0xEF, 0xBE, 0xAD, 0xDE]);
    }
}
