//! graphite - a minimal KVM-based type-2 hypervisor.
//!
//! One vCPU, a handful of platform devices (16550 UART on COM1, ATAPI
//! CD-ROM, MMIO framebuffer), and three ways in: raw flat binaries, Linux
//! bzImages, and multiboot1 ELF kernels.
//!
//! This binary requires Linux with KVM support. It will not run elsewhere.

#[cfg(target_os = "linux")]
mod boot;
#[cfg(target_os = "linux")]
mod devices;
#[cfg(target_os = "linux")]
mod kvm;

use clap::Parser;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "graphite")]
#[command(about = "A minimal KVM-based type-2 hypervisor")]
struct Args {
    /// Path to the guest image (raw binary, Linux bzImage, or multiboot ELF)
    image: String,

    /// Force a loader instead of sniffing the image format
    #[arg(short, long, value_enum)]
    loader: Option<LoaderArg>,

    /// Guest memory size in megabytes
    #[arg(short, long, default_value = "512")]
    memory: u64,

    /// Kernel command line (bzImage and multiboot guests)
    #[arg(short, long, default_value = "console=ttyS0")]
    cmdline: String,

    /// Path to an ISO image backing the ATAPI CD-ROM
    #[arg(long)]
    cdrom: Option<String>,

    /// Allocate a guest framebuffer at this physical address (e.g. 0xC2000000)
    #[arg(long, value_parser = parse_guest_addr)]
    framebuffer: Option<u64>,

    /// Start the vCPU in real mode (raw images only)
    #[arg(long)]
    real_mode: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LoaderArg {
    Raw,
    Bzimage,
    Multiboot,
}

fn parse_guest_addr(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid guest address {s:?}: {e}"))
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    use boot::{BootError, ImageKind};
    use devices::{Atapi, Serial, COM1, FB_BPP, FB_HEIGHT, FB_WIDTH};
    use kvm::{align_up, CpuMode, RegionKind, VcpuConfig};
    use std::fs::File;

    eprintln!("[VMM] graphite starting");

    let image = std::fs::read(&args.image).map_err(BootError::ReadImage)?;
    let kind = match args.loader {
        Some(LoaderArg::Raw) => ImageKind::Raw,
        Some(LoaderArg::Bzimage) => ImageKind::BzImage,
        Some(LoaderArg::Multiboot) => ImageKind::Multiboot,
        None => boot::detect_kind(&image),
    };
    eprintln!(
        "[VMM] image: {} ({:?}, {} bytes)",
        args.image,
        kind,
        image.len()
    );

    if args.real_mode && kind != ImageKind::Raw {
        return Err("--real-mode only applies to raw images".into());
    }

    let mut vm = kvm::create_vm()?;
    vm.alloc(0, args.memory * 1024 * 1024, RegionKind::Ram)?;
    eprintln!("[VMM] memory: {} MB", args.memory);

    // COM1 plus the stdin/stdout bridge threads.
    let (serial, handle) = Serial::new(COM1);
    let ports = serial.ports();
    vm.ports.register(&ports, Box::new(serial));
    spawn_serial_bridge(handle);

    if let Some(path) = &args.cdrom {
        let backing =
            File::open(path).map_err(|e| format!("failed to open cdrom image {path}: {e}"))?;
        vm.ports.register(&Atapi::ports(), Box::new(Atapi::new(backing)));
        eprintln!("[VMM] ATAPI CD-ROM backed by {path}");
    }

    if let Some(fb_phys) = args.framebuffer {
        // The region is guest-visible even with no display attached; a
        // presentation sink would go through Vm::attach_screen instead.
        let fb_size = align_up((FB_WIDTH * FB_HEIGHT * FB_BPP) as u64);
        vm.alloc(fb_phys, fb_size, RegionKind::Framebuffer)?;
        eprintln!("[VMM] framebuffer at {fb_phys:#x} ({FB_WIDTH}x{FB_HEIGHT})");
    }

    // Raw guests run bare, like the reference test binaries; kernel-style
    // guests get the in-kernel IRQ chip and PIT.
    let wants_platform = kind != ImageKind::Raw;
    let mode = if args.real_mode {
        CpuMode::Real
    } else {
        CpuMode::Protected
    };
    vm.vcpu_init(&VcpuConfig {
        mode,
        irqchip: wants_platform,
        pit: wants_platform,
        ..Default::default()
    })?;

    match kind {
        ImageKind::Raw => boot::load_raw(&vm, &image)?,
        ImageKind::BzImage => boot::load_bzimage(&vm, &image, &args.cmdline)?,
        ImageKind::Multiboot => boot::load_multiboot(&vm, &image, &args.cmdline)?,
    }

    eprintln!("[VMM] starting vCPU");
    vm.run()?;
    Ok(())
}

/// Pump the UART: guest output to stdout, stdin to guest input.
///
/// Both threads poll the non-blocking queues and die with the process;
/// there is nothing to join on shutdown.
#[cfg(target_os = "linux")]
fn spawn_serial_bridge(handle: devices::SerialHandle) {
    use std::io::{Read, Write};
    use std::time::Duration;

    let output = handle.clone();
    std::thread::spawn(move || {
        let mut stdout = std::io::stdout();
        let mut buf = [0u8; 1024];
        loop {
            let n = output.read(&mut buf);
            if n > 0 {
                let _ = stdout.write_all(&buf[..n]);
                let _ = stdout.flush();
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    });

    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut sent = 0;
                    while sent < n {
                        let accepted = handle.write(&buf[sent..n]);
                        if accepted == 0 {
                            // Guest is not draining; retry until it does.
                            std::thread::sleep(Duration::from_millis(1));
                        }
                        sent += accepted;
                    }
                }
            }
        }
    });
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("graphite requires Linux with KVM support; this platform is not supported".into())
}
