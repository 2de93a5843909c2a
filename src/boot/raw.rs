//! Raw flat-binary loader.
//!
//! No parsing: the image bytes land at 0x7C00 and execution starts there.
//! This is how hand-assembled test guests and freestanding "kernels" built
//! with a linker script get in.

use super::{layout, BootError};
use crate::kvm::Vm;

/// Copy `image` to [`layout::RAW_LOAD_ADDR`] and point RIP at it.
pub fn load_raw(vm: &Vm, image: &[u8]) -> Result<(), BootError> {
    let written = vm.memory().write(layout::RAW_LOAD_ADDR, image)?;
    if written < image.len() {
        return Err(BootError::InvalidKernel(format!(
            "image of {} bytes does not fit in guest memory",
            image.len()
        )));
    }

    let mut regs = vm.get_regs()?;
    regs.rip = layout::RAW_LOAD_ADDR;
    vm.set_regs(&regs)?;

    eprintln!(
        "[Boot] raw image: {} bytes at {:#x}",
        image.len(),
        layout::RAW_LOAD_ADDR
    );
    Ok(())
}
