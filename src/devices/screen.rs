//! Guest framebuffer presentation.
//!
//! The guest draws into a linear 640x400 32-bpp framebuffer living in a
//! dedicated guest-physical region; nothing on the host side ever writes a
//! pixel. A scraper thread reads the whole framebuffer on a ~60 Hz cadence
//! and hands the pixels to a [`DisplaySink`], which is whatever the embedder
//! wants: an SDL window, a PNG dumper, a test recorder.
//!
//! The thread carries a stop flag and is joined on [`Screen::shutdown`] (or
//! drop), so tearing a VM down does not leave a scraper running against
//! freed guest memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::kvm::{align_up, GuestMemory, MemoryError, RegionKind, SlotBackend};

/// Framebuffer width in pixels.
pub const FB_WIDTH: usize = 640;
/// Framebuffer height in pixels.
pub const FB_HEIGHT: usize = 400;
/// Bytes per pixel.
pub const FB_BPP: usize = 4;

/// Scrape cadence, about 60 frames per second.
const FRAME_INTERVAL: Duration = Duration::from_millis(1000 / 60);

/// Errors from display setup.
#[derive(Error, Debug)]
pub enum ScreenError {
    /// The framebuffer region could not be allocated.
    #[error("failed to allocate framebuffer: {0}")]
    Memory(#[from] MemoryError),

    /// The scraper thread could not be spawned.
    #[error("failed to spawn display thread: {0}")]
    Thread(#[source] std::io::Error),
}

/// Consumer of scraped frames. Runs on the display thread.
pub trait DisplaySink: Send {
    /// Present one frame of `FB_WIDTH * FB_HEIGHT * FB_BPP` pixel bytes.
    fn present(&mut self, pixels: &[u8]);
}

/// The running framebuffer scraper.
pub struct Screen {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Screen {
    /// Allocate the framebuffer region at `fb_phys` and start scraping it
    /// into `sink`.
    pub fn new(
        memory: Arc<GuestMemory>,
        slots: &impl SlotBackend,
        fb_phys: u64,
        mut sink: Box<dyn DisplaySink>,
    ) -> Result<Self, ScreenError> {
        let fb_size = align_up((FB_WIDTH * FB_HEIGHT * FB_BPP) as u64);
        memory.alloc(slots, fb_phys, fb_size, RegionKind::Framebuffer)?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread = thread::Builder::new()
            .name("screen".into())
            .spawn(move || {
                let mut pixels = vec![0u8; FB_WIDTH * FB_HEIGHT * FB_BPP];
                while !thread_stop.load(Ordering::Relaxed) {
                    thread::sleep(FRAME_INTERVAL);
                    if memory.read(fb_phys, &mut pixels).is_ok() {
                        sink.present(&pixels);
                    }
                }
            })
            .map_err(ScreenError::Thread)?;

        eprintln!(
            "[Screen] framebuffer at {:#x}, {}x{}x{}",
            fb_phys, FB_WIDTH, FB_HEIGHT, FB_BPP
        );
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stop the scraper and wait for it to exit.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Screen {
    fn drop(&mut self) {
        self.shutdown();
    }
}
