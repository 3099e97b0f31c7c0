//! Terminal geometry forwarding.
//!
//! The controlling terminal's size is read with `TIOCGWINSZ` and written onto
//! the child's end of the output pipe with `TIOCSWINSZ`, but only when it
//! actually changed since the last propagation.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use nix::libc;
use tracing::{debug, trace};

use crate::utils::sync::lock;

/// Rows/columns (and pixel extent) of a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    pub x_pixels: u16,
    pub y_pixels: u16,
}

impl From<libc::winsize> for WindowSize {
    fn from(ws: libc::winsize) -> Self {
        Self {
            rows: ws.ws_row,
            cols: ws.ws_col,
            x_pixels: ws.ws_xpixel,
            y_pixels: ws.ws_ypixel,
        }
    }
}

impl From<WindowSize> for libc::winsize {
    fn from(size: WindowSize) -> Self {
        libc::winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: size.x_pixels,
            ws_ypixel: size.y_pixels,
        }
    }
}

/// Where sizes are read from and where they are propagated to.
///
/// [`TtyWindowSize`] is the OS-backed implementation; tests substitute a
/// fake terminal.
pub trait WindowSizeIo: Send + Sync {
    /// Current size, or the zero size when no terminal is attached.
    fn query(&self) -> WindowSize;

    fn propagate(&self, size: WindowSize) -> io::Result<()>;
}

impl<T: WindowSizeIo + ?Sized> WindowSizeIo for Arc<T> {
    fn query(&self) -> WindowSize {
        (**self).query()
    }

    fn propagate(&self, size: WindowSize) -> io::Result<()> {
        (**self).propagate(size)
    }
}

/// Reads the size of the terminal behind `source` (stdin by default) and
/// applies it to the pipe endpoint shared with the output reader.
pub struct TtyWindowSize {
    source: RawFd,
    target: Arc<File>,
}

impl TtyWindowSize {
    pub fn new(target: Arc<File>) -> Self {
        Self::with_source(libc::STDIN_FILENO, target)
    }

    pub fn with_source(source: RawFd, target: Arc<File>) -> Self {
        Self { source, target }
    }
}

impl WindowSizeIo for TtyWindowSize {
    fn query(&self) -> WindowSize {
        let mut ws = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCGWINSZ only writes a `winsize` through the pointer,
        // which points at a live, correctly sized local.
        let rc = unsafe { libc::ioctl(self.source, libc::TIOCGWINSZ, &raw mut ws) };
        if rc < 0 {
            trace!(fd = self.source, "no terminal attached; using zero window size");
            return WindowSize::default();
        }
        ws.into()
    }

    fn propagate(&self, size: WindowSize) -> io::Result<()> {
        let ws: libc::winsize = size.into();
        // SAFETY: TIOCSWINSZ only reads a `winsize` through the pointer, and
        // the target descriptor stays open for as long as `self.target` lives.
        let rc = unsafe { libc::ioctl(self.target.as_raw_fd(), libc::TIOCSWINSZ, &raw const ws) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Propagates the terminal size on change, and only on change.
///
/// `refresh` may be called from the spawning thread and from window-change
/// notifications concurrently; the last propagated size is kept under a lock.
pub struct WindowSizeForwarder<T: WindowSizeIo> {
    io: T,
    last: Mutex<WindowSize>,
}

impl<T: WindowSizeIo> WindowSizeForwarder<T> {
    pub fn new(io: T) -> Self {
        Self {
            io,
            last: Mutex::new(WindowSize::default()),
        }
    }

    /// Query the terminal and propagate its size if it differs from the last
    /// one seen. Returns whether a propagation happened.
    pub fn refresh(&self) -> bool {
        let current = self.io.query();
        let mut last = lock(&self.last);
        if *last == current {
            return false;
        }
        *last = current;

        // A pipe is not a terminal, so most kernels answer ENOTTY here.
        if let Err(err) = self.io.propagate(current) {
            debug!(
                rows = current.rows,
                cols = current.cols,
                error = %err,
                "window size not applied to output pipe"
            );
        }
        true
    }

    pub fn last_size(&self) -> WindowSize {
        *lock(&self.last)
    }
}
