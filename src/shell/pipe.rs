//! Unidirectional pipe used to capture a child's merged output.

use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;

/// A pipe whose two ends are handed out at most once each.
///
/// Both ends are close-on-exec, so a child only ever sees the end that was
/// explicitly redirected into it. Once an end has been taken or closed the
/// channel never yields it again.
#[derive(Debug)]
pub struct PipeChannel {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
}

impl PipeChannel {
    pub fn open() -> io::Result<Self> {
        let (read, write) = open_cloexec().map_err(io::Error::from)?;
        Ok(Self {
            read: Some(read),
            write: Some(write),
        })
    }

    /// Take the read end as a `File` so it can be drained with `Read`.
    pub fn take_read(&mut self) -> Option<File> {
        self.read.take().map(File::from)
    }

    pub fn take_write(&mut self) -> Option<OwnedFd> {
        self.write.take()
    }

    pub fn close_write(&mut self) {
        drop(self.write.take());
    }

    /// True once both ends have been taken or closed.
    pub fn is_spent(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

#[cfg(not(target_vendor = "apple"))]
fn open_cloexec() -> nix::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
}

// No pipe2 on Apple platforms; the flag is set right after creation.
#[cfg(target_vendor = "apple")]
fn open_cloexec() -> nix::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::{FcntlArg, FdFlag, fcntl};
    use std::os::fd::AsRawFd;

    let (read, write) = nix::unistd::pipe()?;
    for fd in [&read, &write] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read, write))
}
