//! Named event pipe for cross-process subscriber wakeup.
//!
//! Each subscription context owns one FIFO under the run directory,
//! `evpipe<N>.fifo`. Publishers open it by number and write a single byte
//! to wake the subscriber; the subscriber drains the pipe and walks its
//! channels. A full pipe means the subscriber is already signalled, so
//! `EAGAIN` on write is success.
//!
//! The owner keeps a read+write descriptor so publisher opens never block
//! on a missing reader.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::stat::Mode;

use crate::error::ShmResult;

fn pipe_path(run_dir: &Path, id: u32) -> PathBuf {
    run_dir.join(format!("evpipe{id}.fifo"))
}

/// One-shot signalling descriptor waking a subscription context.
pub struct EventPipe {
    file: File,
    path: PathBuf,
    id: u32,
    owner: bool,
}

impl EventPipe {
    /// Create the FIFO and open it for reading. Called by the subscription
    /// context that owns the pipe.
    pub fn create(run_dir: &Path, id: u32) -> ShmResult<Self> {
        let path = pipe_path(run_dir, id);
        match nix::unistd::mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR) {
            Ok(()) => {}
            Err(nix::Error::EEXIST) => {}
            Err(e) => return Err(e.into()),
        }
        // Read+write keeps the read end alive for publisher opens.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)?;
        Ok(Self {
            file,
            path,
            id,
            owner: true,
        })
    }

    /// Open an existing pipe for signalling. Called by publishers.
    pub fn open(run_dir: &Path, id: u32) -> ShmResult<Self> {
        let path = pipe_path(run_dir, id);
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)?;
        Ok(Self {
            file,
            path,
            id,
            owner: false,
        })
    }

    /// Pipe number, as stored in SHM subscription records.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Raw descriptor for integration with external event loops.
    pub fn as_raw_fd(&self) -> i32 {
        self.file.as_raw_fd()
    }

    /// Wake the subscriber with a single byte. A full pipe already has a
    /// pending wake, so `WouldBlock` is success.
    pub fn notify(&self) {
        match (&self.file).write(&[1u8]) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => tracing::warn!(pipe = self.id, "event pipe notify failed: {e}"),
        }
    }

    /// Drain all pending wakes. Returns whether at least one was pending.
    pub fn drain(&self) -> bool {
        let mut buf = [0u8; 64];
        let mut drained = false;
        loop {
            match (&self.file).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => drained = true,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(pipe = self.id, "event pipe drain failed: {e}");
                    break;
                }
            }
        }
        drained
    }

    /// Block until a wake arrives or `timeout` expires. Returns whether
    /// the pipe became readable.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
        ret > 0 && pfd.revents & libc::POLLIN != 0
    }
}

impl Drop for EventPipe {
    fn drop(&mut self) {
        if self.owner {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_and_drain() {
        let dir = tempfile::tempdir().unwrap();
        let owner = EventPipe::create(dir.path(), 1).unwrap();
        let publisher = EventPipe::open(dir.path(), 1).unwrap();

        assert!(!owner.drain());
        publisher.notify();
        publisher.notify();
        assert!(owner.wait(Duration::from_millis(100)));
        assert!(owner.drain());
        // A single drain consumes all pending wakes.
        assert!(!owner.drain());
    }

    #[test]
    fn wait_times_out_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let owner = EventPipe::create(dir.path(), 2).unwrap();
        assert!(!owner.wait(Duration::from_millis(20)));
    }

    #[test]
    fn owner_drop_removes_the_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let path = pipe_path(dir.path(), 3);
        {
            let _owner = EventPipe::create(dir.path(), 3).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn full_pipe_notify_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let owner = EventPipe::create(dir.path(), 4).unwrap();
        let publisher = EventPipe::open(dir.path(), 4).unwrap();

        // Saturate the pipe buffer; notify must stay quiet on WouldBlock.
        for _ in 0..100_000 {
            publisher.notify();
        }
        assert!(owner.drain());
    }
}
