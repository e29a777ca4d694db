//! Linux-specific shared memory operations.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;

use crate::error::{ShmError, ShmResult};

/// Create or open a shared file of at least `size` bytes and map it.
///
/// Returns the file handle together with the mapping; the file is kept open
/// so the region can be grown later with `ftruncate` + remap.
pub fn create_file_mmap(path: &Path, size: usize) -> ShmResult<(File, MmapMut)> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .mode(0o600)
        .open(path)?;

    if (file.metadata()?.len() as usize) < size {
        file.set_len(size as u64)?;
    }

    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok((file, mmap))
}

/// Attach to an existing shared file and map its full length.
pub fn attach_file_mmap(path: &Path) -> ShmResult<(File, MmapMut)> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok((file, mmap))
}

/// Remap a grown file. The previous mapping must already be dropped by the
/// caller; files only ever grow, so existing offsets stay valid.
pub fn remap_file(file: &File) -> ShmResult<MmapMut> {
    let mmap = unsafe { MmapOptions::new().map_mut(file)? };
    Ok(mmap)
}

/// Take the instance creation lock, serializing create-or-attach of the
/// main and ext regions across processes. Released on drop.
pub fn create_lock(run_dir: &Path) -> ShmResult<nix::fcntl::Flock<File>> {
    use nix::fcntl::{Flock, FlockArg};

    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .mode(0o600)
        .open(run_dir.join("create.lock"))?;
    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| ShmError::Nix { source: errno })
}

/// Check if a process is alive using `kill(pid, 0)`.
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Null signal tests for existence without delivering anything.
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false,
        Err(nix::Error::EPERM) => true,
        Err(_) => false,
    }
}

/// Get the current process ID.
pub fn current_pid() -> u32 {
    getpid().as_raw() as u32
}

/// Wall-clock time in nanoseconds since the epoch, as stored in SHM
/// timestamps.
pub fn wall_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Round `size` up to the next power of two, at least `min`.
pub fn next_pow2(size: usize, min: usize) -> usize {
    let mut s = min.max(1);
    while s < size {
        s *= 2;
    }
    s
}
