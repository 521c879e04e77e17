//! Advisory file lock guarding the compile+apply sequence.

use thiserror::Error;

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

pub const DEFAULT_LOCKFILE: &str = "/var/lock/pvefw.lck";
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const RETRY_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum Error {
    #[error("timeout while waiting for lock `{0}`")]
    Timeout(String),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// Run `f` while holding an exclusive flock on `path`, giving up after
/// `timeout`. The lock is released when the file closes on return.
pub fn lock_file<T>(path: &Path, timeout: Duration, f: impl FnOnce() -> T) -> Result<T, Error> {
    let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
    let deadline = Instant::now() + timeout;
    loop {
        let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if res == 0 {
            break;
        }
        let error = std::io::Error::last_os_error();
        if error.kind() != std::io::ErrorKind::WouldBlock {
            return Err(error.into());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout(path.display().to_string()));
        }
        std::thread::sleep(RETRY_INTERVAL);
    }
    Ok(f())
}
