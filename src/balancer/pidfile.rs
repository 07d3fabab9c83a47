//! PID lock file. Holding an exclusive advisory record lock on the file for
//! the lifetime of the process is what enforces the single-balancer-instance
//! rule; a second instance fails at startup instead of fighting over the
//! listening port.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};

use crate::Error;

/// An acquired PID lock. The lock is released when this is dropped (or the
/// process exits), never earlier.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    _file: File,
}

impl PidFile {
    /// Creates (or reuses) the file at `path`, takes the exclusive lock and
    /// writes the current PID into it. Fails with [`Error::PidFileHeld`] if
    /// another process holds the lock.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        // Write lock from byte 0 to the end of the file, non blocking:
        // failing fast is the point.
        let lock = libc::flock {
            l_type: libc::F_WRLCK as libc::c_short,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: 0,
            l_len: 0,
            l_pid: 0,
        };

        let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &lock) };
        if ret == -1 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EACCES) => {
                    Err(Error::PidFileHeld(path.display().to_string()))
                }
                _ => Err(err.into()),
            };
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rlb-{}-{name}.pid", std::process::id()))
    }

    #[test]
    fn acquire_writes_the_pid() {
        let path = scratch("write");
        let lock = PidFile::acquire(&path).unwrap();

        let contents = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        drop(lock);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn reacquire_after_release_succeeds() {
        let path = scratch("reacquire");

        drop(PidFile::acquire(&path).unwrap());
        assert!(PidFile::acquire(&path).is_ok());

        std::fs::remove_file(&path).unwrap();
    }
}
