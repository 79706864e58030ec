//
// Advisory lock around read-allocate-persist of the project files.
//
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// An exclusive `flock(2)` on a lock file. Released on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Open (creating if needed) and lock `path`. Blocks until the lock is free.
    pub fn acquire(path: impl AsRef<Path>) -> io::Result<StoreLock> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        loop {
            match unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } {
                0 => break,
                _ => {
                    let e = io::Error::last_os_error();
                    if e.kind() != io::ErrorKind::Interrupted {
                        return Err(e);
                    }
                },
            }
        }
        trace!("StoreLock: locked {:?}", path);
        Ok(StoreLock {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Like `acquire`, but returns `None` if someone else holds the lock.
    pub fn try_acquire(path: impl AsRef<Path>) -> io::Result<Option<StoreLock>> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        match unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } {
            0 => {},
            _ => {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::WouldBlock {
                    return Ok(None);
                }
                return Err(e);
            },
        }
        Ok(Some(StoreLock {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        trace!("StoreLock: unlocked {:?}", self.path);
    }
}
