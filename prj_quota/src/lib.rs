//! XFS project quota management.
//!
//! A directory is tied to a numeric project id through its on-disk
//! `fsxattr`, and the kernel enforces block and inode limits per project id.
//! This crate keeps track of which id belongs to which directory (in the
//! conventional `/etc/projects` and `/etc/projid` files), and reads or
//! writes the limits through `quotactl(2)`.
//!
//! ```no_run
//! use prj_quota::{DiskQuota, ProjectQuota, ProjectStore};
//!
//! let store = ProjectStore::open("/etc/projects", "/etc/projid")?;
//! let mut pq = ProjectQuota::new(store);
//! pq.set_quota("/data/tenant-a", &DiskQuota::limits(10 << 30, 100_000))?;
//! println!("{:?}", pq.get_quota("/data/tenant-a")?);
//! # Ok::<(), prj_quota::PqError>(())
//! ```
#[macro_use]
extern crate log;
extern crate libc;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

mod lock;
mod mtab;
mod project;
mod store;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(not(target_os = "linux"))]
mod generic_os;

#[cfg(target_os = "linux")]
use crate::linux as sys;
#[cfg(not(target_os = "linux"))]
use crate::generic_os as sys;

pub use crate::lock::StoreLock;
pub use crate::mtab::{read_mtab, Mount, Mtab};
pub use crate::project::{BackingDev, ProjectQuota};
pub use crate::store::{PendingWrite, ProjectStore, FIRST_PROJECT_ID, MAX_SEARCH};

/// Size of the blocks the kernel counts quota in.
pub const BLOCK_SIZE: u64 = 512;

/// Project id as stored in the fsxattr of a file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProjectId(pub u32);

/// Id 0 means "no project".
pub const NO_PROJECT_ID: ProjectId = ProjectId(0);

impl ProjectId {
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Limits and usage of one project.
///
/// The limits are hard limits; 0 means "no limit". The `*_used` fields
/// are filled in by the kernel and ignored when setting a quota.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskQuota {
    pub bytes_limit: u64,
    pub files_limit: u64,
    pub bytes_used:  u64,
    pub files_used:  u64,
}

impl DiskQuota {
    /// Just limits, no usage.
    pub fn limits(bytes_limit: u64, files_limit: u64) -> DiskQuota {
        DiskQuota {
            bytes_limit,
            files_limit,
            ..DiskQuota::default()
        }
    }
}

#[derive(Debug)]
pub enum PqError {
    /// filesystem does not do project quota.
    Unsupported,
    /// no project id bound to the path.
    NotFound,
    /// no free project id left.
    Exhausted,
    /// path or name cannot be recorded.
    Invalid(String),
    /// ioctl or quotactl failed.
    Syscall(io::Error),
    /// updating /etc/projects or /etc/projid failed.
    Persistence(io::Error),
    IoError(io::Error),
}

impl fmt::Display for PqError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PqError::Unsupported => f.write_str("project quota not supported"),
            PqError::NotFound => f.write_str("project id not found"),
            PqError::Exhausted => f.write_str("no free project id"),
            PqError::Invalid(msg) => f.write_str(msg),
            PqError::Syscall(e) => write!(f, "quota syscall: {}", e),
            PqError::Persistence(e) => write!(f, "project files: {}", e),
            PqError::IoError(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for PqError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PqError::Syscall(e) | PqError::Persistence(e) | PqError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PqError {
    fn from(e: io::Error) -> Self {
        PqError::IoError(e)
    }
}

impl From<std::ffi::NulError> for PqError {
    fn from(e: std::ffi::NulError) -> Self {
        PqError::IoError(e.into())
    }
}

fn to_num(e: &PqError) -> u32 {
    match e {
        &PqError::Unsupported => 1,
        &PqError::NotFound => 2,
        &PqError::Exhausted => 3,
        &PqError::Invalid(_) => 4,
        &PqError::Syscall(_) => 5,
        &PqError::Persistence(_) => 6,
        &PqError::IoError(_) => 7,
    }
}

// errors compare by kind; wrapped io errors by their ErrorKind.
impl PartialEq for PqError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (&PqError::Syscall(ref e), &PqError::Syscall(ref o)) |
            (&PqError::Persistence(ref e), &PqError::Persistence(ref o)) |
            (&PqError::IoError(ref e), &PqError::IoError(ref o)) => e.kind() == o.kind(),
            (&PqError::Invalid(ref e), &PqError::Invalid(ref o)) => e == o,
            (e, o) => to_num(e) == to_num(o),
        }
    }
}

/// The kernel side of project quota.
pub trait QuotaSys {
    /// Read the project id from the fsxattr of `path`.
    fn get_project_id(&self, path: &Path) -> Result<ProjectId, PqError>;
    /// Write the project id into the fsxattr of `path`, keeping the other flags.
    /// A directory also gets the project-inherit flag, so new files join the project.
    fn set_project_id(&self, path: &Path, id: ProjectId) -> Result<(), PqError>;
    /// Limits and usage of project `id` on block device `device`.
    fn get_quota(&self, device: &str, id: ProjectId) -> Result<DiskQuota, PqError>;
    /// Set the hard limits of project `id` on block device `device`.
    fn set_quota(&self, device: &str, id: ProjectId, quota: &DiskQuota) -> Result<(), PqError>;
}

/// Finds the mount a path lives on.
pub trait MountResolver {
    /// Returns the canonical path and the mount covering it.
    fn resolve(&self, path: &Path) -> Result<(PathBuf, Mount), PqError>;
}

/// `QuotaSys` implemented with the real system calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysQuota;

impl QuotaSys for SysQuota {
    fn get_project_id(&self, path: &Path) -> Result<ProjectId, PqError> {
        sys::get_project_id(path)
    }

    fn set_project_id(&self, path: &Path, id: ProjectId) -> Result<(), PqError> {
        sys::set_project_id(path, id)
    }

    fn get_quota(&self, device: &str, id: ProjectId) -> Result<DiskQuota, PqError> {
        sys::get_quota(device, id)
    }

    fn set_quota(&self, device: &str, id: ProjectId, quota: &DiskQuota) -> Result<(), PqError> {
        sys::set_quota(device, id, quota)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds() {
        let e1 = PqError::Syscall(io::Error::from_raw_os_error(libc::EPERM));
        let e2 = PqError::Syscall(io::Error::from_raw_os_error(libc::EPERM));
        assert_eq!(e1, e2);
        assert!(PqError::Unsupported != PqError::NotFound);
        assert!(e1 != PqError::Persistence(io::Error::from_raw_os_error(libc::EPERM)));
        assert_eq!(PqError::Unsupported.to_string(), "project quota not supported");
    }

    #[test]
    fn limits_only() {
        let q = DiskQuota::limits(1024, 10);
        assert_eq!(q.bytes_limit, 1024);
        assert_eq!(q.files_limit, 10);
        assert_eq!(q.bytes_used, 0);
        assert_eq!(q.files_used, 0);
        assert!(NO_PROJECT_ID.is_none());
        assert_eq!(ProjectId(1048577).to_string(), "1048577");
    }
}
