//
// Linux specific systemcalls for project quota.
//
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::raw::{c_char, c_int};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::{DiskQuota, PqError, ProjectId, BLOCK_SIZE};

// struct fsxattr from <linux/fs.h>.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub(crate) struct FsXAttr {
    pub fsx_xflags:     u32,
    pub fsx_extsize:    u32,
    pub fsx_nextents:   u32,
    pub fsx_projid:     u32,
    pub fsx_cowextsize: u32,
    pub fsx_pad:        [u8; 8],
}

// struct fs_disk_quota from <linux/dqblk_xfs.h>.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub(crate) struct FsDiskQuota {
    pub d_version:       i8,
    pub d_flags:         i8,
    pub d_fieldmask:     u16,
    pub d_id:            u32,
    pub d_blk_hardlimit: u64,
    pub d_blk_softlimit: u64,
    pub d_ino_hardlimit: u64,
    pub d_ino_softlimit: u64,
    pub d_bcount:        u64,
    pub d_icount:        u64,
    pub d_itimer:        i32,
    pub d_btimer:        i32,
    pub d_iwarns:        u16,
    pub d_bwarns:        u16,
    pub d_itimer_hi:     i8,
    pub d_btimer_hi:     i8,
    pub d_rtbtimer_hi:   i8,
    pub d_padding2:      i8,
    pub d_rtb_hardlimit: u64,
    pub d_rtb_softlimit: u64,
    pub d_rtbcount:      u64,
    pub d_rtbtimer:      i32,
    pub d_rtbwarns:      u16,
    pub d_padding3:      i16,
    pub d_padding4:      [c_char; 8],
}

const FS_XFLAG_PROJINHERIT: u32 = 0x0000_0200;

// _IOC encoding. powerpc, mips and sparc use 3 direction bits.
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64", target_arch = "mips",
          target_arch = "mips64", target_arch = "sparc", target_arch = "sparc64"))]
mod iocdir {
    pub const READ: u32 = 2;
    pub const WRITE: u32 = 4;
    pub const SIZEBITS: u32 = 13;
}
#[cfg(not(any(target_arch = "powerpc", target_arch = "powerpc64", target_arch = "mips",
              target_arch = "mips64", target_arch = "sparc", target_arch = "sparc64")))]
mod iocdir {
    pub const READ: u32 = 2;
    pub const WRITE: u32 = 1;
    pub const SIZEBITS: u32 = 14;
}

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << (16 + iocdir::SIZEBITS)) | ((size as u32) << 16) | ((ty as u32) << 8) | (nr as u32)
}

pub(crate) const FS_IOC_FSGETXATTR: u32 = ioc(iocdir::READ, b'X', 31, std::mem::size_of::<FsXAttr>());
pub(crate) const FS_IOC_FSSETXATTR: u32 = ioc(iocdir::WRITE, b'X', 32, std::mem::size_of::<FsXAttr>());

// quotactl commands for the XFS interface.
const PRJQUOTA: u32 = 2;
const fn xqm_cmd(x: u32) -> u32 {
    ((b'X' as u32) << 8) + x
}
const fn qcmd(cmd: u32, qtype: u32) -> c_int {
    ((cmd << 8) | (qtype & 0x00ff)) as c_int
}
pub(crate) const Q_XGETPQUOTA: c_int = qcmd(xqm_cmd(3), PRJQUOTA);
pub(crate) const Q_XSETPQLIM: c_int = qcmd(xqm_cmd(4), PRJQUOTA);

const FS_DQUOT_VERSION: i8 = 1;
const FS_PROJ_QUOTA: i8 = 2;
const FS_DQ_IHARD: u16 = 1 << 1;
const FS_DQ_BHARD: u16 = 1 << 3;

// helper
fn u32_to_c_int(u: u32) -> c_int {
    let mut tmp: i64 = u as i64;
    if tmp >= 0x80000000 {
        tmp -= 0x100000000;
    }
    tmp as c_int
}

fn last_error() -> PqError {
    PqError::Syscall(io::Error::last_os_error())
}

fn get_fsxattr(file: &File) -> Result<FsXAttr, PqError> {
    let mut fsx = FsXAttr::default();
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_FSGETXATTR as _, &mut fsx as *mut FsXAttr) };
    if rc != 0 {
        return Err(last_error());
    }
    Ok(fsx)
}

pub(crate) fn get_project_id(path: &Path) -> Result<ProjectId, PqError> {
    let file = File::open(path)?;
    let fsx = get_fsxattr(&file)?;
    Ok(ProjectId(fsx.fsx_projid))
}

/// Set the project id. Directories also get `FS_XFLAG_PROJINHERIT`, other flags are kept.
pub(crate) fn set_project_id(path: &Path, id: ProjectId) -> Result<(), PqError> {
    let file = File::open(path)?;
    let mut fsx = get_fsxattr(&file)?;
    fsx.fsx_projid = id.0;
    // new files and subdirectories inherit the project of their directory.
    if file.metadata()?.is_dir() {
        fsx.fsx_xflags |= FS_XFLAG_PROJINHERIT;
    }
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_FSSETXATTR as _, &fsx as *const FsXAttr) };
    if rc != 0 {
        return Err(last_error());
    }
    trace!("set_project_id: {:?} -> {}", path, id);
    Ok(())
}

pub(crate) fn get_quota(device: &str, id: ProjectId) -> Result<DiskQuota, PqError> {
    let dev = CString::new(device.as_bytes())?;
    let mut dq = FsDiskQuota::default();
    let rc = unsafe {
        libc::quotactl(
            Q_XGETPQUOTA,
            dev.as_ptr(),
            u32_to_c_int(id.0),
            &mut dq as *mut FsDiskQuota as *mut c_char,
        )
    };
    if rc != 0 {
        return Err(last_error());
    }
    Ok(from_disk_quota(&dq))
}

pub(crate) fn set_quota(device: &str, id: ProjectId, quota: &DiskQuota) -> Result<(), PqError> {
    let dev = CString::new(device.as_bytes())?;
    let mut dq = to_disk_quota(id, quota);
    let rc = unsafe {
        libc::quotactl(
            Q_XSETPQLIM,
            dev.as_ptr(),
            u32_to_c_int(id.0),
            &mut dq as *mut FsDiskQuota as *mut c_char,
        )
    };
    if rc != 0 {
        return Err(last_error());
    }
    debug!(
        "set_quota: {} project {}: {} blocks, {} inodes",
        device, id, dq.d_blk_hardlimit, dq.d_ino_hardlimit
    );
    Ok(())
}

fn from_disk_quota(dq: &FsDiskQuota) -> DiskQuota {
    DiskQuota {
        bytes_limit: dq.d_blk_hardlimit.saturating_mul(BLOCK_SIZE),
        files_limit: dq.d_ino_hardlimit,
        bytes_used:  dq.d_bcount.saturating_mul(BLOCK_SIZE),
        files_used:  dq.d_icount,
    }
}

// only the hard limits are set, the fieldmask tells the kernel so.
fn to_disk_quota(id: ProjectId, quota: &DiskQuota) -> FsDiskQuota {
    FsDiskQuota {
        d_version: FS_DQUOT_VERSION,
        d_flags: FS_PROJ_QUOTA,
        d_fieldmask: FS_DQ_BHARD | FS_DQ_IHARD,
        d_id: id.0,
        d_blk_hardlimit: quota.bytes_limit / BLOCK_SIZE,
        d_ino_hardlimit: quota.files_limit,
        ..FsDiskQuota::default()
    }
}
