//
// No-op implementations.
//
use std::path::Path;

use crate::{DiskQuota, PqError, ProjectId};

pub(crate) fn get_project_id(_path: &Path) -> Result<ProjectId, PqError> {
    Err(PqError::Unsupported)
}

pub(crate) fn set_project_id(_path: &Path, _id: ProjectId) -> Result<(), PqError> {
    Err(PqError::Unsupported)
}

pub(crate) fn get_quota(_device: &str, _id: ProjectId) -> Result<DiskQuota, PqError> {
    Err(PqError::Unsupported)
}

pub(crate) fn set_quota(_device: &str, _id: ProjectId, _quota: &DiskQuota) -> Result<(), PqError> {
    Err(PqError::Unsupported)
}
