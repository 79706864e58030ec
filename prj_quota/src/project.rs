//
// Project quota on a path: find the device, find or hand out a
// project id, tie it to the directory, and talk to the kernel.
//
use std::path::{Path, PathBuf};

use crate::mtab::Mtab;
use crate::store::ProjectStore;
use crate::{DiskQuota, MountResolver, PqError, ProjectId, QuotaSys, SysQuota};

/// The block device a path lives on.
#[derive(Debug, Clone, PartialEq)]
pub struct BackingDev {
    pub device:    String,
    pub supported: bool,
}

/// Project quota manager.
#[derive(Debug)]
pub struct ProjectQuota<S = SysQuota, M = Mtab> {
    store:  ProjectStore,
    sys:    S,
    mounts: M,
}

impl ProjectQuota<SysQuota, Mtab> {
    /// Use the real system calls and /proc/self/mounts.
    pub fn new(store: ProjectStore) -> Self {
        ProjectQuota::with(store, SysQuota, Mtab::new())
    }
}

impl<S: QuotaSys, M: MountResolver> ProjectQuota<S, M> {
    pub fn with(store: ProjectStore, sys: S, mounts: M) -> Self {
        ProjectQuota { store, sys, mounts }
    }

    pub fn store(&self) -> &ProjectStore {
        &self.store
    }

    /// Limits and usage of the project bound to `path`.
    ///
    /// The project id is read from the directory itself, not from
    /// /etc/projects. A directory without a project reports project 0.
    pub fn get_quota(&self, path: impl AsRef<Path>) -> Result<DiskQuota, PqError> {
        let (target, dev) = self.find_backing_dev(path.as_ref())?;
        let id = self.sys.get_project_id(&target)?;
        self.check_stale(&target, id);
        let quota = self.sys.get_quota(&dev.device, id)?;
        debug!("get_quota: {:?} project {}: {:?}", target, id, quota);
        Ok(quota)
    }

    /// Set the hard limits on `path`, giving it its own project id if
    /// it does not have one yet.
    pub fn set_quota(&mut self, path: impl AsRef<Path>, quota: &DiskQuota) -> Result<(), PqError> {
        let (target, dev) = self.find_backing_dev(path.as_ref())?;
        let key = path_key(&target)?;

        let _lock = self.store.lock()?;
        self.store.reload()?;
        let (id, is_new) = self.store.find_or_create_project_id(&key)?;
        if is_new {
            self.store.persist_paths()?;
            info!("set_quota: {} gets new project id {}", key, id);
        }
        self.bind_project_id(&target, id)?;
        self.sys.set_quota(&dev.device, id, quota)
    }

    /// Put `path` in the shared project `name` and set the limits of
    /// that project. All paths in one project share the limits.
    pub fn set_shared_quota(
        &mut self,
        path: impl AsRef<Path>,
        name: &str,
        quota: &DiskQuota,
    ) -> Result<(), PqError>
    {
        let (target, dev) = self.find_backing_dev(path.as_ref())?;
        let key = path_key(&target)?;

        let _lock = self.store.lock()?;
        self.store.reload()?;
        let (id, new_name) = self.store.find_or_create_named_id(name)?;
        let new_path = match self.store.add_path(id, &key) {
            Ok(new_path) => new_path,
            Err(e) => {
                // drop the unpersisted name again.
                if new_name {
                    self.store.reload()?;
                }
                return Err(e);
            },
        };
        if new_path {
            self.store.persist_paths()?;
        }
        if new_name {
            self.store.persist_names()?;
            info!("set_shared_quota: project {} gets new project id {}", name, id);
        }
        self.bind_project_id(&target, id)?;
        self.sys.set_quota(&dev.device, id, quota)
    }

    /// Remove the limits of the project bound to `path`.
    ///
    /// The project id stays bound to the directory and recorded in
    /// /etc/projects; only the kernel limits are zeroed.
    pub fn clear_quota(&self, path: impl AsRef<Path>) -> Result<(), PqError> {
        let (target, dev) = self.find_backing_dev(path.as_ref())?;
        let id = self.sys.get_project_id(&target)?;
        if id.is_none() {
            debug!("clear_quota: {:?} has no project id", target);
            return Err(PqError::NotFound);
        }
        self.check_stale(&target, id);
        self.sys.set_quota(&dev.device, id, &DiskQuota::default())
    }

    /// Tie project `id` to `path`.
    ///
    /// Returns `false` if it already was, in which case nothing is written.
    pub fn bind_project_id(&self, path: &Path, id: ProjectId) -> Result<bool, PqError> {
        if id.is_none() {
            return Err(PqError::Invalid(format!("cannot bind {:?} to project id 0", path)));
        }
        let existing = self.sys.get_project_id(path)?;
        if existing == id {
            return Ok(false);
        }
        self.sys.set_project_id(path, id)?;
        debug!("bind_project_id: {:?}: project {} -> {}", path, existing, id);
        Ok(true)
    }

    /// Known projects: id, paths and name.
    pub fn projects(&self) -> Vec<(ProjectId, &[String], Option<&str>)> {
        self.store.projects()
    }

    // find the device, and fail if it does not do project quota.
    fn find_backing_dev(&self, path: &Path) -> Result<(PathBuf, BackingDev), PqError> {
        let (target, mount) = self.mounts.resolve(path)?;
        let dev = BackingDev {
            supported: mount.fstype == "xfs",
            device:    mount.device,
        };
        if !dev.supported {
            debug!("{:?}: {} on {} does not do project quota", target, mount.fstype, dev.device);
            return Err(PqError::Unsupported);
        }
        Ok((target, dev))
    }

    // the directory is authoritative, the files are just a record.
    fn check_stale(&self, target: &Path, id: ProjectId) {
        let key = match target.to_str() {
            Some(k) => k,
            None => return,
        };
        if let Some(recorded) = self.store.project_id(key) {
            if recorded != id {
                warn!(
                    "{}: project id is {}, but {} says {}",
                    key,
                    id,
                    self.store.projects_file().display(),
                    recorded
                );
            }
        }
    }
}

// paths are recorded as utf-8 text.
fn path_key(path: &Path) -> Result<String, PqError> {
    match path.to_str() {
        Some(s) => Ok(s.to_string()),
        None => Err(PqError::Invalid(format!("{:?}: path is not valid utf-8", path))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mount;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::rc::Rc;

    // in-memory kernel.
    #[derive(Default)]
    struct FakeSys {
        xattrs:      RefCell<HashMap<PathBuf, ProjectId>>,
        quotas:      RefCell<HashMap<(String, ProjectId), DiskQuota>>,
        xattr_reads: Cell<u32>,
        xattr_sets:  Cell<u32>,
        quota_calls: Cell<u32>,
    }

    impl FakeSys {
        fn syscalls(&self) -> u32 {
            self.xattr_reads.get() + self.xattr_sets.get() + self.quota_calls.get()
        }

        fn use_blocks(&self, device: &str, id: ProjectId, bytes: u64, files: u64) {
            let mut quotas = self.quotas.borrow_mut();
            let q = quotas.entry((device.to_string(), id)).or_insert_with(DiskQuota::default);
            q.bytes_used = bytes;
            q.files_used = files;
        }
    }

    impl QuotaSys for Rc<FakeSys> {
        fn get_project_id(&self, path: &Path) -> Result<ProjectId, PqError> {
            self.xattr_reads.set(self.xattr_reads.get() + 1);
            Ok(self.xattrs.borrow().get(path).cloned().unwrap_or_default())
        }

        fn set_project_id(&self, path: &Path, id: ProjectId) -> Result<(), PqError> {
            self.xattr_sets.set(self.xattr_sets.get() + 1);
            self.xattrs.borrow_mut().insert(path.to_path_buf(), id);
            Ok(())
        }

        fn get_quota(&self, device: &str, id: ProjectId) -> Result<DiskQuota, PqError> {
            self.quota_calls.set(self.quota_calls.get() + 1);
            let quotas = self.quotas.borrow();
            Ok(quotas.get(&(device.to_string(), id)).cloned().unwrap_or_default())
        }

        fn set_quota(&self, device: &str, id: ProjectId, quota: &DiskQuota) -> Result<(), PqError> {
            self.quota_calls.set(self.quota_calls.get() + 1);
            let mut quotas = self.quotas.borrow_mut();
            let q = quotas.entry((device.to_string(), id)).or_insert_with(DiskQuota::default);
            // the kernel keeps its 512-byte granularity.
            q.bytes_limit = quota.bytes_limit / 512 * 512;
            q.files_limit = quota.files_limit;
            Ok(())
        }
    }

    // everything under /data is xfs on /dev/vdb, the rest ext4 on /dev/vda.
    struct FakeMounts;

    impl MountResolver for FakeMounts {
        fn resolve(&self, path: &Path) -> Result<(PathBuf, Mount), PqError> {
            let (device, directory, fstype) = if path.starts_with("/data") {
                ("/dev/vdb", "/data", "xfs")
            } else {
                ("/dev/vda", "/", "ext4")
            };
            let mount = Mount {
                device:    device.to_string(),
                directory: PathBuf::from(directory),
                fstype:    fstype.to_string(),
                options:   vec!["rw".to_string(), "prjquota".to_string()],
            };
            Ok((path.to_path_buf(), mount))
        }
    }

    fn setup(dir: &Path) -> (ProjectQuota<Rc<FakeSys>, FakeMounts>, Rc<FakeSys>) {
        let store = ProjectStore::open(dir.join("projects"), dir.join("projid")).unwrap();
        let sys = Rc::new(FakeSys::default());
        (ProjectQuota::with(store, sys.clone(), FakeMounts), sys)
    }

    #[test]
    fn set_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pq, sys) = setup(dir.path());

        let limits = DiskQuota::limits(10 * 1024 * 1024 * 1024, 100000);
        pq.set_quota("/data/tenant-a", &limits).unwrap();

        let id = pq.store().project_id("/data/tenant-a").unwrap();
        assert_eq!(id.0, crate::FIRST_PROJECT_ID);
        assert_eq!(sys.xattrs.borrow().get(Path::new("/data/tenant-a")), Some(&id));

        let q = pq.get_quota("/data/tenant-a").unwrap();
        assert_eq!(
            q,
            DiskQuota {
                bytes_limit: 10737418240,
                files_limit: 100000,
                bytes_used:  0,
                files_used:  0,
            }
        );

        // recorded on disk too.
        let content = std::fs::read_to_string(dir.path().join("projects")).unwrap();
        assert_eq!(content, "1048577:/data/tenant-a\n");
    }

    #[test]
    fn usage_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pq, sys) = setup(dir.path());
        pq.set_quota("/data/a", &DiskQuota::limits(1 << 20, 10)).unwrap();
        let id = pq.store().project_id("/data/a").unwrap();
        sys.use_blocks("/dev/vdb", id, 4096, 2);
        let q = pq.get_quota("/data/a").unwrap();
        assert_eq!(q.bytes_used, 4096);
        assert_eq!(q.files_used, 2);
        assert_eq!(q.bytes_limit, 1 << 20);
    }

    #[test]
    fn unsupported_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pq, sys) = setup(dir.path());

        assert_eq!(pq.get_quota("/home/user").unwrap_err(), PqError::Unsupported);
        assert_eq!(
            pq.set_quota("/home/user", &DiskQuota::limits(1024, 1)).unwrap_err(),
            PqError::Unsupported
        );
        assert_eq!(pq.clear_quota("/home/user").unwrap_err(), PqError::Unsupported);
        assert_eq!(
            pq.set_shared_quota("/home/user", "web", &DiskQuota::limits(1024, 1)).unwrap_err(),
            PqError::Unsupported
        );
        assert_eq!(sys.syscalls(), 0);
        assert!(pq.projects().is_empty());
    }

    #[test]
    fn binding_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (pq, sys) = setup(dir.path());
        let path = Path::new("/data/a");

        assert_eq!(pq.bind_project_id(path, ProjectId(1048577)).unwrap(), true);
        assert_eq!(pq.bind_project_id(path, ProjectId(1048577)).unwrap(), false);
        assert_eq!(sys.xattr_sets.get(), 1);

        assert!(pq.bind_project_id(path, ProjectId(0)).is_err());
        assert_eq!(sys.xattr_sets.get(), 1);
    }

    #[test]
    fn set_twice_keeps_id() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pq, sys) = setup(dir.path());
        pq.set_quota("/data/a", &DiskQuota::limits(1024, 1)).unwrap();
        pq.set_quota("/data/a", &DiskQuota::limits(2048, 2)).unwrap();
        assert_eq!(sys.xattr_sets.get(), 1);
        assert_eq!(pq.projects().len(), 1);
        assert_eq!(pq.get_quota("/data/a").unwrap().bytes_limit, 2048);

        pq.set_quota("/data/b", &DiskQuota::limits(1024, 1)).unwrap();
        assert_eq!(pq.store().project_id("/data/b"), Some(ProjectId(1048578)));
    }

    #[test]
    fn clear_keeps_binding() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pq, sys) = setup(dir.path());
        pq.set_quota("/data/a", &DiskQuota::limits(1 << 30, 1000)).unwrap();
        let id = pq.store().project_id("/data/a").unwrap();
        let before = std::fs::read_to_string(dir.path().join("projects")).unwrap();

        pq.clear_quota("/data/a").unwrap();

        let q = pq.get_quota("/data/a").unwrap();
        assert_eq!(q.bytes_limit, 0);
        assert_eq!(q.files_limit, 0);
        assert_eq!(sys.xattrs.borrow().get(Path::new("/data/a")), Some(&id));
        assert_eq!(sys.xattr_sets.get(), 1);
        let after = std::fs::read_to_string(dir.path().join("projects")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn unbound_path() {
        let dir = tempfile::tempdir().unwrap();
        let (pq, sys) = setup(dir.path());

        // project 0 is passed through to the kernel.
        assert_eq!(pq.get_quota("/data/new").unwrap(), DiskQuota::default());
        assert_eq!(pq.clear_quota("/data/new").unwrap_err(), PqError::NotFound);
        assert_eq!(sys.xattr_sets.get(), 0);
        assert!(pq.projects().is_empty());
    }

    #[test]
    fn directory_beats_stale_record() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("projects"), "1048600:/data/a\n").unwrap();
        let (pq, sys) = setup(dir.path());
        sys.xattrs.borrow_mut().insert(PathBuf::from("/data/a"), ProjectId(1048577));
        sys.quotas
            .borrow_mut()
            .insert(("/dev/vdb".to_string(), ProjectId(1048577)), DiskQuota::limits(512, 5));

        assert_eq!(pq.get_quota("/data/a").unwrap().files_limit, 5);
        pq.clear_quota("/data/a").unwrap();
        let quotas = sys.quotas.borrow();
        assert_eq!(quotas[&("/dev/vdb".to_string(), ProjectId(1048577))].files_limit, 0);
        assert!(!quotas.contains_key(&("/dev/vdb".to_string(), ProjectId(1048600))));
    }

    #[test]
    fn shared_project() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pq, sys) = setup(dir.path());
        let limits = DiskQuota::limits(1 << 30, 0);
        pq.set_shared_quota("/data/www1", "web", &limits).unwrap();
        pq.set_shared_quota("/data/www2", "web", &limits).unwrap();

        let id = pq.store().name_id("web").unwrap();
        assert_eq!(pq.store().paths(id).len(), 2);
        assert_eq!(sys.xattrs.borrow().get(Path::new("/data/www2")), Some(&id));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("projid")).unwrap(),
            format!("web:{}\n", id)
        );

        // a path with its own project cannot join another one.
        pq.set_quota("/data/solo", &limits).unwrap();
        match pq.set_shared_quota("/data/solo", "web", &limits) {
            Err(PqError::Invalid(_)) => {},
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn failed_share_leaves_no_name() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pq, sys) = setup(dir.path());
        let limits = DiskQuota::limits(1 << 30, 0);
        pq.set_quota("/data/solo", &limits).unwrap();

        match pq.set_shared_quota("/data/solo", "web", &limits) {
            Err(PqError::Invalid(_)) => {},
            other => panic!("expected Invalid, got {:?}", other),
        }
        assert_eq!(pq.store().name_id("web"), None);
        assert_eq!(pq.projects().len(), 1);
        assert_eq!(std::fs::read_to_string(dir.path().join("projid")).unwrap(), "");
        assert_eq!(sys.xattr_sets.get(), 1);

        // the name is still free for a path that can take it.
        pq.set_shared_quota("/data/www1", "web", &limits).unwrap();
        assert_eq!(pq.store().name_id("web"), Some(ProjectId(1048578)));
    }

    #[test]
    fn other_process_allocations_are_seen() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pq1, _) = setup(dir.path());
        let (mut pq2, _) = setup(dir.path());

        pq1.set_quota("/data/a", &DiskQuota::limits(1024, 1)).unwrap();
        pq2.set_quota("/data/b", &DiskQuota::limits(1024, 1)).unwrap();

        assert_eq!(pq2.store().project_id("/data/a"), Some(ProjectId(1048577)));
        assert_eq!(pq2.store().project_id("/data/b"), Some(ProjectId(1048578)));
    }
}
