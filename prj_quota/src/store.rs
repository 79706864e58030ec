//
// The project files.
//
// /etc/projects maps project ids to directories, one "id:path" per line.
// /etc/projid maps names to project ids, one "name:id" per line.
// Both are the files xfs_quota(8) reads, so the format is fixed.
//
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::prelude::*;
use std::io::BufReader;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::lock::StoreLock;
use crate::{PqError, ProjectId};

/// First project id handed out.
pub const FIRST_PROJECT_ID: u32 = 1048577;
/// How many ids to try before giving up.
pub const MAX_SEARCH: u32 = 256;

/// In-memory copy of /etc/projects and /etc/projid.
#[derive(Debug)]
pub struct ProjectStore {
    projects_file: PathBuf,
    projid_file:   PathBuf,
    lock_file:     PathBuf,
    first_id:      u32,
    max_search:    u32,
    id_paths:      BTreeMap<ProjectId, Vec<String>>,
    path_ids:      HashMap<String, ProjectId>,
    id_names:      BTreeMap<ProjectId, String>,
    name_ids:      HashMap<String, ProjectId>,
}

/// A new version of a file, written to a temporary file next to it.
///
/// Nothing is visible until `commit()` renames it over the target;
/// dropping it without committing removes the temporary file.
#[derive(Debug)]
pub struct PendingWrite {
    tmp:    tempfile::NamedTempFile,
    target: PathBuf,
}

impl PendingWrite {
    /// Write `data` to a temporary file in the directory of `target`.
    pub fn begin(target: impl AsRef<Path>, data: &[u8]) -> Result<PendingWrite, PqError> {
        let target = target.as_ref();
        let dir = parent_dir(target);
        let prefix = match target.file_name() {
            Some(name) => format!(".{}", name.to_string_lossy()),
            None => ".tmp".to_string(),
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(&prefix)
            .tempfile_in(dir)
            .map_err(PqError::Persistence)?;
        tmp.write_all(data).map_err(PqError::Persistence)?;
        tmp.as_file().sync_all().map_err(PqError::Persistence)?;
        fs::set_permissions(tmp.path(), Permissions::from_mode(0o644)).map_err(PqError::Persistence)?;
        Ok(PendingWrite {
            tmp,
            target: target.to_path_buf(),
        })
    }

    /// Atomically replace the target.
    pub fn commit(self) -> Result<(), PqError> {
        let target = self.target;
        self.tmp.persist(&target).map_err(|e| PqError::Persistence(e.error))?;
        // make the rename itself durable.
        if let Err(e) = File::open(parent_dir(&target)).and_then(|d| d.sync_all()) {
            debug!("PendingWrite::commit: fsync dir of {:?}: {}", target, e);
        }
        Ok(())
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if p.as_os_str().len() > 0 => p,
        _ => Path::new("."),
    }
}

// create an empty file, and its directory, if it does not exist yet.
fn ensure_file(path: &Path) -> Result<(), PqError> {
    if path.exists() {
        return Ok(());
    }
    fs::create_dir_all(parent_dir(path)).map_err(PqError::Persistence)?;
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(PqError::Persistence)?;
    info!("created empty {:?}", path);
    Ok(())
}

// read "a:b" records, skipping comments and malformed lines.
fn read_records<F>(path: &Path, mut handle: F) -> Result<(), PqError>
where F: FnMut(&str, &str, usize) {
    let f = File::open(path).map_err(PqError::Persistence)?;
    let reader = BufReader::new(f);
    for (idx, l) in reader.lines().enumerate() {
        let l2 = l.map_err(PqError::Persistence)?;
        let line = l2.trim();
        if line.len() == 0 || line.starts_with("#") {
            continue;
        }
        let fields = line.split(':').collect::<Vec<_>>();
        if fields.len() != 2 {
            error!("{:?} line {}: invalid line: {}", path, idx + 1, line);
            continue;
        }
        handle(fields[0].trim(), fields[1].trim(), idx + 1);
    }
    Ok(())
}

fn parse_id(path: &Path, lineno: usize, s: &str) -> Option<ProjectId> {
    match s.parse::<u32>() {
        Ok(0) => {
            error!("{:?} line {}: project id 0 is reserved", path, lineno);
            None
        },
        Ok(id) => Some(ProjectId(id)),
        Err(e) => {
            error!("{:?} line {}: invalid project id({}): {}", path, lineno, s, e);
            None
        },
    }
}

// check that a path or name can be written as one field of a record.
fn check_field(what: &str, s: &str) -> Result<(), PqError> {
    if s.is_empty() || s.contains(':') || s.contains('\n') || s.contains('\r') {
        return Err(PqError::Invalid(format!("{} {:?} cannot be recorded", what, s)));
    }
    if s.trim() != s {
        return Err(PqError::Invalid(format!("{} {:?} has surrounding whitespace", what, s)));
    }
    // would be read back as a comment.
    if s.starts_with('#') {
        return Err(PqError::Invalid(format!("{} {:?} starts with '#'", what, s)));
    }
    Ok(())
}

impl ProjectStore {
    /// Load the project files, creating them if they do not exist.
    pub fn open(projects: impl AsRef<Path>, projid: impl AsRef<Path>) -> Result<ProjectStore, PqError> {
        let projects = projects.as_ref().to_path_buf();
        let projid = projid.as_ref().to_path_buf();
        ensure_file(&projects)?;
        ensure_file(&projid)?;

        let mut lock_file = projects.clone().into_os_string();
        lock_file.push(".lock");

        let mut store = ProjectStore {
            projects_file: projects,
            projid_file:   projid,
            lock_file:     PathBuf::from(lock_file),
            first_id:      FIRST_PROJECT_ID,
            max_search:    MAX_SEARCH,
            id_paths:      BTreeMap::new(),
            path_ids:      HashMap::new(),
            id_names:      BTreeMap::new(),
            name_ids:      HashMap::new(),
        };
        store.reload()?;
        Ok(store)
    }

    /// Use another lock file than `<projects>.lock`.
    pub fn lock_file(mut self, path: impl AsRef<Path>) -> Self {
        self.lock_file = path.as_ref().to_path_buf();
        self
    }

    /// Hand out ids from `first` on, searching at most `max_search` ids.
    pub fn id_range(mut self, first: u32, max_search: u32) -> Self {
        self.first_id = std::cmp::max(first, 1);
        self.max_search = max_search;
        self
    }

    /// Take the lock that serializes allocations between processes.
    pub fn lock(&self) -> Result<StoreLock, PqError> {
        StoreLock::acquire(&self.lock_file).map_err(PqError::Persistence)
    }

    /// Throw away the in-memory tables and read the files again.
    pub fn reload(&mut self) -> Result<(), PqError> {
        let mut id_paths: BTreeMap<ProjectId, Vec<String>> = BTreeMap::new();
        let mut path_ids = HashMap::new();
        let mut id_names = BTreeMap::new();
        let mut name_ids = HashMap::new();

        // 1048577:/data1/test
        let file = &self.projects_file;
        read_records(file, |id, path, lineno| {
            let id = match parse_id(file, lineno, id) {
                Some(id) => id,
                None => return,
            };
            if path.is_empty() {
                error!("{:?} line {}: empty path", file, lineno);
                return;
            }
            if let Some(other) = path_ids.get(path) {
                warn!("{:?} line {}: {} already has project id {}", file, lineno, path, other);
                return;
            }
            path_ids.insert(path.to_string(), id);
            id_paths.entry(id).or_insert_with(Vec::new).push(path.to_string());
        })?;

        // volume-1048577:1048577
        let file = &self.projid_file;
        read_records(file, |name, id, lineno| {
            let id = match parse_id(file, lineno, id) {
                Some(id) => id,
                None => return,
            };
            if name.is_empty() {
                error!("{:?} line {}: empty project name", file, lineno);
                return;
            }
            name_ids.insert(name.to_string(), id);
            id_names.insert(id, name.to_string());
        })?;

        trace!("reload: project paths: {:?}", id_paths);
        trace!("reload: project names: {:?}", id_names);
        self.id_paths = id_paths;
        self.path_ids = path_ids;
        self.id_names = id_names;
        self.name_ids = name_ids;
        Ok(())
    }

    /// Write /etc/projects.
    pub fn persist_paths(&self) -> Result<(), PqError> {
        PendingWrite::begin(&self.projects_file, self.paths_content().as_bytes())?.commit()
    }

    /// Write /etc/projid.
    pub fn persist_names(&self) -> Result<(), PqError> {
        PendingWrite::begin(&self.projid_file, self.names_content().as_bytes())?.commit()
    }

    fn paths_content(&self) -> String {
        let mut content = String::new();
        for (id, paths) in &self.id_paths {
            for path in paths {
                content.push_str(&format!("{}:{}\n", id, path));
            }
        }
        content
    }

    fn names_content(&self) -> String {
        let mut content = String::new();
        for (id, name) in &self.id_names {
            content.push_str(&format!("{}:{}\n", name, id));
        }
        content
    }

    pub fn projects_file(&self) -> &Path {
        &self.projects_file
    }

    pub fn projid_file(&self) -> &Path {
        &self.projid_file
    }

    /// Project id recorded for `path`.
    pub fn project_id(&self, path: &str) -> Option<ProjectId> {
        self.path_ids.get(path).cloned()
    }

    /// Paths recorded for project `id`.
    pub fn paths(&self, id: ProjectId) -> &[String] {
        match self.id_paths.get(&id) {
            Some(paths) => paths.as_slice(),
            None => &[],
        }
    }

    /// Name recorded for project `id`.
    pub fn name(&self, id: ProjectId) -> Option<&str> {
        self.id_names.get(&id).map(|s| s.as_str())
    }

    /// Project id recorded for `name`.
    pub fn name_id(&self, name: &str) -> Option<ProjectId> {
        self.name_ids.get(name).cloned()
    }

    /// All known projects, ordered by id.
    pub fn projects(&self) -> Vec<(ProjectId, &[String], Option<&str>)> {
        let ids = self
            .id_paths
            .keys()
            .chain(self.id_names.keys())
            .cloned()
            .collect::<BTreeSet<_>>();
        ids.into_iter()
            .map(|id| (id, self.paths(id), self.name(id)))
            .collect()
    }

    /// Is `id` recorded in either file.
    pub fn is_used(&self, id: ProjectId) -> bool {
        self.id_paths.contains_key(&id) || self.id_names.contains_key(&id)
    }

    /// Find an unused project id.
    ///
    /// Tries `max_search` ids from the first id. If all of those are in
    /// use, the id right after the window is returned, if that one is
    /// still free. After that, allocation fails.
    pub fn allocate(&self) -> Result<ProjectId, PqError> {
        let end = self.first_id.saturating_add(self.max_search);
        for i in self.first_id..end {
            if !self.is_used(ProjectId(i)) {
                return Ok(ProjectId(i));
            }
        }
        let fallback = ProjectId(end);
        if self.is_used(fallback) {
            error!("allocate: no free project id in {}..={}", self.first_id, end);
            return Err(PqError::Exhausted);
        }
        warn!("allocate: no free project id in {}..{}, using {}", self.first_id, end, fallback);
        Ok(fallback)
    }

    /// Record `path` under project `id`.
    ///
    /// Returns `false` if it already was. A path can only belong to one project.
    pub fn add_path(&mut self, id: ProjectId, path: &str) -> Result<bool, PqError> {
        check_field("path", path)?;
        if !path.starts_with('/') {
            return Err(PqError::Invalid(format!("path {:?} is not absolute", path)));
        }
        if id.is_none() {
            return Err(PqError::Invalid(format!("cannot bind {} to project id 0", path)));
        }
        match self.path_ids.get(path) {
            Some(&other) if other == id => return Ok(false),
            Some(&other) => {
                let msg = format!("{} already has project id {}", path, other);
                return Err(PqError::Invalid(msg));
            },
            None => {},
        }
        self.path_ids.insert(path.to_string(), id);
        self.id_paths.entry(id).or_insert_with(Vec::new).push(path.to_string());
        Ok(true)
    }

    /// Project id of `path`, allocating a new one if there is none.
    ///
    /// The boolean is `true` if the id is new; the caller must persist it.
    pub fn find_or_create_project_id(&mut self, path: &str) -> Result<(ProjectId, bool), PqError> {
        if let Some(id) = self.project_id(path) {
            return Ok((id, false));
        }
        check_field("path", path)?;
        let id = self.allocate()?;
        self.add_path(id, path)?;
        debug!("find_or_create_project_id: {} -> new id {}", path, id);
        Ok((id, true))
    }

    /// Project id of the shared project `name`, allocating one if there is none.
    pub fn find_or_create_named_id(&mut self, name: &str) -> Result<(ProjectId, bool), PqError> {
        if let Some(id) = self.name_id(name) {
            return Ok((id, false));
        }
        check_field("name", name)?;
        let id = self.allocate()?;
        self.name_ids.insert(name.to_string(), id);
        self.id_names.insert(id, name.to_string());
        debug!("find_or_create_named_id: {} -> new id {}", name, id);
        Ok((id, true))
    }
}
