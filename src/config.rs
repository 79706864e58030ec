use std::path::{Path, PathBuf};
use std::process::exit;
use std::{fs, io};

use serde::Deserialize;
use toml;

use prj_quota::{FIRST_PROJECT_ID, MAX_SEARCH};

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub store:     Store,
    #[serde(default)]
    pub allocator: Allocator,
    #[serde(default)]
    pub mount:     Mount,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Store {
    #[serde(default = "default_projects")]
    pub projects:  PathBuf,
    #[serde(default = "default_projid")]
    pub projid:    PathBuf,
    #[serde(rename = "lock-file", default)]
    pub lock_file: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Allocator {
    #[serde(rename = "first-id", default = "default_first_id")]
    pub first_id:   u32,
    #[serde(rename = "max-search", default = "default_max_search")]
    pub max_search: u32,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Mount {
    #[serde(default = "default_mtab")]
    pub mtab: PathBuf,
}

fn default_projects() -> PathBuf {
    PathBuf::from("/etc/projects")
}

fn default_projid() -> PathBuf {
    PathBuf::from("/etc/projid")
}

fn default_first_id() -> u32 {
    FIRST_PROJECT_ID
}

fn default_max_search() -> u32 {
    MAX_SEARCH
}

fn default_mtab() -> PathBuf {
    PathBuf::from("/proc/self/mounts")
}

impl Default for Store {
    fn default() -> Store {
        Store {
            projects:  default_projects(),
            projid:    default_projid(),
            lock_file: None,
        }
    }
}

impl Default for Allocator {
    fn default() -> Allocator {
        Allocator {
            first_id:   default_first_id(),
            max_search: default_max_search(),
        }
    }
}

impl Default for Mount {
    fn default() -> Mount {
        Mount { mtab: default_mtab() }
    }
}

// Parse a TOML config into a config::Config struct.
pub fn parse(buffer: &str) -> io::Result<Config> {
    match toml::from_str(buffer) {
        Ok(v) => Ok(v),
        Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
    }
}

// Read the TOML config into a config::Config struct.
pub fn read(toml_file: impl AsRef<Path>) -> io::Result<Config> {
    let buffer = fs::read_to_string(&toml_file)?;
    parse(&buffer)
}

pub fn check(cfg: &str, config: &Config) {
    if config.allocator.first_id == 0 {
        eprintln!("{}: [allocator]: first-id: project id 0 is reserved", cfg);
        exit(1);
    }
    if config.allocator.first_id.checked_add(config.allocator.max_search).is_none() {
        eprintln!("{}: [allocator]: first-id + max-search out of range", cfg);
        exit(1);
    }
    if config.store.projects == config.store.projid {
        eprintln!("{}: [store]: projects and projid must be different files", cfg);
        exit(1);
    }
}
