//
// Find the mount a path lives on.
//
use std::fs::{self, File};
use std::io;
use std::io::prelude::*;
use std::io::BufReader;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::{MountResolver, PqError};

/// One entry of the mount table.
#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    pub device:    String,
    pub directory: PathBuf,
    pub fstype:    String,
    pub options:   Vec<String>,
}

impl Mount {
    /// Is this filesystem mounted with project quota accounting.
    pub fn has_prjquota(&self) -> bool {
        self.options
            .iter()
            .any(|o| o == "prjquota" || o == "pquota" || o == "pqnoenforce")
    }
}

// mount tables escape space, tab, newline and backslash as \ooo.
fn unescape(s: &str) -> String {
    let b = s.as_bytes();
    let mut out = Vec::with_capacity(b.len());
    let mut i = 0;
    while i < b.len() {
        if b[i] == b'\\' && i + 4 <= b.len() && b[i + 1..i + 4].iter().all(|c| (b'0'..=b'7').contains(c)) {
            let v = (b[i + 1] - b'0') as u32 * 64 + (b[i + 2] - b'0') as u32 * 8 + (b[i + 3] - b'0') as u32;
            if v <= 0xff {
                out.push(v as u8);
                i += 4;
                continue;
            }
        }
        out.push(b[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Read a mount table in /proc/mounts format.
pub fn read_mtab(file: impl AsRef<Path>) -> io::Result<Vec<Mount>> {
    let f = File::open(file.as_ref())?;
    let reader = BufReader::new(f);
    let mut result = Vec::new();
    for l in reader.lines() {
        let l2 = l?;
        let line = l2.trim();
        if line.len() == 0 || line.starts_with("#") {
            continue;
        }
        let words = line.split_whitespace().collect::<Vec<_>>();
        if words.len() < 3 {
            continue;
        }
        let options = match words.get(3) {
            Some(o) => o.split(',').map(|s| s.to_string()).collect(),
            None => Vec::new(),
        };
        result.push(Mount {
            device:    unescape(words[0]),
            directory: PathBuf::from(unescape(words[1])),
            fstype:    words[2].to_string(),
            options:   options,
        });
    }
    Ok(result)
}

/// `MountResolver` that reads the kernel mount table.
#[derive(Debug, Clone)]
pub struct Mtab {
    file: PathBuf,
}

impl Mtab {
    pub fn new() -> Mtab {
        Mtab {
            file: PathBuf::from("/proc/self/mounts"),
        }
    }

    /// Use another mount table file.
    pub fn with_file(file: impl AsRef<Path>) -> Mtab {
        Mtab {
            file: file.as_ref().to_path_buf(),
        }
    }
}

impl Default for Mtab {
    fn default() -> Mtab {
        Mtab::new()
    }
}

impl MountResolver for Mtab {
    fn resolve(&self, path: &Path) -> Result<(PathBuf, Mount), PqError> {
        let rp = fs::canonicalize(path)?;
        let meta = fs::metadata(&rp)?;

        // get all entries on the same device.
        let mut ents = read_mtab(&self.file)?
            .into_iter()
            .filter(|e| {
                match fs::metadata(&e.directory) {
                    Ok(ref m) => m.dev() == meta.dev(),
                    Err(_) => false,
                }
            })
            .collect::<Vec<Mount>>();

        // 0 matches, error. 1 match, fine. >1 match, need to look closer.
        let entry = match ents.len() {
            0 => None,
            1 => ents.pop(),
            _ => {
                // bind mounts or overmounts. find longest match.
                ents.sort_by(|a, b| b.directory.cmp(&a.directory));
                ents.into_iter().find(|e| rp.starts_with(&e.directory))
            },
        };
        let entry = match entry {
            Some(e) => e,
            None => {
                let msg = format!("{}: no mount found", rp.display());
                return Err(io::Error::new(io::ErrorKind::NotFound, msg).into());
            },
        };
        debug!(
            "Mtab::resolve: {:?} is on {} ({}) at {:?}",
            rp, entry.device, entry.fstype, entry.directory
        );
        if entry.fstype == "xfs" && !entry.has_prjquota() {
            warn!("{:?}: mounted without prjquota, quota calls will fail", entry.directory);
        }
        Ok((rp, entry))
    }
}
