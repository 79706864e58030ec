//
//  xfsquota: project quota on XFS directories.
//
//  xfsquota get <PATH>
//  xfsquota set <PATH> -s 10G -i 100000 [-n NAME]
//  xfsquota clean <PATH>
//  xfsquota list
//
#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

mod config;
mod units;

use std::error::Error;
use std::path::Path;
use std::process::exit;

use clap::ArgMatches;
use env_logger;

use prj_quota::{DiskQuota, Mtab, ProjectQuota, ProjectStore, SysQuota};

use crate::config::Config;
use crate::units::parse_size;

type BoxedError = Box<dyn Error>;

fn open(config: &Config) -> Result<ProjectQuota, BoxedError> {
    let mut store = ProjectStore::open(&config.store.projects, &config.store.projid)?
        .id_range(config.allocator.first_id, config.allocator.max_search);
    if let Some(ref lock_file) = config.store.lock_file {
        store = store.lock_file(lock_file);
    }
    Ok(ProjectQuota::with(store, SysQuota, Mtab::with_file(&config.mount.mtab)))
}

fn parse_inodes(s: &str) -> Result<u64, BoxedError> {
    s.trim()
        .parse::<u64>()
        .map_err(|_| format!("invalid inode count: {}", s).into())
}

fn run(matches: &ArgMatches, config: &Config) -> Result<(), BoxedError> {
    let mut pq = open(config)?;

    match matches.subcommand() {
        ("get", Some(m)) => {
            let path = m.value_of("PATH").unwrap_or_default();
            let quota = pq.get_quota(path)?;
            println!("quota Size(bytes): {}", quota.bytes_limit);
            println!("quota Inodes: {}", quota.files_limit);
            println!("diskUsage Size(bytes): {}", quota.bytes_used);
            println!("diskUsage Inodes: {}", quota.files_used);
        },
        ("set", Some(m)) => {
            let path = m.value_of("PATH").unwrap_or_default();
            let size = m.value_of("SIZE").unwrap_or("0");
            let inodes = m.value_of("INODES").unwrap_or("0");
            let quota = DiskQuota::limits(parse_size(size)?, parse_inodes(inodes)?);
            match m.value_of("NAME") {
                Some(name) => pq.set_shared_quota(path, name, &quota)?,
                None => pq.set_quota(path, &quota)?,
            }
            println!("set quota success, path: {}, size:{}, inodes:{}", path, size, inodes);
        },
        ("clean", Some(m)) => {
            let path = m.value_of("PATH").unwrap_or_default();
            pq.clear_quota(path)?;
            println!("clean quota success, path: {}", path);
        },
        ("list", Some(_)) => {
            for (id, paths, name) in pq.projects() {
                for path in paths {
                    match name {
                        Some(name) => println!("{}:{}:{}", id, path, name),
                        None => println!("{}:{}", id, path),
                    }
                }
                if paths.is_empty() {
                    if let Some(name) = name {
                        println!("{}::{}", id, name);
                    }
                }
            }
        },
        _ => unreachable!(),
    }
    Ok(())
}

fn main() {
    env_logger::init();

    let matches = clap_app!(xfsquota =>
        (version: "0.1")
        (about: "project quota on XFS directories")
        (@setting SubcommandRequiredElseHelp)
        (@arg CONFIG: -c --config +takes_value "configuration file (/etc/xfsquota.toml)")
        (@subcommand get =>
            (about: "show the quota and usage of a directory")
            (@arg PATH: +required "directory")
        )
        (@subcommand set =>
            (about: "set the quota of a directory")
            (@arg PATH: +required "directory")
            (@arg SIZE: -s --size +takes_value "size limit, like 10G (0 = none)")
            (@arg INODES: -i --inodes +takes_value "inode limit (0 = none)")
            (@arg NAME: -n --name +takes_value "share the quota with other directories under this name")
        )
        (@subcommand clean =>
            (about: "remove the limits of a directory")
            (@arg PATH: +required "directory")
        )
        (@subcommand list =>
            (about: "list known projects")
        )
    )
    .get_matches();

    // an explicit config file must exist, the default one may be missing.
    let cfg = matches.value_of("CONFIG").unwrap_or("/etc/xfsquota.toml");
    let config = if matches.is_present("CONFIG") || Path::new(cfg).exists() {
        match config::read(cfg) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}: {}", cfg, e);
                exit(1);
            },
        }
    } else {
        debug!("no config file {}, using defaults", cfg);
        Config::default()
    };
    config::check(cfg, &config);

    if let Err(e) = run(&matches, &config) {
        eprintln!("xfsquota: {}", e);
        exit(1);
    }
}
