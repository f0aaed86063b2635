use std::path::{Path, PathBuf};
use std::process::exit;

use clap::Parser;
use libuchroot::idmap::{self, IdMap};
use libuchroot::launcher::{BindMount, ChildParams, LaunchConfig, OverlayParams, launch};
use libuchroot::pathmap::{AttrType, PathMap};
use libuchroot::processor::ChownPolicy;
use log::error;
use nix::unistd::{getegid, geteuid};

/// Run a command in an unprivileged change-root: a rearranged filesystem
/// view inside fresh user, PID and mount namespaces, with forged ownership
/// when attribute emulation is enabled.
#[derive(Parser)]
#[command(name = "uchroot")]
struct Cli {
    /// New root directory
    #[arg(short = 'r', value_name = "DIR", default_value = "/")]
    root: PathBuf,

    /// Working directory inside the new root (default: current directory)
    #[arg(short = 'w', value_name = "DIR")]
    workdir: Option<PathBuf>,

    /// Mount /dev, /proc and /sys inside the new root and emulate a
    /// controlling terminal
    #[arg(short = 'C')]
    devprocsys: bool,

    /// Pass host SRC through at TGT with identity-mapped ownership
    #[arg(short = 'M', value_name = "SRC:TGT")]
    mapped: Vec<String>,

    /// Plain bind mount of host SRC at TGT
    #[arg(short = 'm', value_name = "SRC:TGT")]
    binds: Vec<String>,

    /// Unshare the network namespace
    #[arg(short = 'n')]
    unshare_net: bool,

    /// Enable attribute emulation on the new root
    #[arg(short = 'E')]
    emulate: bool,

    /// Interior user id for the executed command
    #[arg(short = 'u', value_name = "UID", default_value_t = 0)]
    uid: u32,

    /// Interior group id for the executed command
    #[arg(short = 'g', value_name = "GID", default_value_t = 0)]
    gid: u32,

    /// Add a UID mapping range INNER:OUTER:COUNT
    #[arg(short = 'U', value_name = "I:O:C")]
    uid_ranges: Vec<String>,

    /// Add a GID mapping range INNER:OUTER:COUNT
    #[arg(short = 'G', value_name = "I:O:C")]
    gid_ranges: Vec<String>,

    /// Map a full 65536-id range from /etc/subuid and /etc/subgid
    #[arg(short = 'A')]
    auto_map: bool,

    /// Print debug messages
    #[arg(short = 'd')]
    debug: bool,

    /// Command to execute and its arguments
    #[arg(
        value_name = "CMD",
        trailing_var_arg = true,
        allow_hyphen_values = true,
        required = true
    )]
    command: Vec<String>,
}

fn usage_error(msg: &str) -> ! {
    eprintln!("uchroot: {msg}");
    eprintln!("Try 'uchroot -h' for details.");
    exit(1);
}

fn parse_pair(spec: &str, what: &str) -> (PathBuf, PathBuf) {
    let Some((src, tgt)) = spec.split_once(':') else {
        usage_error(&format!("{what} '{spec}' is not of the form SRC:TGT"));
    };
    if !src.starts_with('/') || !tgt.starts_with('/') {
        usage_error(&format!("{what} '{spec}' must use absolute paths"));
    }
    (PathBuf::from(src), PathBuf::from(tgt))
}

fn parse_range(spec: &str, map: &mut IdMap) {
    let parts: Vec<&str> = spec.split(':').collect();
    let parsed: Option<Vec<u32>> = parts.iter().map(|p| p.parse().ok()).collect();
    match parsed.as_deref() {
        Some([inner, outer, count]) => {
            map.add(*inner, *outer, *count);
        }
        _ => usage_error(&format!("mapping '{spec}' is not of the form INNER:OUTER:COUNT")),
    }
}

fn auto_range(path: &str, names: &[String], map: &mut IdMap) {
    match idmap::automatic_range(Path::new(path), names) {
        Ok(Some(range)) => {
            map.add(range.inner, range.outer, range.count);
        }
        Ok(None) => usage_error(&format!("no usable range for this user in {path}")),
        Err(e) => usage_error(&format!("cannot read {path}: {e}")),
    }
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if cli.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .init();

    let mut uid_map = IdMap::new();
    let mut gid_map = IdMap::new();
    for spec in &cli.uid_ranges {
        parse_range(spec, &mut uid_map);
    }
    for spec in &cli.gid_ranges {
        parse_range(spec, &mut gid_map);
    }
    if cli.auto_map {
        let names = idmap::invoker_subid_names();
        auto_range("/etc/subuid", &names, &mut uid_map);
        auto_range("/etc/subgid", &names, &mut gid_map);
    }
    if uid_map.is_empty() {
        uid_map = IdMap::single(cli.uid, geteuid().as_raw());
    }
    if gid_map.is_empty() {
        gid_map = IdMap::single(cli.gid, getegid().as_raw());
    }

    let workdir = match cli.workdir {
        Some(dir) => dir,
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
    };

    let mapped: Vec<(PathBuf, PathBuf)> = cli
        .mapped
        .iter()
        .map(|s| parse_pair(s, "mapped path"))
        .collect();
    let bind_mounts: Vec<BindMount> = cli
        .binds
        .iter()
        .map(|s| parse_pair(s, "bind mount"))
        .map(|(outside, inside)| BindMount { outside, inside })
        .collect();

    // The overlay serves when emulation is on or any mapped subtree exists;
    // otherwise the launcher performs a plain chroot into -r.
    let overlay = if cli.emulate || !mapped.is_empty() {
        let mut paths = PathMap::new();
        let root = cli.root.to_string_lossy();
        let root_attr = if cli.emulate { AttrType::Emulated } else { AttrType::Mapped };
        paths.add_mapping(root_attr, "/", &root);
        if cli.devprocsys {
            for dir in ["/dev", "/proc", "/sys"] {
                paths.add_mapping(AttrType::Untranslated, dir, dir);
            }
        }
        for (src, tgt) in &mapped {
            paths.add_mapping(
                AttrType::Mapped,
                &tgt.to_string_lossy(),
                &src.to_string_lossy(),
            );
        }
        Some(OverlayParams { paths, chown_policy: ChownPolicy::default() })
    } else {
        None
    };

    let cfg = LaunchConfig {
        params: ChildParams {
            new_root: cli.root,
            new_workdir: workdir,
            devprocsys: cli.devprocsys,
            unshare_net: cli.unshare_net,
            bind_mounts,
            uid_map,
            gid_map,
            initial_uid: cli.uid,
            initial_gid: cli.gid,
        },
        overlay,
        command: cli.command,
    };

    match launch(cfg) {
        Ok(status) => exit(status),
        Err(e) => {
            error!("{e:#}");
            exit(1);
        }
    }
}
