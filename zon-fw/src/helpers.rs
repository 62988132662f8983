use anyhow::{anyhow, Context};
use std::fs::{read_dir, remove_dir, remove_file};
use std::path::{Path, PathBuf};

/// Default location for bpffs
pub const BPFFS: &str = "/sys/fs/bpf";

/// Name of a map used by the programs.
pub trait ToMapName {
    fn map_name() -> &'static str;
}

//
// Pinned naming scheme used by the loading user app
//  parser link: <bpffs>/zfw_<ifname>
//  shared maps: <bpffs>/zfw_<ifname>_maps/ZFWX_<map-name>
//
pub(crate) fn pinned_link_name(ifname: &str) -> String {
    format!("zfw_{}", ifname)
}

pub(crate) fn pinned_link_bpffs_path(ifname: &str) -> PathBuf {
    Path::new(BPFFS).join(pinned_link_name(ifname))
}

/// Directory holding the pinned maps shared by the programs of the
/// firewall attached to `ifname`.
pub(crate) fn maps_bpffs_path(ifname: &str) -> PathBuf {
    Path::new(BPFFS).join(format!("{}_maps", pinned_link_name(ifname)))
}

pub fn ifindex(ifname: &str) -> Result<u32, anyhow::Error> {
    if let Some(index) = ifname.strip_prefix("if#") {
        if let Ok(index) = index.parse::<u32>() {
            return Ok(index);
        }
    }

    let c_interface = std::ffi::CString::new(ifname)?;
    let if_index = unsafe { libc::if_nametoindex(c_interface.as_ptr()) };
    if if_index == 0 {
        Err(anyhow!("No interface named {}", ifname))
    } else {
        Ok(if_index)
    }
}

pub fn increase_memlocked() -> Result<(), anyhow::Error> {
    // Bump the memlock rlimit. This is needed for older kernels that don't use the
    // new memcg based accounting, see https://lwn.net/Articles/837122/
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        Err(anyhow!(
            "remove limit on locked memory failed, ret is: {}",
            ret
        ))
    } else {
        Ok(())
    }
}

/// Return the pinned link path for the parser attached to the `ifname`
/// interface and whether it exists.
pub fn prog_bpffs(ifname: &str) -> Result<(PathBuf, bool), anyhow::Error> {
    // Check if name exists
    ifindex(ifname)?;

    let path = pinned_link_bpffs_path(ifname);
    let exists = path
        .try_exists()
        .context("Can't verify if zon-fw bpffs exists")?;

    Ok((path, exists))
}

/// Creates the directory for the pinned maps if missing.
pub fn maps_bpffs(ifname: &str) -> Result<PathBuf, anyhow::Error> {
    let path = maps_bpffs_path(ifname);
    std::fs::create_dir_all(&path)
        .context(format!("Can't create bpffs directory {}", path.display()))?;
    Ok(path)
}

/// Removes the pinned maps of `ifname`, returns how many were removed.
pub fn teardown_maps(ifname: &str) -> Result<usize, anyhow::Error> {
    let dir = maps_bpffs_path(ifname);
    match dir.try_exists() {
        Ok(false) => return Ok(0),
        Ok(true) => {}
        Err(e) => return Err(anyhow!("Can't check bpffs {}, {}", dir.display(), e)),
    }

    let mut count = 0;
    for path in read_dir(&dir)
        .context("Failed to iterate bpffs")?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
    {
        match remove_file(&path) {
            Ok(()) => {
                log::info!("Map {} bpffs successfully deleted", path.display());
                count += 1;
            }
            Err(e) => log::error!("Failed to delete map {} bpffs, {}", path.display(), e),
        }
    }
    if let Err(e) = remove_dir(&dir) {
        log::warn!("Failed to remove bpffs directory {}, {}", dir.display(), e);
    }
    Ok(count)
}
