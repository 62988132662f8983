use crate::helpers::*;
use anyhow::{anyhow, Context};
use aya::programs::{
    links::{FdLink, PinnedLink},
    Xdp, XdpFlags,
};
use log::info;
use std::path::PathBuf;

// Manages the link of the parser program for a specific network interface
pub struct Prog {
    ifname: String,
    link_path: PathBuf,
    pub link_path_str: String,
    pub link_exists: bool,
}

impl Prog {
    pub fn new(ifname: &str) -> Result<Self, anyhow::Error> {
        let (zdpath, link_exists) = prog_bpffs(ifname)?;
        let path_str = zdpath.to_string_lossy().to_string();

        Ok(Self {
            ifname: ifname.to_string(),
            link_path: zdpath,
            link_path_str: path_str,
            link_exists,
        })
    }

    fn unload_by_pinned_link(&mut self) -> Result<bool, anyhow::Error> {
        if !self.link_exists {
            return Ok(false);
        }

        let link = PinnedLink::from_pin(&self.link_path)
            .context("Failed to load pinned link for zon-fw bpffs")?;

        // NOTE: the link and program remain attached to the interface
        // until the FDs are closed when the user app exits.
        link.unpin().context("Can't unpin program link")?;

        let (_, link_exists) = prog_bpffs(&self.ifname)?;
        self.link_exists = link_exists;

        info!(
            "[{}] Pinned link {} {}removed",
            &self.ifname,
            &self.link_path_str,
            if link_exists { "not " } else { "" }
        );

        Ok(link_exists)
    }

    pub fn unload(&mut self) -> Result<(), anyhow::Error> {
        let file_exists = match self.unload_by_pinned_link() {
            Ok(exists) => exists,
            Err(e) => {
                log::warn!("[{}] Failed to remove pinned, {}", &self.ifname, e);
                true
            }
        };

        if file_exists {
            if let Err(e) = std::fs::remove_file(&self.link_path) {
                log::warn!(
                    "[{}] Failed to remove bpffs {}, {}",
                    &self.ifname,
                    self.link_path_str,
                    e
                );
            }
        }

        Ok(())
    }

    /// Removes the parser link and the maps shared by the modules.
    pub fn teardown(&mut self) -> Result<(), anyhow::Error> {
        let count = teardown_maps(&self.ifname)?;
        info!("[{}] Removed {} pinned maps", &self.ifname, count);
        self.unload()
    }

    /// Attaches the loaded parser to the interface. An existing pinned link
    /// is reused, so the previous parser is replaced without a gap.
    pub fn attach(&mut self, program: &mut Xdp, flags: XdpFlags) -> Result<(), anyhow::Error> {
        if self.link_exists {
            let link = PinnedLink::from_pin(&self.link_path)
                .context("Failed to load pinned link for zon-fw bpffs")?;
            let link = FdLink::from(link);
            program
                .attach_to_link(link.try_into()?)
                .context("Failed to attach new program to existing link")?;
            info!(
                "[{}] Replaced the program of link {}",
                self.ifname, self.link_path_str
            );
            return Ok(());
        }

        let xdplinkid = program
            .attach(&self.ifname, flags)
            .context("Failed to attach program link to interface")?;

        // Pin the program link to bpf file system (bpffs).
        // Otherwise the link gets dropped after the user app exists
        // effectively disconnecting the program from netdev.
        let xdplink = program.take_link(xdplinkid)?;
        let fdlink: FdLink = xdplink.try_into()?;
        fdlink
            .pin(&self.link_path)
            .context("Failed to create pinned link for program")?;
        self.link_exists = true;

        match program.info() {
            Ok(info) => info!(
                "[{}] Pinned link attached to program id: {}",
                self.ifname,
                info.id()
            ),
            Err(e) => log::error!("[{}] Failed to get program info, {}", self.ifname, e),
        };

        Ok(())
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }
}

/// Attach mode for the parser program.
pub fn xdp_flags(driver_mode: bool, skb_mode: bool) -> Result<XdpFlags, anyhow::Error> {
    match (driver_mode, skb_mode) {
        (true, true) => Err(anyhow!("Can't attach in both driver and skb mode")),
        (true, false) => Ok(XdpFlags::DRV_MODE),
        (false, true) => Ok(XdpFlags::SKB_MODE),
        (false, false) => Ok(XdpFlags::default()),
    }
}
