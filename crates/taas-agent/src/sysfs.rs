//! sysfs implementations of the SR-IOV collaborators.
//!
//! Mirror configuration is written to the per-VF attributes exposed by the
//! NIC driver under `class/net/<pf>/device/sriov/<vf>/`. PCI lookups walk
//! `bus/pci/devices/<addr>/physfn/`.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use taas_common::nic::{MirrorCommand, NicControl, PciLookup};
use taas_common::shell;
use taas_common::{TaasError, TaasResult};
use tracing::debug;

use crate::commands::build_sysfs_mirror_cmd;

/// NIC control through sysfs writes.
pub struct SysfsNic {
    sysfs_root: PathBuf,

    #[cfg(test)]
    mock_mode: bool,

    #[cfg(test)]
    captured_commands: std::sync::Mutex<Vec<String>>,
}

impl SysfsNic {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            #[cfg(test)]
            mock_mode: false,
            #[cfg(test)]
            captured_commands: std::sync::Mutex::new(Vec::new()),
        }
    }

    #[cfg(test)]
    pub fn new_mock(sysfs_root: impl Into<PathBuf>) -> Self {
        let mut nic = Self::new(sysfs_root);
        nic.mock_mode = true;
        nic
    }

    #[cfg(test)]
    pub fn get_captured_commands(&self) -> Vec<String> {
        self.captured_commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl NicControl for SysfsNic {
    async fn set_mirror(&self, command: &MirrorCommand) -> TaasResult<()> {
        let cmd = build_sysfs_mirror_cmd(&self.sysfs_root, command);
        debug!(pf_device = %command.pf_device, command = %command, "Setting SR-IOV mirror");

        #[cfg(test)]
        if self.mock_mode {
            self.captured_commands.lock().unwrap().push(cmd);
            return Ok(());
        }

        shell::exec_or_throw(&cmd)
            .await
            .map(|_| ())
            .map_err(|e| TaasError::nic_control(command.to_string(), e))
    }
}

/// PCI lookup through the sysfs device tree.
pub struct SysfsPci {
    sysfs_root: PathBuf,
}

impl SysfsPci {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
        }
    }

    fn physfn_dir(&self, pci_addr: &str) -> PathBuf {
        self.sysfs_root
            .join("bus/pci/devices")
            .join(pci_addr)
            .join("physfn")
    }
}

fn entry_names(dir: &Path, pci_addr: &str) -> TaasResult<Vec<String>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        debug!(dir = %dir.display(), error = %e, "Failed to read sysfs directory");
        TaasError::pci_device_not_found(pci_addr)
    })?;
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}

#[async_trait]
impl PciLookup for SysfsPci {
    /// Finds the `virtfn<N>` link of the parent PF that resolves to
    /// `pci_addr`.
    async fn vf_index(&self, pci_addr: &str) -> TaasResult<u16> {
        let physfn = self.physfn_dir(pci_addr);
        for name in entry_names(&physfn, pci_addr)? {
            let Some(index) = name.strip_prefix("virtfn") else {
                continue;
            };
            let Ok(target) = fs::read_link(physfn.join(&name)) else {
                continue;
            };
            if target.file_name().and_then(|f| f.to_str()) == Some(pci_addr) {
                return index
                    .parse()
                    .map_err(|_| TaasError::pci_device_not_found(pci_addr));
            }
        }
        Err(TaasError::pci_device_not_found(pci_addr))
    }

    async fn pf_device(&self, pci_addr: &str) -> TaasResult<String> {
        let net = self.physfn_dir(pci_addr).join("net");
        entry_names(&net, pci_addr)?
            .into_iter()
            .next()
            .ok_or_else(|| TaasError::pci_device_not_found(pci_addr))
    }
}
