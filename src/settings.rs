//! Provisioning settings.
//!
//! The image catalog, device credentials and every timing used by the boot
//! sequencer are plain data injected into the components. The built-in
//! defaults describe the lab's standard images; a TOML file can override
//! them. An image table replaces the whole descriptor, other keys fall back
//! to their defaults one by one:
//!
//! ```toml
//! [catalog.cisco]
//! source = "imagehost:/srv/images/xrv9k.qcow2"
//! user = "lab"
//! local_dir = "/var/lib/libvirt/images"
//! local_name = "xrv9k.qcow2"
//! image_size_gb = 6.2
//!
//! [timings]
//! boot_timeout = 1200
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ProvisionError, Result};
use crate::vm::DeviceFamily;

/// Where a base image comes from and where it is cached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageDescriptor {
    /// rsync source, `host:/path`.
    pub source: String,
    /// Remote user for the transfer.
    pub user: String,
    /// Remote password, answered on the transfer's password prompt.
    #[serde(default)]
    pub password: Option<String>,
    /// Local cache directory; instance copies are created next to the cache.
    pub local_dir: PathBuf,
    /// File name of the cached base image or bundle.
    pub local_name: String,
    /// Disk footprint of one instance, in GB.
    pub image_size_gb: f64,
}

impl ImageDescriptor {
    pub fn local_path(&self) -> PathBuf {
        self.local_dir.join(&self.local_name)
    }
}

/// IOS-XRv image and sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CiscoImage {
    #[serde(flatten)]
    pub image: ImageDescriptor,
    pub memory_kib: u64,
    pub emulator: String,
    pub machine: String,
}

impl Default for CiscoImage {
    fn default() -> Self {
        Self {
            image: ImageDescriptor {
                source: "imagehost:/var/lib/libvirt/images/cisco_vm_base.qcow2".to_string(),
                user: "lab".to_string(),
                password: None,
                local_dir: PathBuf::from("/var/lib/libvirt/images"),
                local_name: "cisco_vm_base.qcow2".to_string(),
                image_size_gb: 6.2,
            },
            memory_kib: 8 * 1024 * 1024,
            emulator: "/usr/bin/kvm-spice".to_string(),
            machine: "pc-i440fx-xenial".to_string(),
        }
    }
}

/// vMX bundle, its internal image names, sizing and license keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JuniperImage {
    #[serde(flatten)]
    pub image: ImageDescriptor,
    /// Control-plane disk inside `<bundle>/images/`.
    pub re_image_name: String,
    pub hdd_image_name: String,
    pub fpc_image_name: String,
    pub vcp_memory_mb: u64,
    pub vfp_memory_mb: u64,
    /// License keys pasted into the device after base configuration.
    /// Empty means no licensing step.
    pub license: Vec<String>,
}

impl Default for JuniperImage {
    fn default() -> Self {
        Self {
            image: ImageDescriptor {
                source: "imagehost:/opt/vmx/vmx-bundle-20.4R1.12.tgz".to_string(),
                user: "lab".to_string(),
                password: None,
                local_dir: PathBuf::from("/var/lib/libvirt/images"),
                local_name: "vmx-bundle-20.4R1.12.tgz".to_string(),
                image_size_gb: 12.0,
            },
            re_image_name: "junos-vmx-x86-64-20.4R1.12.qcow2".to_string(),
            hdd_image_name: "vmxhdd.img".to_string(),
            fpc_image_name: "vFPC-20201209.img".to_string(),
            vcp_memory_mb: 2048,
            vfp_memory_mb: 4096,
            license: Vec::new(),
        }
    }
}

/// Static image table, one entry per family.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImageCatalog {
    pub cisco: CiscoImage,
    pub juniper: JuniperImage,
}

impl ImageCatalog {
    pub fn descriptor(&self, family: DeviceFamily) -> &ImageDescriptor {
        match family {
            DeviceFamily::Cisco => &self.cisco.image,
            DeviceFamily::Juniper => &self.juniper.image,
        }
    }

    /// Disk footprint of one instance, in GB.
    pub fn disk_gb(&self, family: DeviceFamily) -> f64 {
        self.descriptor(family).image_size_gb
    }

    /// Memory of one instance, in GB.
    pub fn memory_gb(&self, family: DeviceFamily) -> f64 {
        match family {
            DeviceFamily::Cisco => self.cisco.memory_kib as f64 / (1024.0 * 1024.0),
            DeviceFamily::Juniper => {
                (self.juniper.vcp_memory_mb + self.juniper.vfp_memory_mb) as f64 / 1024.0
            }
        }
    }
}

/// Accounts created on the device and used to log into it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Credentials {
    /// User created by the base configuration.
    pub username: String,
    /// Plain password, used on the console login prompts.
    pub password: String,
    /// MD5-crypt hash of `password` (Junos `encrypted-password`).
    pub md5_hash: String,
    /// SHA-512-crypt hash of `password` (IOS-XR `secret 10`).
    pub sha512_hash: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: "lab".to_string(),
            password: "lab123!".to_string(),
            md5_hash: "$1$Lb7q2Xr9$sWE3JWpj5TaHSz6zK9i861".to_string(),
            sha512_hash: "$6$Lb7q2Xr9Zk$MeBGuzjBjGmMYb4M56dPAWAKclaQDVZGrFy9MnBu/djfy.9ISgYT2x.q1doadmUQcuHeG9OFEeM0dXhrqEDKa.".to_string(),
        }
    }
}

/// Every wait and delay of a provisioning run. Values are seconds in the
/// settings file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Timings {
    /// Overall deadline for the boot detector.
    #[serde(deserialize_with = "secs", serialize_with = "ser_secs")]
    pub boot_timeout: Duration,
    /// Pause between two boot probes.
    #[serde(deserialize_with = "secs", serialize_with = "ser_secs")]
    pub probe_interval: Duration,
    /// Wait for the first prompt of a boot probe.
    #[serde(deserialize_with = "secs", serialize_with = "ser_secs")]
    pub probe_timeout: Duration,
    /// Wait for ordinary prompts.
    #[serde(deserialize_with = "secs", serialize_with = "ser_secs")]
    pub prompt_timeout: Duration,
    /// Wait for the Junos CLI to start from the shell.
    #[serde(deserialize_with = "secs", serialize_with = "ser_secs")]
    pub cli_timeout: Duration,
    /// Wait for a commit acknowledgment.
    #[serde(deserialize_with = "secs", serialize_with = "ser_secs")]
    pub commit_timeout: Duration,
    /// Pause after each configuration paste attempt.
    #[serde(deserialize_with = "secs", serialize_with = "ser_secs")]
    pub settle: Duration,
    /// Pause between Junos boot detection and the first configuration paste.
    #[serde(deserialize_with = "secs", serialize_with = "ser_secs")]
    pub pre_config_settle: Duration,
    /// Wait for the console banner after attaching.
    #[serde(deserialize_with = "secs", serialize_with = "ser_secs")]
    pub attach_timeout: Duration,
    /// Pause between vMX install attempts.
    #[serde(deserialize_with = "secs", serialize_with = "ser_secs")]
    pub install_backoff: Duration,
    #[serde(deserialize_with = "secs", serialize_with = "ser_secs")]
    pub install_timeout: Duration,
    #[serde(deserialize_with = "secs", serialize_with = "ser_secs")]
    pub fetch_timeout: Duration,
    #[serde(deserialize_with = "secs", serialize_with = "ser_secs")]
    pub extract_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            boot_timeout: Duration::from_secs(15 * 60),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
            prompt_timeout: Duration::from_secs(30),
            cli_timeout: Duration::from_secs(3 * 60),
            commit_timeout: Duration::from_secs(3 * 60),
            settle: Duration::from_secs(7),
            pre_config_settle: Duration::from_secs(20),
            attach_timeout: Duration::from_secs(30),
            install_backoff: Duration::from_secs(5),
            install_timeout: Duration::from_secs(7 * 60),
            fetch_timeout: Duration::from_secs(30 * 60),
            extract_timeout: Duration::from_secs(7 * 60),
        }
    }
}

impl Timings {
    /// Millisecond-scale timings for driving scripted consoles in tests.
    #[cfg(test)]
    pub fn immediate() -> Self {
        let short = Duration::from_millis(200);
        Self {
            boot_timeout: Duration::from_secs(2),
            probe_interval: Duration::from_millis(5),
            probe_timeout: short,
            prompt_timeout: short,
            cli_timeout: short,
            commit_timeout: short,
            settle: Duration::ZERO,
            pre_config_settle: Duration::ZERO,
            attach_timeout: short,
            install_backoff: Duration::ZERO,
            install_timeout: short,
            fetch_timeout: short,
            extract_timeout: short,
        }
    }
}

fn secs<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

fn ser_secs<S: serde::Serializer>(d: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(d.as_secs())
}

/// Everything a provisioning run is parameterized by.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub catalog: ImageCatalog,
    pub credentials: Credentials,
    pub timings: Timings,
}

impl Settings {
    /// Load settings from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ProvisionError::Settings {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&contents).map_err(|reason| ProvisionError::Settings {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Load from `path` if given, built-in defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    fn from_toml(contents: &str) -> std::result::Result<Self, String> {
        toml::from_str(contents).map_err(|e| e.to_string())
    }
}
