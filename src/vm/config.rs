//! The "current config": the mutable template every `vm launch` snapshots.
//!
//! `vm config <field> [value...]` edits one field, `vm config` prints the
//! whole template, `clear vm config [field]` resets. Launch copies the
//! template into the new VM, so later edits never affect running VMs.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One NIC specification, as given to `vm config net`.
///
/// Accepted token forms: `<vlan>`, `<bridge>,<vlan>`, `<vlan>,<mac>`,
/// `<bridge>,<vlan>,<mac>`, `<bridge>,<vlan>,<mac>,<driver>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetSpec {
    /// Bridge the tap joins.
    pub bridge: String,
    /// VLAN tag on the bridge.
    pub vlan: u32,
    /// MAC, generated at launch when empty.
    pub mac: String,
    /// Guest NIC driver (qemu device model).
    pub driver: String,
}

impl NetSpec {
    /// Parse one `vm config net` token.
    pub fn parse(token: &str) -> Result<Self> {
        let parts: Vec<&str> = token.split(',').collect();
        let mut spec = Self {
            bridge: "meshbox0".to_string(),
            vlan: 0,
            mac: String::new(),
            driver: "e1000".to_string(),
        };

        let parse_vlan = |s: &str| -> Result<u32> {
            s.parse()
                .map_err(|_| Error::Invalid(format!("invalid vlan: {:?}", s)))
        };

        match parts.as_slice() {
            [vlan] => spec.vlan = parse_vlan(vlan)?,
            [a, b] => {
                // Either bridge,vlan or vlan,mac.
                if let Ok(vlan) = a.parse() {
                    spec.vlan = vlan;
                    spec.mac = validate_mac(b)?;
                } else {
                    spec.bridge = (*a).to_string();
                    spec.vlan = parse_vlan(b)?;
                }
            }
            [bridge, vlan, mac] => {
                spec.bridge = (*bridge).to_string();
                spec.vlan = parse_vlan(vlan)?;
                spec.mac = validate_mac(mac)?;
            }
            [bridge, vlan, mac, driver] => {
                spec.bridge = (*bridge).to_string();
                spec.vlan = parse_vlan(vlan)?;
                spec.mac = validate_mac(mac)?;
                spec.driver = (*driver).to_string();
            }
            _ => {
                return Err(Error::Invalid(format!("invalid net spec: {:?}", token)));
            }
        }
        Ok(spec)
    }
}

impl fmt::Display for NetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.bridge,
            self.vlan,
            if self.mac.is_empty() { "auto" } else { &self.mac },
            self.driver
        )
    }
}

fn validate_mac(s: &str) -> Result<String> {
    let bytes: Vec<&str> = s.split(':').collect();
    let valid = bytes.len() == 6
        && bytes
            .iter()
            .all(|b| b.len() == 2 && b.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(Error::Invalid(format!("invalid mac: {:?}", s)));
    }
    Ok(s.to_lowercase())
}

/// The launch template. Every field has a workable default so `vm launch`
/// succeeds with nothing configured but a disk or filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    /// Guest memory in MB.
    pub memory: u64,
    /// Guest vCPU count.
    pub vcpus: u32,
    /// CPU model passed to the hypervisor.
    pub cpu: String,
    /// Direct-boot kernel path.
    pub kernel: String,
    /// Direct-boot initrd path.
    pub initrd: String,
    /// Kernel command line for direct boot.
    pub append: String,
    /// Disk image paths.
    pub disks: Vec<String>,
    /// CD-ROM image path.
    pub cdrom: String,
    /// Copy-on-write launch: the base image is never written.
    pub snapshot: bool,
    /// Incoming-migration file path.
    pub migrate_path: String,
    /// Count of emulated serial ports.
    pub serial_ports: u32,
    /// Count of virtio-serial ports.
    pub virtio_ports: u32,
    /// Hypervisor binary.
    pub qemu_path: String,
    /// Extra argv appended to the hypervisor command line.
    pub qemu_append: Vec<String>,
    /// Ordered pairwise string rewrites applied to the final argv.
    pub qemu_override: Vec<(String, String)>,
    /// NIC specifications.
    pub networks: Vec<NetSpec>,
    /// Free-form tags copied onto the VM.
    pub tags: HashMap<String, String>,

    // Container-only fields.
    /// Container root filesystem path.
    pub filesystem: String,
    /// Container hostname.
    pub hostname: String,
    /// Container init argv.
    pub init: Vec<String>,
    /// Hook run inside the namespaces before init.
    pub preinit: String,
    /// Count of host-bound FIFOs under /dev/fifos.
    pub fifos: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory: 2048,
            vcpus: 1,
            cpu: "host".to_string(),
            kernel: String::new(),
            initrd: String::new(),
            append: String::new(),
            disks: Vec::new(),
            cdrom: String::new(),
            snapshot: true,
            migrate_path: String::new(),
            serial_ports: 0,
            virtio_ports: 0,
            qemu_path: "kvm".to_string(),
            qemu_append: Vec::new(),
            qemu_override: Vec::new(),
            networks: Vec::new(),
            tags: HashMap::new(),
            filesystem: String::new(),
            hostname: String::new(),
            init: vec!["/init".to_string()],
            preinit: String::new(),
            fifos: 0,
        }
    }
}

/// Fields addressable by `vm config <field>` and `clear vm config <field>`.
pub const CONFIG_FIELDS: &[&str] = &[
    "memory",
    "vcpus",
    "cpu",
    "kernel",
    "initrd",
    "append",
    "disk",
    "cdrom",
    "snapshot",
    "migrate",
    "serial",
    "virtio-serial",
    "qemu",
    "qemu-append",
    "qemu-override",
    "net",
    "tag",
    "filesystem",
    "hostname",
    "init",
    "preinit",
    "fifo",
];

impl VmConfig {
    /// Show one field's current value.
    pub fn get(&self, field: &str) -> Result<String> {
        Ok(match field {
            "memory" => self.memory.to_string(),
            "vcpus" => self.vcpus.to_string(),
            "cpu" => self.cpu.clone(),
            "kernel" => self.kernel.clone(),
            "initrd" => self.initrd.clone(),
            "append" => self.append.clone(),
            "disk" => self.disks.join(" "),
            "cdrom" => self.cdrom.clone(),
            "snapshot" => self.snapshot.to_string(),
            "migrate" => self.migrate_path.clone(),
            "serial" => self.serial_ports.to_string(),
            "virtio-serial" => self.virtio_ports.to_string(),
            "qemu" => self.qemu_path.clone(),
            "qemu-append" => self.qemu_append.join(" "),
            "qemu-override" => self
                .qemu_override
                .iter()
                .map(|(from, to)| format!("{} -> {}", from, to))
                .collect::<Vec<_>>()
                .join(", "),
            "net" => self
                .networks
                .iter()
                .map(NetSpec::to_string)
                .collect::<Vec<_>>()
                .join(" "),
            "tag" => {
                let mut tags: Vec<String> =
                    self.tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                tags.sort();
                tags.join(" ")
            }
            "filesystem" => self.filesystem.clone(),
            "hostname" => self.hostname.clone(),
            "init" => self.init.join(" "),
            "preinit" => self.preinit.clone(),
            "fifo" => self.fifos.to_string(),
            _ => return Err(Error::Invalid(format!("unknown config field: {}", field))),
        })
    }

    /// Set one field from `vm config <field> <value...>` tokens.
    pub fn set(&mut self, field: &str, values: &[String]) -> Result<()> {
        let one = || -> Result<&String> {
            match values {
                [v] => Ok(v),
                _ => Err(Error::Invalid(format!(
                    "{} takes exactly one value",
                    field
                ))),
            }
        };

        match field {
            "memory" => {
                self.memory = one()?
                    .parse()
                    .map_err(|_| Error::Invalid("memory must be an integer (MB)".into()))?;
            }
            "vcpus" => {
                self.vcpus = one()?
                    .parse()
                    .map_err(|_| Error::Invalid("vcpus must be an integer".into()))?;
            }
            "cpu" => self.cpu = one()?.clone(),
            "kernel" => self.kernel = one()?.clone(),
            "initrd" => self.initrd = one()?.clone(),
            "append" => self.append = values.join(" "),
            "disk" => self.disks = values.to_vec(),
            "cdrom" => self.cdrom = one()?.clone(),
            "snapshot" => {
                self.snapshot = match one()?.as_str() {
                    "true" => true,
                    "false" => false,
                    other => {
                        return Err(Error::Invalid(format!(
                            "snapshot must be true or false, got {:?}",
                            other
                        )))
                    }
                };
            }
            "migrate" => self.migrate_path = one()?.clone(),
            "serial" => {
                self.serial_ports = one()?
                    .parse()
                    .map_err(|_| Error::Invalid("serial must be an integer".into()))?;
            }
            "virtio-serial" => {
                self.virtio_ports = one()?
                    .parse()
                    .map_err(|_| Error::Invalid("virtio-serial must be an integer".into()))?;
            }
            "qemu" => self.qemu_path = one()?.clone(),
            "qemu-append" => self.qemu_append = values.to_vec(),
            "qemu-override" => match values {
                [from, to] => self.qemu_override.push((from.clone(), to.clone())),
                _ => {
                    return Err(Error::Invalid(
                        "qemu-override takes a match and a replacement".into(),
                    ))
                }
            },
            "net" => {
                self.networks = values
                    .iter()
                    .map(|token| NetSpec::parse(token))
                    .collect::<Result<Vec<_>>>()?;
            }
            "tag" => match values {
                [key, value] => {
                    self.tags.insert(key.clone(), value.clone());
                }
                [key] => {
                    self.tags.remove(key);
                }
                _ => return Err(Error::Invalid("tag takes a key and optional value".into())),
            },
            "filesystem" => self.filesystem = one()?.clone(),
            "hostname" => self.hostname = one()?.clone(),
            "init" => self.init = values.to_vec(),
            "preinit" => self.preinit = one()?.clone(),
            "fifo" => {
                self.fifos = one()?
                    .parse()
                    .map_err(|_| Error::Invalid("fifo must be an integer".into()))?;
            }
            _ => return Err(Error::Invalid(format!("unknown config field: {}", field))),
        }
        Ok(())
    }

    /// Reset one field (or all of them) to defaults.
    pub fn clear(&mut self, field: Option<&str>) -> Result<()> {
        let defaults = Self::default();
        let Some(field) = field else {
            *self = defaults;
            return Ok(());
        };
        match field {
            "memory" => self.memory = defaults.memory,
            "vcpus" => self.vcpus = defaults.vcpus,
            "cpu" => self.cpu = defaults.cpu,
            "kernel" => self.kernel = defaults.kernel,
            "initrd" => self.initrd = defaults.initrd,
            "append" => self.append = defaults.append,
            "disk" => self.disks = defaults.disks,
            "cdrom" => self.cdrom = defaults.cdrom,
            "snapshot" => self.snapshot = defaults.snapshot,
            "migrate" => self.migrate_path = defaults.migrate_path,
            "serial" => self.serial_ports = defaults.serial_ports,
            "virtio-serial" => self.virtio_ports = defaults.virtio_ports,
            "qemu" => self.qemu_path = defaults.qemu_path,
            "qemu-append" => self.qemu_append = defaults.qemu_append,
            "qemu-override" => self.qemu_override = defaults.qemu_override,
            "net" => self.networks = defaults.networks,
            "tag" => self.tags = defaults.tags,
            "filesystem" => self.filesystem = defaults.filesystem,
            "hostname" => self.hostname = defaults.hostname,
            "init" => self.init = defaults.init,
            "preinit" => self.preinit = defaults.preinit,
            "fifo" => self.fifos = defaults.fifos,
            _ => return Err(Error::Invalid(format!("unknown config field: {}", field))),
        }
        Ok(())
    }

    /// Human-readable dump, also written to the instance `config` file.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for field in CONFIG_FIELDS {
            // get() cannot fail for known fields.
            if let Ok(value) = self.get(field) {
                out.push_str(&format!("{:<14} {}\n", field, value));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_spec_forms() {
        assert_eq!(
            NetSpec::parse("100").unwrap(),
            NetSpec {
                bridge: "meshbox0".into(),
                vlan: 100,
                mac: "".into(),
                driver: "e1000".into()
            }
        );
        let spec = NetSpec::parse("br0,200").unwrap();
        assert_eq!((spec.bridge.as_str(), spec.vlan), ("br0", 200));

        let spec = NetSpec::parse("100,de:ad:be:ef:00:01").unwrap();
        assert_eq!(spec.vlan, 100);
        assert_eq!(spec.mac, "de:ad:be:ef:00:01");

        let spec = NetSpec::parse("br1,300,DE:AD:BE:EF:00:02,virtio-net-pci").unwrap();
        assert_eq!(spec.driver, "virtio-net-pci");
        assert_eq!(spec.mac, "de:ad:be:ef:00:02");

        assert!(NetSpec::parse("br0,abc").is_err());
        assert!(NetSpec::parse("100,nonsense").is_err());
    }

    #[test]
    fn set_get_round_trip() {
        let mut config = VmConfig::default();
        config.set("memory", &["512".to_string()]).unwrap();
        assert_eq!(config.memory, 512);
        assert_eq!(config.get("memory").unwrap(), "512");

        config
            .set("disk", &["/tmp/a.img".to_string(), "/tmp/b.img".to_string()])
            .unwrap();
        assert_eq!(config.get("disk").unwrap(), "/tmp/a.img /tmp/b.img");

        assert!(config.set("memory", &["lots".to_string()]).is_err());
        assert!(config.set("bogus", &["x".to_string()]).is_err());
    }

    #[test]
    fn clear_resets_one_or_all() {
        let mut config = VmConfig::default();
        config.set("memory", &["512".to_string()]).unwrap();
        config.set("vcpus", &["4".to_string()]).unwrap();

        config.clear(Some("memory")).unwrap();
        assert_eq!(config.memory, VmConfig::default().memory);
        assert_eq!(config.vcpus, 4);

        config.clear(None).unwrap();
        assert_eq!(config.vcpus, VmConfig::default().vcpus);
    }

    #[test]
    fn dump_lists_every_field() {
        let dump = VmConfig::default().dump();
        for field in CONFIG_FIELDS {
            assert!(dump.contains(field), "dump missing {}", field);
        }
    }

    #[test]
    fn qemu_override_accumulates_in_order() {
        let mut config = VmConfig::default();
        config
            .set("qemu-override", &["-m 2048".to_string(), "-m 4096".to_string()])
            .unwrap();
        config
            .set("qemu-override", &["foo".to_string(), "bar".to_string()])
            .unwrap();
        assert_eq!(config.qemu_override.len(), 2);
        assert_eq!(config.qemu_override[0].0, "-m 2048");
    }
}
