//! IPv4 subnet matching and Proxmox NIC property strings.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// NIC models Proxmox accepts as the leading `model=MAC` pair of a `netN` value.
pub const NIC_MODELS: &[&str] = &[
    "virtio", "e1000", "e1000e", "rtl8139", "vmxnet3", "ne2k_pci", "pcnet", "i82551",
    "i82557b", "i82559er", "ne2k_isa",
];

// ---------------------------------------------------------------------------
// Subnet
// ---------------------------------------------------------------------------

/// An IPv4 network in CIDR notation. The address is normalised to the
/// network address on parse, so `192.168.141.7/23` becomes `192.168.140.0/23`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Option<Self> {
        if prefix > 32 {
            return None;
        }
        let mask = Self::mask_for(prefix);
        Some(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    fn mask_for(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & Self::mask_for(self.prefix) == u32::from(self.network)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid subnet {0:?}, expected a.b.c.d/prefix")]
pub struct SubnetParseError(String);

impl FromStr for Subnet {
    type Err = SubnetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || SubnetParseError(s.to_string());
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(err)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| err())?;
        let prefix: u8 = prefix.parse().map_err(|_| err())?;
        Subnet::new(addr, prefix).ok_or_else(err)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl Serialize for Subnet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Subnet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// NIC property strings
// ---------------------------------------------------------------------------

/// Model of a NIC property string such as `virtio=BC:24:11:AA:BB:CC,bridge=vmbr0`
/// or `model=e1000,bridge=vmbr1`.
pub fn nic_model(spec: &str) -> Option<&str> {
    spec.split(',').find_map(|part| {
        let (key, value) = part.split_once('=')?;
        if key == "model" {
            return Some(value);
        }
        NIC_MODELS.iter().find(|m| **m == key).copied()
    })
}

/// Bridge a NIC is attached to, if any.
pub fn nic_bridge(spec: &str) -> Option<&str> {
    spec.split(',')
        .find_map(|part| part.strip_prefix("bridge="))
}

/// Rewrite only the `bridge=` component, keeping MAC, model, firewall and
/// every other option in place. Appends the bridge if the string had none.
pub fn with_bridge(spec: &str, bridge: &str) -> String {
    let mut replaced = false;
    let mut parts: Vec<String> = spec
        .split(',')
        .filter(|part| !part.is_empty())
        .map(|part| {
            if part.starts_with("bridge=") {
                replaced = true;
                format!("bridge={bridge}")
            } else {
                part.to_string()
            }
        })
        .collect();
    if !replaced {
        parts.push(format!("bridge={bridge}"));
    }
    parts.join(",")
}

/// Property string for a brand new NIC.
pub fn new_nic(model: &str, bridge: &str) -> String {
    format!("model={model},bridge={bridge}")
}
