//! Listener-to-descriptor map handed from a process to its successor.
//!
//! # Wire Format
//! ```text
//! GRACEHTTP_FDMAP={"default":{"http":"0.0.0.0:8080#3,0.0.0.0:8081#4","https":"0.0.0.0:8443#5"}}
//! ```
//! One FdMap per logical server name. Written once by the coordinator,
//! read once by the successor at startup. The variable is left in place:
//! mutating the environment once worker threads exist is unsound, and every
//! child this process spawns gets the key overwritten or removed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::net::inherit::Descriptor;

/// Environment key carrying the serialized handoff.
pub const FDMAP_ENV: &str = "GRACEHTTP_FDMAP";

const ENTRY_SEPARATOR: char = ',';
const FD_SEPARATOR: char = '#';

/// Transport name → comma-joined `address#descriptor` list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdMap {
    #[serde(default)]
    pub http: String,
    #[serde(default)]
    pub https: String,
}

/// One decoded `address#descriptor` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InheritedEntry {
    pub address: String,
    pub descriptor: Descriptor,
    pub secure: bool,
}

impl FdMap {
    pub fn push(&mut self, secure: bool, address: &str, descriptor: Descriptor) {
        let list = if secure { &mut self.https } else { &mut self.http };
        if !list.is_empty() {
            list.push(ENTRY_SEPARATOR);
        }
        list.push_str(address);
        list.push(FD_SEPARATOR);
        list.push_str(&descriptor.to_string());
    }

    /// Decode every entry; a malformed entry fails alone.
    pub fn entries(&self) -> Vec<Result<InheritedEntry, String>> {
        let http = split_list(&self.http).map(|e| parse_entry(e, false));
        let https = split_list(&self.https).map(|e| parse_entry(e, true));
        http.chain(https).collect()
    }

    pub fn len(&self) -> usize {
        split_list(&self.http).count() + split_list(&self.https).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(ENTRY_SEPARATOR).map(str::trim).filter(|e| !e.is_empty())
}

fn parse_entry(entry: &str, secure: bool) -> Result<InheritedEntry, String> {
    let (address, fd) = entry
        .rsplit_once(FD_SEPARATOR)
        .ok_or_else(|| format!("entry `{entry}` has no descriptor"))?;
    if address.is_empty() {
        return Err(format!("entry `{entry}` has no address"));
    }
    let descriptor: Descriptor = fd
        .parse()
        .map_err(|_| format!("entry `{entry}` has an invalid descriptor"))?;
    if descriptor < 0 {
        return Err(format!("entry `{entry}` has a negative descriptor"));
    }
    Ok(InheritedEntry {
        address: address.to_string(),
        descriptor,
        secure,
    })
}

/// Every server's FdMap, keyed by logical server name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handoff {
    pub servers: BTreeMap<String, FdMap>,
}

impl Handoff {
    pub fn server(&self, name: &str) -> Option<&FdMap> {
        self.servers.get(name)
    }

    pub fn server_mut(&mut self, name: &str) -> &mut FdMap {
        self.servers.entry(name.to_string()).or_default()
    }

    /// Total descriptors referenced, malformed entries included.
    pub fn descriptor_count(&self) -> usize {
        self.servers.values().map(FdMap::len).sum()
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// The handoff left in the environment by a predecessor, if any.
    pub fn read_from_env() -> Option<Result<Self, serde_json::Error>> {
        Self::from_var(std::env::var(FDMAP_ENV).ok().as_deref())
    }

    /// `None` when the variable is unset or blank.
    pub fn from_var(raw: Option<&str>) -> Option<Result<Self, serde_json::Error>> {
        let raw = raw.map(str::trim).filter(|raw| !raw.is_empty())?;
        Some(Self::decode(raw))
    }
}
