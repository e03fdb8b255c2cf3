//! Service descriptors: the declared RPC interface of the gateway.
//!
//! Descriptor files are JSON documents discovered recursively under a
//! directory:
//!
//! ```json
//! {
//!   "package": "gateway.documents",
//!   "services": [
//!     { "name": "DocumentService", "methods": [{ "name": "GetDocument", "action": "getDocument" }] }
//!   ]
//! }
//! ```
//!
//! A declared service is looked up by its dotted name (`package.Service`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::types::{Error, Result};

/// One method of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    /// Wire name of the method.
    pub name: String,
    /// Action serving the method. Defaults to the wire name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: None,
        }
    }

    pub fn action_name(&self) -> &str {
        self.action.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Dotted name, `package.Service`.
    #[serde(skip)]
    pub full_name: String,
    pub name: String,
    #[serde(default)]
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(full_name: impl Into<String>, methods: Vec<MethodDescriptor>) -> Self {
        let full_name = full_name.into();
        let name = full_name
            .rsplit_once('.')
            .map_or(full_name.as_str(), |(_, name)| name)
            .to_string();
        Self {
            full_name,
            name,
            methods,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DescriptorFile {
    #[serde(default)]
    package: Option<String>,
    #[serde(default)]
    services: Vec<ServiceDescriptor>,
}

/// All service descriptors known to the process, by dotted name.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSet {
    services: BTreeMap<String, ServiceDescriptor>,
}

impl DescriptorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.json` descriptor under `dir`, recursively.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let mut files = Vec::new();
        collect_descriptor_files(dir.as_ref(), &mut files)?;
        files.sort();

        let mut set = Self::new();
        for path in files {
            let raw = std::fs::read_to_string(&path)?;
            let file: DescriptorFile = serde_json::from_str(&raw).map_err(|e| {
                Error::registration(format!("invalid descriptor {}: {e}", path.display()))
            })?;
            for mut service in file.services {
                service.full_name = match &file.package {
                    Some(package) if !package.is_empty() => format!("{package}.{}", service.name),
                    _ => service.name.clone(),
                };
                tracing::debug!(service = %service.full_name, path = %path.display(), "descriptor loaded");
                set.insert(service);
            }
        }
        Ok(set)
    }

    pub fn insert(&mut self, service: ServiceDescriptor) {
        self.services.insert(service.full_name.clone(), service);
    }

    /// Look up a declared service by dotted name.
    pub fn resolve(&self, full_name: &str) -> Result<&ServiceDescriptor> {
        self.services.get(full_name).ok_or_else(|| {
            Error::registration(format!("Unable to find service definition for {full_name}"))
        })
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

fn collect_descriptor_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_descriptor_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }
    Ok(())
}
