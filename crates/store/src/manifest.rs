use anyhow::{anyhow, Context, Result};
use koil_core::{ObjectKey, ResourceKind, ResourceObject};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// One object document as found in a YAML manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ManifestMeta,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub status: Option<serde_json::Value>,
}

impl Manifest {
    pub fn resource_kind(&self) -> ResourceKind {
        match self.api_version.split_once('/') {
            Some((group, version)) => ResourceKind::new(group, version, self.kind.as_str()),
            None => ResourceKind::new(String::new(), self.api_version.as_str(), self.kind.as_str()),
        }
    }

    pub fn into_object(self) -> ResourceObject {
        let key = ObjectKey {
            kind: self.resource_kind(),
            namespace: self.metadata.namespace,
            name: self.metadata.name,
        };
        ResourceObject { status: self.status, ..ResourceObject::new(key, self.spec) }
    }
}

/// Parse a multi-document YAML string. Empty documents are skipped.
pub fn parse_manifests(yaml: &str) -> Result<Vec<Manifest>> {
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let value = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML document {i}"))?;
        if value.is_null() {
            continue;
        }
        let m: Manifest = serde_yaml::from_value(value).with_context(|| format!("decoding object in document {i}"))?;
        if m.metadata.name.is_empty() {
            return Err(anyhow!("document {i}: metadata.name is empty"));
        }
        out.push(m);
    }
    Ok(out)
}
