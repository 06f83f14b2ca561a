use std::{fs, io, path::Path};

use anyhow::Context;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::Error, fs::TileDir};

pub const METADATA_FILE: &str = "metadata.json";
pub const LAYER_FILE: &str = "layer.json";

// Name of the metadata entry holding the interactivity template.
pub const FORMATTER_KEY: &str = "formatter";

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub formatter: Option<String>,
}

// Reads a JSON sidecar from the root of a tile tree. A missing file is not an
// error.
pub fn load<T, P>(root: P, name: &str) -> anyhow::Result<Option<T>>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = root.as_ref().join(name);
    match fs::read_to_string(&path) {
        Ok(contents) => {
            let t = serde_json::from_str(contents.as_str())
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(Some(t))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(e)).with_context(|| format!("reading {}", path.display())),
    }
}

pub fn store<T, D>(dir: &D, name: &str, t: &T) -> anyhow::Result<()>
where
    T: Serialize,
    D: TileDir,
{
    let encoded = serde_json::to_string(t)?;
    dir.write(&name, encoded.as_bytes())
}

// Flattens a metadata.json document into (name, value) rows. Strings are kept
// verbatim, anything else is stored as its JSON text.
pub fn metadata_rows(doc: Map<String, Value>) -> Vec<(String, String)> {
    doc.into_iter()
        .map(|(k, v)| match v {
            Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect()
}

pub fn metadata_doc(rows: &[(String, String)]) -> Map<String, Value> {
    rows.iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect()
}

pub fn layer_config(rows: &[(String, String)]) -> Option<LayerConfig> {
    rows.iter()
        .find(|(k, _)| k == FORMATTER_KEY)
        .map(|(_, v)| LayerConfig {
            formatter: Some(v.clone()),
        })
}

// Writes metadata.json and, when a formatter is present, layer.json. These
// files are optional, so failures are only logged.
pub fn export_sidecars<D: TileDir>(dir: &D, rows: &[(String, String)]) {
    match store(dir, METADATA_FILE, &metadata_doc(rows)) {
        Ok(()) => tracing::info!("{} dumped", METADATA_FILE),
        Err(e) => tracing::warn!("skipping {}: {:#}", METADATA_FILE, e),
    }
    if let Some(layer) = layer_config(rows) {
        match store(dir, LAYER_FILE, &layer) {
            Ok(()) => tracing::info!("{} dumped", LAYER_FILE),
            Err(e) => tracing::warn!("skipping {}: {:#}", LAYER_FILE, e),
        }
    }
}
