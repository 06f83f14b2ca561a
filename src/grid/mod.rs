use std::{
    collections::HashMap,
    io::{Read, Write},
};

use anyhow::bail;
use flate2::{
    read::{GzDecoder, ZlibDecoder},
    write::ZlibEncoder,
    Compression,
};
use serde_json::{Map, Value};

use crate::{error::Error, scheme::TileAddress};

// Interactivity grids (UTFGrid). On disk a grid is a single JSON document:
//
//   {"grid": [...], "keys": ["", "12", "40"], "data": {"12": {...}, "40": {...}}}
//
// optionally wrapped in a JSONP callback, `grid({...});`. In the store the
// document minus its `data` member is compressed into `grids.grid`, and every
// non-empty key gets a `grid_data` row holding the JSON text of its feature
// properties. `keys` is the only record of which rows belong together and in
// what order, so decoding and encoding both check that keys and data agree.

pub const GRID_EXT: &str = "grid.json";

#[derive(Debug, Clone, PartialEq)]
pub struct GridRecord {
    pub address: TileAddress,
    pub keys: Vec<String>,
    // Compressed document without `data`.
    pub grid: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridDataRow {
    pub address: TileAddress,
    pub key_name: String,
    pub key_json: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedGrid {
    pub record: GridRecord,
    pub rows: Vec<GridDataRow>,
}

pub fn compress(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

// Accepts zlib, which is what MBTiles specifies, and gzip, which some writers
// produce instead.
pub fn decompress(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    let res = if data.starts_with(&[0x1f, 0x8b]) {
        GzDecoder::new(data).read_to_end(&mut out)
    } else {
        ZlibDecoder::new(data).read_to_end(&mut out)
    };
    if let Err(e) = res {
        bail!(Error::grid(format!("cannot decompress grid: {}", e)));
    }
    Ok(out)
}

// Returns the JSON document inside an optional `name(...)` wrapper. The
// closing parenthesis is found by scanning for the one that balances the
// opening one, skipping over JSON strings.
pub fn strip_callback(text: &str) -> anyhow::Result<&str> {
    let t = text.trim();
    if t.starts_with('{') {
        return Ok(t);
    }

    let ident_len = t
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '.'))
        .unwrap_or(t.len());
    if ident_len == 0 {
        bail!(Error::grid("document is neither a JSON object nor a callback"));
    }
    let body = match t[ident_len..].trim_start().strip_prefix('(') {
        Some(body) => body,
        None => bail!(Error::grid(format!(
            "expected '(' after callback {:?}",
            &t[..ident_len]
        ))),
    };

    let mut depth = 1;
    let mut in_str = false;
    let mut escaped = false;
    let mut end = None;
    for (i, c) in body.char_indices() {
        if in_str {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_str = false;
            }
            continue;
        }
        match c {
            '"' => in_str = true,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }

    let end = match end {
        Some(end) => end,
        None => bail!(Error::grid("unbalanced parentheses in callback")),
    };
    let tail = body[end + 1..].trim();
    if !tail.is_empty() && tail != ";" {
        bail!(Error::grid(format!("unexpected {:?} after callback", tail)));
    }
    let inner = body[..end].trim();
    if inner.starts_with('{') {
        Ok(inner)
    } else if inner.is_empty() {
        bail!(Error::grid("callback has no document"))
    } else {
        bail!(Error::grid("nested callbacks are not supported"))
    }
}

// Splits a grid file into what the store keeps. Fails with MalformedGrid when
// the document can't be read or when `keys` and `data` disagree.
pub fn decode(address: TileAddress, content: &[u8]) -> anyhow::Result<DecodedGrid> {
    let text = match std::str::from_utf8(content) {
        Ok(text) => text,
        Err(e) => bail!(Error::grid(format!("grid {} is not UTF-8: {}", address, e))),
    };
    let mut doc: Map<String, Value> = match serde_json::from_str(strip_callback(text)?) {
        Ok(doc) => doc,
        Err(e) => bail!(Error::grid(format!("grid {}: {}", address, e))),
    };

    let mut data = match doc.remove("data") {
        Some(Value::Object(data)) => data,
        // The dictionary may also come as the last element of an array.
        Some(Value::Array(mut items)) => match items.pop() {
            Some(Value::Object(data)) => data,
            None => Map::new(),
            Some(_) => bail!(Error::grid(format!(
                "grid {}: last data element is not an object",
                address
            ))),
        },
        Some(Value::Null) | None => Map::new(),
        Some(_) => bail!(Error::grid(format!("grid {}: data is not an object", address))),
    };
    let keys = keys_of(address, &doc)?;

    let mut rows = Vec::new();
    for key in keys.iter().filter(|k| !k.is_empty()) {
        let value = match data.remove(key) {
            Some(value) => value,
            None => bail!(Error::grid(format!("grid {}: no data for key {:?}", address, key))),
        };
        rows.push(GridDataRow {
            address,
            key_name: key.clone(),
            key_json: value.to_string(),
        });
    }
    if let Some(extra) = data.keys().next() {
        bail!(Error::grid(format!(
            "grid {}: data for {:?} is not listed in keys",
            address, extra
        )));
    }

    let grid = compress(serde_json::to_string(&doc)?.as_bytes())?;
    Ok(DecodedGrid {
        record: GridRecord {
            address,
            keys,
            grid,
        },
        rows,
    })
}

// Rebuilds the grid file for `address` from its stored blob and grid_data
// rows, wrapping it in `callback(...);` when a callback name is given.
pub fn encode(
    address: TileAddress,
    stored: &[u8],
    rows: Vec<(String, String)>,
    callback: Option<&str>,
) -> anyhow::Result<String> {
    let mut doc: Map<String, Value> = match serde_json::from_slice(&decompress(stored)?) {
        Ok(doc) => doc,
        Err(e) => bail!(Error::grid(format!("stored grid {}: {}", address, e))),
    };
    let keys = keys_of(address, &doc)?;

    let mut by_name: HashMap<String, String> = rows.into_iter().collect();
    let mut data = Map::new();
    for key in keys.iter().filter(|k| !k.is_empty()) {
        let json = match by_name.remove(key) {
            Some(json) => json,
            None => bail!(Error::grid(format!(
                "grid {}: no grid_data row for key {:?}",
                address, key
            ))),
        };
        let value: Value = match serde_json::from_str(&json) {
            Ok(v) => v,
            Err(e) => bail!(Error::grid(format!("grid {} key {:?}: {}", address, key, e))),
        };
        data.insert(key.clone(), value);
    }
    if let Some(extra) = by_name.keys().next() {
        bail!(Error::grid(format!(
            "grid {}: grid_data row {:?} is not listed in keys",
            address, extra
        )));
    }
    doc.insert("data".to_owned(), Value::Object(data));

    let json = serde_json::to_string(&doc)?;
    Ok(match callback {
        Some(name) => format!("{}({});", name, json),
        None => json,
    })
}

fn keys_of(address: TileAddress, doc: &Map<String, Value>) -> anyhow::Result<Vec<String>> {
    let keys = match doc.get("keys") {
        Some(Value::Array(keys)) => keys,
        _ => bail!(Error::grid(format!("grid {} has no keys array", address))),
    };
    keys.iter()
        .map(|k| match k {
            Value::String(s) => Ok(s.clone()),
            other => Err(Error::grid(format!("grid {}: key {} is not a string", address, other)).into()),
        })
        .collect()
}
