use std::{fmt, str::FromStr};

use anyhow::bail;

use crate::{compact::DEFAULT_CHUNK_SIZE, error::Error, scheme::Scheme};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileFormat {
    #[default]
    Png,
    Jpg,
    Jpeg,
    Webp,
    Pbf,
}

impl TileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TileFormat::Png => "png",
            TileFormat::Jpg => "jpg",
            TileFormat::Jpeg => "jpeg",
            TileFormat::Webp => "webp",
            TileFormat::Pbf => "pbf",
        }
    }
}

impl fmt::Display for TileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for TileFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(TileFormat::Png),
            "jpg" => Ok(TileFormat::Jpg),
            "jpeg" => Ok(TileFormat::Jpeg),
            "webp" => Ok(TileFormat::Webp),
            "pbf" => Ok(TileFormat::Pbf),
            _ => Err(Error::config(format!("unknown tile format {:?}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Import,
    Export,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub scheme: Scheme,
    pub format: TileFormat,
    // Run compaction after an import.
    pub compress: bool,
    pub chunk_size: usize,
    // Wrap exported grids in `name(...);`.
    pub grid_callback: Option<String>,
    // Reader threads on import, writer threads on export.
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            scheme: Scheme::Tms,
            format: TileFormat::Png,
            compress: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            grid_callback: None,
            workers: 4,
        }
    }
}

impl Config {
    // Everything that can be rejected without touching the disk.
    pub fn validate(&self, direction: Direction) -> anyhow::Result<()> {
        if direction == Direction::Export && !self.scheme.exportable() {
            bail!(Error::config(format!("cannot export with the {} scheme", self.scheme)));
        }
        if direction == Direction::Import && self.compress && self.chunk_size == 0 {
            bail!(Error::config("compaction chunk size must be positive"));
        }
        if self.workers == 0 {
            bail!(Error::config("at least one worker is required"));
        }
        if let Some(name) = &self.grid_callback {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '.');
            if !valid {
                bail!(Error::config(format!("{:?} is not a callback name", name)));
            }
        }
        Ok(())
    }

    pub(crate) fn queue_depth(&self) -> usize {
        self.workers * 16
    }
}
