//! Converts between directory trees of map tiles and MBTiles files.
//!
//! `import_dir` walks a tree laid out in one of the supported schemes and
//! loads it into an MBTiles store, optionally deduplicating identical tiles.
//! `export_mbtiles` writes a store back out as a tree.

pub mod compact;
pub mod error;
pub mod export;
pub mod fs;
pub mod grid;
pub mod import;
pub mod pipeline;
pub mod scheme;
pub mod sidecar;
pub mod store;

pub use error::Error;
pub use pipeline::{export_mbtiles, import_dir, Config, Stats, TileFormat};
pub use scheme::{Scheme, TileAddress};
