use std::{io, path::Path, time::Instant};

use anyhow::Context as _;
use serde::Serialize;

use crate::{
    compact::Compactor,
    error::Error,
    export,
    fs::OsDir,
    import,
    store::Store,
};

pub mod config;


pub use config::{Config, Direction, TileFormat};

// Running totals for a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub tiles: u64,
    pub grids: u64,
    pub malformed_grids: u64,
    pub metadata: u64,
    // Distinct images left after compaction.
    pub blobs: u64,
}

// Everything a stage needs besides the store and the directory: the
// configuration (which the metadata stage may refine) and the totals so far.
#[derive(Debug, Default, Clone)]
pub struct Context {
    pub config: Config,
    pub stats: Stats,
}

impl Context {
    pub fn new(config: Config) -> Self {
        Context {
            config,
            stats: Stats::default(),
        }
    }
}

// Directory tree -> MBTiles. Stages run in order and the first failure ends
// the run: connect, prepare storage, load metadata, load tiles and grids,
// compact, finalize.
pub fn import_dir<P, Q>(src: P, mbtiles: Q, config: Config) -> anyhow::Result<Stats>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    config.validate(Direction::Import)?;
    let (src, mbtiles) = (src.as_ref(), mbtiles.as_ref());
    tracing::info!("import from directory {} --> {}", src.display(), mbtiles.display());
    let start = Instant::now();

    let mut ctx = Context::new(config);
    let store = Store::open(mbtiles)?;
    store.optimize_connection()?;
    store.setup()?;
    import::load_metadata(&store, src, &mut ctx).context("loading metadata")?;

    let tx = store.transaction()?;
    import::import_tiles(&store, src, &mut ctx).context("loading tiles")?;
    tx.commit().map_err(Error::Storage)?;

    if ctx.config.compress {
        let stats = Compactor::new(&store, ctx.config.chunk_size)?
            .run()
            .context("compacting")?;
        ctx.stats.blobs = stats.blobs;
    }
    store.finalize()?;

    tracing::info!("import done in {:?}: {:?}", start.elapsed(), ctx.stats);
    Ok(ctx.stats)
}

// MBTiles -> directory tree. An existing destination is written into.
pub fn export_mbtiles<P, Q>(mbtiles: P, dest: Q, config: Config) -> anyhow::Result<Stats>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    config.validate(Direction::Export)?;
    let (mbtiles, dest) = (mbtiles.as_ref(), dest.as_ref());
    tracing::info!("export from MBTiles {} --> {}", mbtiles.display(), dest.display());
    let start = Instant::now();

    // Opening a missing file would create an empty store.
    if !mbtiles.is_file() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} not found", mbtiles.display()),
        ))
        .into());
    }
    let mut ctx = Context::new(config);
    let store = Store::open(mbtiles)?;
    if dest.exists() {
        tracing::warn!("target directory {} already exists", dest.display());
    } else {
        std::fs::create_dir_all(dest)
            .map_err(Error::Io)
            .with_context(|| format!("creating {}", dest.display()))?;
    }
    export::export(&store, &OsDir::new(dest), &mut ctx)?;

    tracing::info!("export done in {:?}: {:?}", start.elapsed(), ctx.stats);
    Ok(ctx.stats)
}
