use std::{
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use anyhow::{anyhow, bail, Context as _};

use crate::{
    error::{classify, Error},
    fs::TileDir,
    grid::{self, GRID_EXT},
    pipeline::{config::Config, Context},
    scheme,
    sidecar,
    store::Store,
};


// One file for the writer pool.
#[derive(Debug)]
struct Job {
    dir: PathBuf,
    file: PathBuf,
    data: Vec<u8>,
}

// Runs `produce` on the calling thread while `config.workers` threads write
// whatever it sends. Returns the number of files written, or the first error
// from either side; a writer error stops the producer at its next send.
fn with_writers<D, F>(dir: &D, config: &Config, produce: F) -> anyhow::Result<u64>
where
    D: TileDir,
    F: FnOnce(&mut dyn FnMut(Job) -> anyhow::Result<()>) -> anyhow::Result<()>,
{
    let failed = AtomicBool::new(false);
    thread::scope(|s| {
        let (tx, rx) = crossbeam_channel::bounded::<Job>(config.queue_depth());
        let failed = &failed;
        let handles: Vec<_> = (0..config.workers)
            .map(|_| {
                let rx = rx.clone();
                s.spawn(move || -> anyhow::Result<u64> {
                    let mut written = 0;
                    for job in rx {
                        let res = dir
                            .ensure_dir(&job.dir)
                            .and_then(|()| dir.write(&job.file, &job.data))
                            .with_context(|| format!("writing {}", job.file.display()));
                        if let Err(e) = res {
                            failed.store(true, Ordering::SeqCst);
                            return Err(e);
                        }
                        written += 1;
                    }
                    Ok(written)
                })
            })
            .collect();
        drop(rx);

        let mut send = |job: Job| -> anyhow::Result<()> {
            if failed.load(Ordering::SeqCst) {
                bail!("export stopped after a write failure");
            }
            tx.send(job).map_err(|_| anyhow!("all tile writers have stopped"))
        };
        let produced = produce(&mut send);
        drop(tx);

        let mut written = 0;
        let mut first_err = None;
        for h in handles {
            match h.join() {
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(_) => {
                    first_err.get_or_insert(anyhow!("tile writer panicked"));
                }
            }
        }
        // The writer's error is the cause of any producer failure.
        if let Some(e) = first_err {
            return Err(e);
        }
        produced?;
        Ok(written)
    })
}

pub fn export_tiles<D: TileDir>(store: &Store, dir: &D, ctx: &mut Context) -> anyhow::Result<u64> {
    let scheme = ctx.config.scheme;
    let ext = ctx.config.format.extension();
    let written = with_writers(dir, &ctx.config, |send| {
        store.for_each_tile(|tile| {
            let path = scheme::to_path(scheme, tile.address)?;
            tracing::debug!("write tile {} to {}", tile.address, path.file(ext).display());
            send(Job {
                dir: path.dir(),
                file: path.file(ext),
                data: tile.data,
            })
        })
    })?;
    ctx.stats.tiles += written;
    tracing::info!("{} tiles exported", written);
    Ok(written)
}

// Writes `<row>.grid.json` next to each tile. Grids whose stored rows don't
// line up with their keys are reported and skipped.
pub fn export_grids<D: TileDir>(store: &Store, dir: &D, ctx: &mut Context) -> anyhow::Result<u64> {
    if !store.has_table("grids")? {
        tracing::info!("no grids to export");
        return Ok(0);
    }
    let scheme = ctx.config.scheme;
    let callback = ctx.config.grid_callback.clone();
    let mut malformed = 0;
    let written = with_writers(dir, &ctx.config, |send| {
        store.for_each_grid(|address, blob| {
            let rows = store.grid_data(address)?;
            let text = match grid::encode(address, &blob, rows, callback.as_deref()) {
                Ok(text) => text,
                Err(e) => match classify(&e) {
                    Some(Error::MalformedGrid(_)) => {
                        tracing::warn!("skipping grid {}: {:#}", address, e);
                        malformed += 1;
                        return Ok(());
                    }
                    _ => return Err(e),
                },
            };
            let path = scheme::to_path(scheme, address)?;
            send(Job {
                dir: path.dir(),
                file: path.file(GRID_EXT),
                data: text.into_bytes(),
            })
        })
    })?;
    ctx.stats.grids += written;
    ctx.stats.malformed_grids += malformed;
    tracing::info!("{} grids exported", written);
    Ok(written)
}

// Sidecars first (best effort), then tiles, then grids. The first fatal error
// ends the export.
pub fn export<D: TileDir>(store: &Store, dir: &D, ctx: &mut Context) -> anyhow::Result<()> {
    let metadata = match store.metadata() {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!("metadata unavailable: {:#}", e);
            Vec::new()
        }
    };
    ctx.stats.metadata += metadata.len() as u64;
    sidecar::export_sidecars(dir, &metadata);
    export_tiles(store, dir, ctx).context("exporting tiles")?;
    export_grids(store, dir, ctx).context("exporting grids")?;
    Ok(())
}
