use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use anyhow::{anyhow, bail, Context as _};
use crossbeam_channel::{Receiver, Sender};
use serde_json::{Map, Value};
use walkdir::WalkDir;

use crate::{
    error::{classify, Error},
    grid::{self, DecodedGrid, GRID_EXT},
    pipeline::{Context, TileFormat},
    scheme::{self, TileAddress},
    sidecar::{self, METADATA_FILE},
    store::Store,
};

// A file found by the walker, relative to the root and absolute.
#[derive(Debug)]
struct Found {
    rel: PathBuf,
    abs: PathBuf,
}

// What a reader hands to the inserter.
#[derive(Debug)]
enum Entry {
    Tile(TileAddress, Vec<u8>),
    Grid(DecodedGrid),
    MalformedGrid(PathBuf, anyhow::Error),
}

// Loads metadata.json into the metadata table. A `format` entry replaces the
// configured tile format. Having no metadata.json is fine.
pub fn load_metadata(store: &Store, root: &Path, ctx: &mut Context) -> anyhow::Result<()> {
    let doc: Map<String, Value> = match sidecar::load(root, METADATA_FILE)? {
        Some(doc) => doc,
        None => {
            tracing::warn!("{} not found", METADATA_FILE);
            return Ok(());
        }
    };
    let rows = sidecar::metadata_rows(doc);
    if let Some((_, format)) = rows.iter().find(|(k, _)| k == "format") {
        let format: TileFormat = format.parse()?;
        if format != ctx.config.format {
            tracing::info!("using format {} from {}", format, METADATA_FILE);
        }
        ctx.config.format = format;
    }
    for (name, value) in &rows {
        store.insert_metadata(name, value)?;
    }
    ctx.stats.metadata += rows.len() as u64;
    tracing::info!("metadata from {} restored", METADATA_FILE);
    Ok(())
}

fn wanted(name: &str, tile_ext: &str) -> bool {
    match name.split_once('.') {
        Some((_, ext)) => ext == tile_ext || ext == GRID_EXT,
        None => false,
    }
}

fn walk(
    root: &Path,
    depth: usize,
    tile_ext: &str,
    out: &Sender<anyhow::Result<Found>>,
    failed: &AtomicBool,
) {
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(depth)
        .sort_by_file_name();
    for entry in walker {
        if failed.load(Ordering::SeqCst) {
            return;
        }
        let item = match entry {
            Ok(entry) => {
                let name = entry.file_name().to_string_lossy();
                if !entry.file_type().is_file() || !wanted(&name, tile_ext) {
                    continue;
                }
                match entry.path().strip_prefix(root) {
                    Ok(rel) => Ok(Found {
                        rel: rel.to_owned(),
                        abs: entry.path().to_owned(),
                    }),
                    Err(e) => Err(anyhow!(e)),
                }
            }
            Err(e) => Err(anyhow!(e).context(format!("walking {}", root.display()))),
        };
        let stop = item.is_err();
        if out.send(item).is_err() || stop {
            return;
        }
    }
}

// Turns a found file into something the inserter can store. Coordinates that
// don't decode are fatal; grids that don't decode are passed on as malformed.
fn read(found: Found, ctx: &Context) -> anyhow::Result<Option<Entry>> {
    let (segs, ext) = scheme::split_path(&found.rel)?;
    let address = scheme::from_path(ctx.config.scheme, &segs)?;
    let content = fs::read(&found.abs)
        .map_err(Error::Io)
        .with_context(|| format!("reading {}", found.abs.display()))?;
    if ext == ctx.config.format.extension() {
        Ok(Some(Entry::Tile(address, content)))
    } else if ext == GRID_EXT {
        match grid::decode(address, &content) {
            Ok(decoded) => Ok(Some(Entry::Grid(decoded))),
            Err(e) => match classify(&e) {
                Some(Error::MalformedGrid(_)) => Ok(Some(Entry::MalformedGrid(found.rel, e))),
                _ => Err(e),
            },
        }
    } else {
        tracing::debug!("skipping {}", found.rel.display());
        Ok(None)
    }
}

fn insert_all(
    store: &Store,
    entries: Receiver<anyhow::Result<Entry>>,
    ctx: &mut Context,
) -> anyhow::Result<()> {
    for entry in entries {
        match entry? {
            Entry::Tile(address, content) => {
                store.insert_tile(address, &content)?;
                ctx.stats.tiles += 1;
            }
            Entry::Grid(decoded) => {
                store.insert_grid(&decoded)?;
                ctx.stats.grids += 1;
            }
            Entry::MalformedGrid(path, e) => {
                tracing::warn!("skipping grid {}: {:#}", path.display(), e);
                ctx.stats.malformed_grids += 1;
            }
        }
    }
    Ok(())
}

// Walks `root` and inserts every tile and grid found. One thread walks, a pool
// of readers loads and decodes files, and the calling thread owns all the
// inserts. Completion order is whatever the readers produce.
pub fn import_tiles(store: &Store, root: &Path, ctx: &mut Context) -> anyhow::Result<()> {
    let depth = ctx.config.scheme.segments();
    let tile_ext = ctx.config.format.extension();
    let workers = ctx.config.workers;
    let failed = AtomicBool::new(false);
    let reader_ctx = ctx.clone();

    let inserted = thread::scope(|s| {
        let (found_tx, found_rx) = crossbeam_channel::bounded(ctx.config.queue_depth());
        let (entry_tx, entry_rx) = crossbeam_channel::bounded(ctx.config.queue_depth());
        let failed = &failed;
        let reader_ctx = &reader_ctx;

        let walker = s.spawn(move || walk(root, depth, tile_ext, &found_tx, failed));
        let readers: Vec<_> = (0..workers)
            .map(|_| {
                let found_rx: Receiver<anyhow::Result<Found>> = found_rx.clone();
                let entry_tx: Sender<anyhow::Result<Entry>> = entry_tx.clone();
                s.spawn(move || {
                    for found in found_rx {
                        let entry = match found.and_then(|f| read(f, reader_ctx)) {
                            Ok(Some(entry)) => Ok(entry),
                            Ok(None) => continue,
                            Err(e) => {
                                failed.store(true, Ordering::SeqCst);
                                Err(e)
                            }
                        };
                        let stop = entry.is_err();
                        if entry_tx.send(entry).is_err() || stop {
                            return;
                        }
                    }
                })
            })
            .collect();
        drop(found_rx);
        drop(entry_tx);

        let inserted = insert_all(store, entry_rx, ctx);
        if inserted.is_err() {
            failed.store(true, Ordering::SeqCst);
        }

        let mut panicked = walker.join().is_err();
        for r in readers {
            panicked |= r.join().is_err();
        }
        if panicked {
            bail!("import worker panicked");
        }
        inserted
    });

    tracing::info!(
        "{} tiles, {} grids imported ({} malformed grids skipped)",
        ctx.stats.tiles,
        ctx.stats.grids,
        ctx.stats.malformed_grids
    );
    inserted
}

#[cfg(test)]
mod test {
    use std::{fs, path::Path};

    use super::{import_tiles, load_metadata};
    use crate::{
        error::{classify, Error},
        pipeline::{Config, Context, TileFormat},
        scheme::{Scheme, TileAddress},
        store::Store,
    };

    fn put(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    fn fresh() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.setup().unwrap();
        store
    }

    #[test]
    fn imports_tiles_and_grids() {
        let tmp = tempfile::tempdir().unwrap();
        put(tmp.path(), "1/0/0.png", b"a");
        put(tmp.path(), "1/1/0.png", b"b");
        put(tmp.path(), "1/1/0.grid.json", br#"grid({"grid":[" !"],"keys":["","7"],"data":{"7":{"n":7}}});"#);
        put(tmp.path(), "1/1/1.grid.json", br#"{"grid":[],"keys":["9"],"data":{}}"#);
        put(tmp.path(), "1/1/notes.txt", b"ignored");
        put(tmp.path(), "metadata.json", br#"{"name":"x"}"#);

        let store = fresh();
        let mut ctx = Context::new(Config::default());
        import_tiles(&store, tmp.path(), &mut ctx).unwrap();

        assert_eq!(2, ctx.stats.tiles);
        assert_eq!(1, ctx.stats.grids);
        assert_eq!(1, ctx.stats.malformed_grids);
        assert_eq!(Some(b"b".to_vec()), store.tile(TileAddress::new(1, 1, 0)).unwrap());
        assert_eq!(
            vec![("7".to_owned(), r#"{"n":7}"#.to_owned())],
            store.grid_data(TileAddress::new(1, 1, 0)).unwrap()
        );
    }

    #[test]
    fn xyz_rows_are_flipped() {
        let tmp = tempfile::tempdir().unwrap();
        put(tmp.path(), "2/3/0.png", b"top");
        let store = fresh();
        let mut ctx = Context::new(Config {
            scheme: Scheme::Xyz,
            ..Config::default()
        });
        import_tiles(&store, tmp.path(), &mut ctx).unwrap();
        assert_eq!(Some(b"top".to_vec()), store.tile(TileAddress::new(2, 3, 3)).unwrap());
    }

    #[test]
    fn ags_columns_are_hex() {
        let tmp = tempfile::tempdir().unwrap();
        put(tmp.path(), "5/C1f/12.jpg", b"ags");
        let store = fresh();
        let mut ctx = Context::new(Config {
            scheme: Scheme::Ags,
            format: TileFormat::Jpg,
            ..Config::default()
        });
        import_tiles(&store, tmp.path(), &mut ctx).unwrap();
        assert_eq!(Some(b"ags".to_vec()), store.tile(TileAddress::new(5, 31, 12)).unwrap());
    }

    #[test]
    fn bad_coordinates_are_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        put(tmp.path(), "1/0/0.png", b"a");
        put(tmp.path(), "1/zero/0.png", b"b");
        let store = fresh();
        let mut ctx = Context::new(Config::default());
        let err = import_tiles(&store, tmp.path(), &mut ctx).unwrap_err();
        assert!(matches!(classify(&err), Some(Error::Structural { .. })), "{:#}", err);

        let tmp = tempfile::tempdir().unwrap();
        put(tmp.path(), "1/0.png", b"shallow");
        let err = import_tiles(&fresh(), tmp.path(), &mut ctx).unwrap_err();
        assert!(matches!(classify(&err), Some(Error::Structural { .. })), "{:#}", err);
    }

    #[test]
    fn duplicate_coordinates_conflict() {
        // The second pass finds the same coordinates again.
        let tmp = tempfile::tempdir().unwrap();
        put(tmp.path(), "1/0/0.png", b"a");
        let store = fresh();
        let mut ctx = Context::new(Config::default());
        import_tiles(&store, tmp.path(), &mut ctx).unwrap();
        let err = import_tiles(&store, tmp.path(), &mut ctx).unwrap_err();
        assert!(matches!(classify(&err), Some(Error::Conflict(_))), "{:#}", err);
        assert_eq!(Some(b"a".to_vec()), store.tile(TileAddress::new(1, 0, 0)).unwrap());
    }

    #[test]
    fn metadata_format_overrides() {
        let tmp = tempfile::tempdir().unwrap();
        put(tmp.path(), "metadata.json", br#"{"format":"jpg","minzoom":0}"#);
        let store = fresh();
        let mut ctx = Context::new(Config::default());
        load_metadata(&store, tmp.path(), &mut ctx).unwrap();
        assert_eq!(TileFormat::Jpg, ctx.config.format);
        assert_eq!(2, ctx.stats.metadata);
        assert_eq!(
            vec![
                ("format".to_owned(), "jpg".to_owned()),
                ("minzoom".to_owned(), "0".to_owned())
            ],
            store.metadata().unwrap()
        );

        put(tmp.path(), "metadata.json", br#"{"format":"bmp"}"#);
        let err = load_metadata(&fresh(), tmp.path(), &mut ctx).unwrap_err();
        assert!(matches!(classify(&err), Some(Error::Configuration(_))));

        let empty = tempfile::tempdir().unwrap();
        load_metadata(&fresh(), empty.path(), &mut ctx).unwrap();
    }
}
