use std::collections::HashMap;

use anyhow::{bail, Context};
use rusqlite::params;
use uuid::Uuid;

use crate::{error::Error, scheme::TileAddress, store::Store};

// Compaction rewrites `tiles` into `images` (one row per distinct payload) and
// `map` (one row per coordinate pointing at an image), then replaces `tiles`
// with a view joining the two so readers can't tell the difference.
//
// Duplicates are only detected within a chunk of rows: the map from payload to
// image id is rebuilt for every chunk, which bounds memory by the chunk size
// at the cost of storing a payload once per chunk it appears in. Raising the
// chunk size trades memory for compression.
//
// There is no recovery if the process dies between dropping `tiles` and
// creating the indexes. Re-import from the source tree instead.

pub const DEFAULT_CHUNK_SIZE: usize = 256;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactStats {
    pub tiles: u64,
    pub blobs: u64,
    pub chunks: u64,
}

pub struct Compactor<'a> {
    store: &'a Store,
    chunk_size: usize,
}

impl<'a> Compactor<'a> {
    pub fn new(store: &'a Store, chunk_size: usize) -> anyhow::Result<Self> {
        if chunk_size == 0 {
            bail!(Error::config("compaction chunk size must be positive"));
        }
        Ok(Compactor { store, chunk_size })
    }

    pub fn run(self) -> anyhow::Result<CompactStats> {
        tracing::info!("prepare database compression");
        self.prepare()?;

        let total = self.store.count_tiles()?;
        tracing::info!("{} total tiles to fetch", total);

        let mut stats = CompactStats::default();
        let mut last_rowid = 0;
        while let Some((rowid, tiles, blobs)) = self.compact_chunk(last_rowid)? {
            last_rowid = rowid;
            stats.tiles += tiles;
            stats.blobs += blobs;
            stats.chunks += 1;
            tracing::debug!("{} / {} tiles compacted", stats.tiles, total);
        }

        tracing::info!("finalizing database compression");
        self.finish()?;
        Ok(stats)
    }

    fn prepare(&self) -> anyhow::Result<()> {
        if self.store.has_table("map")? {
            bail!(Error::config(format!(
                "{} is already compacted",
                self.store.path().display()
            )));
        }
        self.store
            .conn()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS images (
                    tile_data blob,
                    tile_id VARCHAR(256)
                );
                CREATE TABLE IF NOT EXISTS map (
                    zoom_level integer,
                    tile_column integer,
                    tile_row integer,
                    tile_id VARCHAR(256)
                );",
            )
            .map_err(Error::Storage)?;
        Ok(())
    }

    // Moves the rows after `after` (by rowid) into images/map. Returns the
    // last rowid handled with the number of tiles and new images, or None
    // once the table is exhausted.
    fn compact_chunk(&self, after: i64) -> anyhow::Result<Option<(i64, u64, u64)>> {
        let conn = self.store.conn();
        let chunk = {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT rowid, zoom_level, tile_column, tile_row, tile_data FROM tiles
                     WHERE rowid > ?1 ORDER BY rowid LIMIT ?2",
                )
                .map_err(Error::Storage)?;
            let rows = stmt
                .query_map(params![after, self.chunk_size as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        TileAddress::new(row.get(1)?, row.get(2)?, row.get(3)?),
                        row.get::<_, Vec<u8>>(4)?,
                    ))
                })
                .map_err(Error::Storage)?;
            let mut chunk = Vec::with_capacity(self.chunk_size);
            for row in rows {
                chunk.push(row.map_err(Error::Storage)?);
            }
            chunk
        };
        let last = match chunk.last() {
            Some((rowid, _, _)) => *rowid,
            None => return Ok(None),
        };

        let tx = self.store.transaction()?;
        let mut seen: HashMap<Vec<u8>, String> = HashMap::with_capacity(chunk.len());
        let mut tiles = 0;
        let mut blobs = 0;
        {
            let mut insert_image = tx
                .prepare_cached("INSERT INTO images (tile_id, tile_data) VALUES (?1, ?2)")
                .map_err(Error::Storage)?;
            let mut insert_map = tx
                .prepare_cached(
                    "INSERT INTO map (zoom_level, tile_column, tile_row, tile_id)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(Error::Storage)?;
            for (_, address, data) in chunk {
                let id = match seen.get(&data) {
                    Some(id) => id.clone(),
                    None => {
                        let id = Uuid::new_v4().to_string();
                        insert_image
                            .execute(params![id, data])
                            .map_err(Error::Storage)?;
                        blobs += 1;
                        seen.insert(data, id.clone());
                        id
                    }
                };
                insert_map
                    .execute(params![address.zoom, address.column, address.row, id])
                    .map_err(Error::Storage)
                    .with_context(|| format!("mapping tile {}", address))?;
                tiles += 1;
            }
        }
        tx.commit().map_err(Error::Storage)?;
        Ok(Some((last, tiles, blobs)))
    }

    fn finish(&self) -> anyhow::Result<()> {
        let conn = self.store.conn();
        conn.execute_batch(
            "DROP TABLE tiles;
             CREATE VIEW tiles AS
                SELECT map.zoom_level AS zoom_level, map.tile_column AS tile_column,
                map.tile_row AS tile_row, images.tile_data AS tile_data
                FROM map JOIN images ON images.tile_id = map.tile_id;
             CREATE UNIQUE INDEX map_index ON map (zoom_level, tile_column, tile_row);
             CREATE UNIQUE INDEX images_id ON images (tile_id);",
        )
        .map_err(Error::Storage)
        .context("replacing tiles with the compacted view")?;
        conn.execute_batch("VACUUM;").map_err(Error::Storage)?;
        conn.execute_batch("ANALYZE;").map_err(Error::Storage)?;
        Ok(())
    }
}

pub fn compact(store: &Store, chunk_size: usize) -> anyhow::Result<CompactStats> {
    Compactor::new(store, chunk_size)?.run()
}

#[cfg(test)]
mod test {
    use std::collections::{BTreeMap, HashSet};

    use rand::Rng;
    use rusqlite::params;

    use super::compact;
    use crate::{
        error::{classify, Error},
        scheme::TileAddress,
        store::Store,
    };

    fn store_with(tiles: &[(TileAddress, Vec<u8>)]) -> Store {
        let store = Store::open_in_memory().unwrap();
        store.setup().unwrap();
        for (a, data) in tiles {
            store.insert_tile(*a, data).unwrap();
        }
        store
    }

    fn blob_id(store: &Store, a: TileAddress) -> String {
        store
            .conn()
            .query_row(
                "SELECT tile_id FROM map WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
                params![a.zoom, a.column, a.row],
                |row| row.get(0),
            )
            .unwrap()
    }

    fn image_count(store: &Store) -> u64 {
        store
            .conn()
            .query_row("SELECT count(*) FROM images", [], |row| row.get::<_, i64>(0))
            .unwrap() as u64
    }

    #[test]
    fn ocean_tiles_share_one_image() {
        let ocean = b"blue".to_vec();
        let mut tiles: Vec<_> = (0..4)
            .map(|x| (TileAddress::new(2, x, 0), ocean.clone()))
            .collect();
        tiles.push((TileAddress::new(2, 0, 1), b"island".to_vec()));
        let store = store_with(&tiles);

        let stats = compact(&store, 256).unwrap();
        assert_eq!(5, stats.tiles);
        assert_eq!(2, stats.blobs);
        assert_eq!(2, image_count(&store));

        let id = blob_id(&store, TileAddress::new(2, 0, 0));
        for x in 1..4 {
            assert_eq!(id, blob_id(&store, TileAddress::new(2, x, 0)));
        }
        assert_ne!(id, blob_id(&store, TileAddress::new(2, 0, 1)));
        for (a, data) in &tiles {
            assert_eq!(Some(data.clone()), store.tile(*a).unwrap());
        }
    }

    #[test]
    fn dedup_is_chunk_local() {
        let tiles: Vec<_> = (0..6)
            .map(|x| (TileAddress::new(3, x, 0), b"same".to_vec()))
            .collect();
        let store = store_with(&tiles);
        let stats = compact(&store, 4).unwrap();
        assert_eq!(2, stats.chunks);
        // One image for rows 1-4, another for rows 5-6.
        assert_eq!(2, stats.blobs);
        assert_eq!(
            blob_id(&store, TileAddress::new(3, 0, 0)),
            blob_id(&store, TileAddress::new(3, 3, 0))
        );
        assert_ne!(
            blob_id(&store, TileAddress::new(3, 3, 0)),
            blob_id(&store, TileAddress::new(3, 4, 0))
        );
    }

    #[test]
    fn random_payloads_survive() {
        let mut rng = rand::thread_rng();
        let mut tiles = BTreeMap::new();
        for _ in 0..500 {
            let a = TileAddress::new(8, rng.gen_range(0..256), rng.gen_range(0..256));
            let payload = vec![rng.gen_range(0..8_u8); rng.gen_range(1..4)];
            tiles.insert(a, payload);
        }
        let tiles: Vec<_> = tiles.into_iter().collect();
        let chunk_size = rng.gen_range(1..64);
        let store = store_with(&tiles);

        // Rows are inserted in order, so rowid order is insertion order.
        let expected_blobs: usize = tiles
            .chunks(chunk_size)
            .map(|c| c.iter().map(|(_, d)| d).collect::<HashSet<_>>().len())
            .sum();

        let stats = compact(&store, chunk_size).unwrap();
        assert_eq!(tiles.len() as u64, stats.tiles);
        assert_eq!(expected_blobs as u64, stats.blobs);
        assert_eq!(expected_blobs as u64, image_count(&store));
        for (a, data) in &tiles {
            assert_eq!(Some(data.clone()), store.tile(*a).unwrap(), "{}", a);
        }
        assert_eq!(tiles.len() as u64, store.count_tiles().unwrap());
    }

    #[test]
    fn indexes_are_unique() {
        let store = store_with(&[(TileAddress::new(0, 0, 0), b"x".to_vec())]);
        compact(&store, 256).unwrap();
        let dup = store.conn().execute(
            "INSERT INTO map (zoom_level, tile_column, tile_row, tile_id) VALUES (0, 0, 0, 'y')",
            [],
        );
        assert!(dup.is_err());
        let dup = store.conn().execute(
            "INSERT INTO images (tile_id, tile_data) SELECT tile_id, tile_data FROM images",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn compacting_twice_is_refused() {
        let store = store_with(&[(TileAddress::new(0, 0, 0), b"x".to_vec())]);
        compact(&store, 256).unwrap();
        let err = compact(&store, 256).unwrap_err();
        assert!(matches!(classify(&err), Some(Error::Configuration(_))));
        let err = compact(&store, 0).unwrap_err();
        assert!(matches!(classify(&err), Some(Error::Configuration(_))));
    }
}
