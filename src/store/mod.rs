use std::path::{Path, PathBuf};

use anyhow::Context;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};

use crate::{
    error::Error,
    grid::DecodedGrid,
    scheme::TileAddress,
};

// A tile as stored: MBTiles coordinates and the payload exactly as it was read
// from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRecord {
    pub address: TileAddress,
    pub data: Vec<u8>,
}

const SCHEMA: &str = "
    CREATE TABLE tiles (
        zoom_level integer,
        tile_column integer,
        tile_row integer,
        tile_data blob,
        CONSTRAINT tile_index UNIQUE (zoom_level, tile_column, tile_row)
    );
    CREATE TABLE metadata (
        name text,
        value text,
        CONSTRAINT name UNIQUE (name)
    );
    CREATE TABLE grids (
        zoom_level integer,
        tile_column integer,
        tile_row integer,
        grid blob,
        CONSTRAINT grid_index UNIQUE (zoom_level, tile_column, tile_row)
    );
    CREATE TABLE grid_data (
        zoom_level integer,
        tile_column integer,
        tile_row integer,
        key_name text,
        key_json text,
        CONSTRAINT grid_data_index UNIQUE (zoom_level, tile_column, tile_row, key_name)
    );
";

// The MBTiles file. This is the only handle to the database; everything that
// reads or writes it goes through here (or through `conn()` for compaction).
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(Error::Storage)
            .with_context(|| format!("opening {}", path.as_ref().display()))?;
        tracing::info!("connected to {}", path.as_ref().display());
        Ok(Store {
            conn,
            path: path.as_ref().to_owned(),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Ok(Store {
            conn: Connection::open_in_memory().map_err(Error::Storage)?,
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    // Settings for a bulk load by a single writer.
    pub fn optimize_connection(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch(
                "PRAGMA synchronous=0;
                 PRAGMA locking_mode=EXCLUSIVE;
                 PRAGMA journal_mode=DELETE;",
            )
            .map_err(Error::Storage)?;
        tracing::debug!("connection optimized");
        Ok(())
    }

    pub fn setup(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .map_err(Error::Storage)
            .context("creating schema")?;
        tracing::debug!("schema created");
        Ok(())
    }

    pub fn transaction(&self) -> anyhow::Result<Transaction<'_>> {
        Ok(self.conn.unchecked_transaction().map_err(Error::Storage)?)
    }

    pub fn has_table(&self, name: &str) -> anyhow::Result<bool> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE name = ?1 AND type IN ('table', 'view')",
                [name],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::Storage)?;
        Ok(found.is_some())
    }

    pub fn insert_metadata(&self, name: &str, value: &str) -> anyhow::Result<()> {
        self.conn
            .prepare_cached("INSERT INTO metadata (name, value) VALUES (?1, ?2)")
            .and_then(|mut stmt| stmt.execute(params![name, value]))
            .map_err(Error::Storage)
            .with_context(|| format!("inserting metadata {:?}", name))?;
        Ok(())
    }

    pub fn metadata(&self) -> anyhow::Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, value FROM metadata")
            .map_err(Error::Storage)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(Error::Storage)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(Error::Storage)?);
        }
        Ok(out)
    }

    pub fn insert_tile(&self, address: TileAddress, data: &[u8]) -> anyhow::Result<()> {
        tracing::debug!("read tile {}", address);
        self.conn
            .prepare_cached(
                "INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .and_then(|mut stmt| {
                stmt.execute(params![address.zoom, address.column, address.row, data])
            })
            .map_err(|e| conflict_or_storage(e, address))?;
        Ok(())
    }

    pub fn insert_grid(&self, grid: &DecodedGrid) -> anyhow::Result<()> {
        let address = grid.record.address;
        tracing::debug!("read grid {}", address);
        self.conn
            .prepare_cached(
                "INSERT INTO grids (zoom_level, tile_column, tile_row, grid)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .and_then(|mut stmt| {
                stmt.execute(params![
                    address.zoom,
                    address.column,
                    address.row,
                    grid.record.grid
                ])
            })
            .map_err(|e| conflict_or_storage(e, address))?;

        let mut stmt = self
            .conn
            .prepare_cached(
                "INSERT INTO grid_data (zoom_level, tile_column, tile_row, key_name, key_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .map_err(Error::Storage)?;
        for row in &grid.rows {
            stmt.execute(params![
                address.zoom,
                address.column,
                address.row,
                row.key_name,
                row.key_json
            ])
            .map_err(|e| conflict_or_storage(e, address))?;
        }
        Ok(())
    }

    pub fn count_tiles(&self) -> anyhow::Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT count(*) FROM tiles", [], |row| row.get(0))
            .map_err(Error::Storage)?;
        Ok(n as u64)
    }

    pub fn tile(&self, address: TileAddress) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self
            .conn
            .query_row(
                "SELECT tile_data FROM tiles
                 WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
                params![address.zoom, address.column, address.row],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::Storage)?)
    }

    // Streams every tile through `f` without loading the table. Works on the
    // plain table and on the view left behind by compaction.
    pub fn for_each_tile<F>(&self, mut f: F) -> anyhow::Result<()>
    where
        F: FnMut(TileRecord) -> anyhow::Result<()>,
    {
        let mut stmt = self
            .conn
            .prepare("SELECT zoom_level, tile_column, tile_row, tile_data FROM tiles")
            .map_err(Error::Storage)?;
        let mut rows = stmt.query([]).map_err(Error::Storage)?;
        while let Some(row) = rows.next().map_err(Error::Storage)? {
            let tile = TileRecord {
                address: TileAddress::new(
                    row.get(0).map_err(Error::Storage)?,
                    row.get(1).map_err(Error::Storage)?,
                    row.get(2).map_err(Error::Storage)?,
                ),
                data: row.get(3).map_err(Error::Storage)?,
            };
            f(tile)?;
        }
        Ok(())
    }

    pub fn for_each_grid<F>(&self, mut f: F) -> anyhow::Result<()>
    where
        F: FnMut(TileAddress, Vec<u8>) -> anyhow::Result<()>,
    {
        let mut stmt = self
            .conn
            .prepare("SELECT zoom_level, tile_column, tile_row, grid FROM grids")
            .map_err(Error::Storage)?;
        let mut rows = stmt.query([]).map_err(Error::Storage)?;
        while let Some(row) = rows.next().map_err(Error::Storage)? {
            let address = TileAddress::new(
                row.get(0).map_err(Error::Storage)?,
                row.get(1).map_err(Error::Storage)?,
                row.get(2).map_err(Error::Storage)?,
            );
            f(address, row.get(3).map_err(Error::Storage)?)?;
        }
        Ok(())
    }

    pub fn grid_data(&self, address: TileAddress) -> anyhow::Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT key_name, key_json FROM grid_data
                 WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
            )
            .map_err(Error::Storage)?;
        let rows = stmt
            .query_map(params![address.zoom, address.column, address.row], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .map_err(Error::Storage)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(Error::Storage)?);
        }
        Ok(out)
    }

    // Refreshes statistics, reclaims free pages and closes the file.
    pub fn finalize(self) -> anyhow::Result<()> {
        self.conn
            .execute_batch("ANALYZE;")
            .map_err(Error::Storage)?;
        tracing::debug!("analyzed db");
        self.conn.execute_batch("VACUUM;").map_err(Error::Storage)?;
        tracing::debug!("cleaned db");
        self.conn.close().map_err(|(_, e)| Error::Storage(e))?;
        Ok(())
    }
}

fn conflict_or_storage(e: rusqlite::Error, address: TileAddress) -> Error {
    match e {
        rusqlite::Error::SqliteFailure(ref err, _) if err.code == ErrorCode::ConstraintViolation => {
            Error::Conflict(address)
        }
        e => Error::Storage(e),
    }
}

#[cfg(test)]
mod test {
    use super::{Store, TileRecord};
    use crate::{
        error::{classify, Error},
        grid,
        scheme::TileAddress,
    };

    fn fresh() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.setup().unwrap();
        store
    }

    #[test]
    fn duplicate_tile_conflicts() {
        let store = fresh();
        let a = TileAddress::new(3, 2, 1);
        store.insert_tile(a, b"first").unwrap();
        let err = store.insert_tile(a, b"second").unwrap_err();
        assert!(matches!(classify(&err), Some(Error::Conflict(got)) if *got == a));
        assert_eq!(Some(b"first".to_vec()), store.tile(a).unwrap());
    }

    #[test]
    fn duplicate_grid_conflicts() {
        let store = fresh();
        let a = TileAddress::new(0, 0, 0);
        let doc = r#"{"grid":[" !"],"keys":["","1"],"data":{"1":{"n":1}}}"#;
        let decoded = grid::decode(a, doc.as_bytes()).unwrap();
        store.insert_grid(&decoded).unwrap();
        let err = store.insert_grid(&decoded).unwrap_err();
        assert!(matches!(classify(&err), Some(Error::Conflict(_))));
        assert_eq!(
            vec![("1".to_owned(), r#"{"n":1}"#.to_owned())],
            store.grid_data(a).unwrap()
        );
    }

    #[test]
    fn streams_tiles() {
        let store = fresh();
        for i in 0..10_u32 {
            store
                .insert_tile(TileAddress::new(4, i, 15 - i), &i.to_le_bytes())
                .unwrap();
        }
        let mut seen = Vec::new();
        store
            .for_each_tile(|t| {
                seen.push(t);
                Ok(())
            })
            .unwrap();
        seen.sort_by_key(|t| t.address);
        assert_eq!(10, seen.len());
        assert_eq!(
            TileRecord {
                address: TileAddress::new(4, 3, 12),
                data: 3_u32.to_le_bytes().to_vec(),
            },
            seen[3]
        );
        assert_eq!(10, store.count_tiles().unwrap());
    }

    #[test]
    fn metadata_names_are_unique() {
        let store = fresh();
        store.insert_metadata("name", "a").unwrap();
        assert!(store.insert_metadata("name", "b").is_err());
        assert_eq!(vec![("name".to_owned(), "a".to_owned())], store.metadata().unwrap());
    }
}
