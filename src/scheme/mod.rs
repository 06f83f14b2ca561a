use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::bail;

use crate::error::Error;

#[cfg(test)]
mod translate_test;

// Zooms above this can't be flipped without leaving u32.
pub const MAX_ZOOM: u8 = 31;

// wms splits each axis into three 3-digit groups.
const WMS_LIMIT: u32 = 1_000_000_000;

// Storage-native tile coordinates. The row axis has its origin at the bottom
// left, which is what MBTiles stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileAddress {
    pub zoom: u8,
    pub column: u32,
    pub row: u32,
}

impl TileAddress {
    pub fn new(zoom: u8, column: u32, row: u32) -> Self {
        TileAddress { zoom, column, row }
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.column, self.row)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    #[default]
    Tms,
    Xyz,
    Wms,
    // ArcGIS cache layout, only ever read.
    Ags,
}

impl Scheme {
    // Number of path segments (directories plus the file stem) a tile path
    // has under this scheme.
    pub fn segments(&self) -> usize {
        match self {
            Scheme::Wms => 7,
            Scheme::Tms | Scheme::Xyz | Scheme::Ags => 3,
        }
    }

    pub fn exportable(&self) -> bool {
        !matches!(self, Scheme::Ags)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Scheme::Tms => "tms",
            Scheme::Xyz => "xyz",
            Scheme::Wms => "wms",
            Scheme::Ags => "ags",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tms" => Ok(Scheme::Tms),
            "xyz" => Ok(Scheme::Xyz),
            "wms" => Ok(Scheme::Wms),
            "ags" => Ok(Scheme::Ags),
            _ => Err(Error::config(format!("unknown scheme {:?}", s))),
        }
    }
}

// Where a tile lives relative to the export root: some directories and a file
// stem. The extension is added by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePath {
    pub dirs: Vec<String>,
    pub stem: String,
}

impl TilePath {
    pub fn dir(&self) -> PathBuf {
        self.dirs.iter().collect()
    }

    pub fn file(&self, ext: &str) -> PathBuf {
        self.dir().join(format!("{}.{}", self.stem, ext))
    }
}

impl fmt::Display for TilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in &self.dirs {
            write!(f, "{}/", d)?;
        }
        f.write_str(&self.stem)
    }
}

// 2^zoom - 1 - row. Applying it twice gives back the row.
pub fn flip_y(zoom: u8, row: u32) -> anyhow::Result<u32> {
    if zoom > MAX_ZOOM {
        bail!(Error::structural(
            format!("{}/?/{}", zoom, row),
            format!("zoom {} is above {}", zoom, MAX_ZOOM)
        ));
    }
    let max_row = (1_u64 << zoom) - 1;
    if u64::from(row) > max_row {
        bail!(Error::structural(
            format!("{}/?/{}", zoom, row),
            format!("row {} is outside 0..={} for zoom {}", row, max_row, zoom)
        ));
    }
    Ok((max_row - u64::from(row)) as u32)
}

pub fn to_path(scheme: Scheme, addr: TileAddress) -> anyhow::Result<TilePath> {
    match scheme {
        Scheme::Tms => Ok(TilePath {
            dirs: vec![addr.zoom.to_string(), addr.column.to_string()],
            stem: addr.row.to_string(),
        }),
        Scheme::Xyz => Ok(TilePath {
            dirs: vec![addr.zoom.to_string(), addr.column.to_string()],
            stem: flip_y(addr.zoom, addr.row)?.to_string(),
        }),
        Scheme::Wms => {
            if addr.column >= WMS_LIMIT || addr.row >= WMS_LIMIT {
                bail!(Error::structural(addr, "wms paths hold at most 9 digits per axis"));
            }
            let (x, y) = (addr.column, addr.row);
            Ok(TilePath {
                dirs: vec![
                    format!("{:02}", addr.zoom),
                    format!("{:03}", x / 1_000_000),
                    format!("{:03}", x / 1_000 % 1_000),
                    format!("{:03}", x % 1_000),
                    format!("{:03}", y / 1_000_000),
                    format!("{:03}", y / 1_000 % 1_000),
                ],
                stem: format!("{:03}", y % 1_000),
            })
        }
        Scheme::Ags => bail!(Error::config("the ags scheme can only be imported")),
    }
}

// Inverse of to_path. `segments` is the relative path with the extension
// already stripped from the last element.
pub fn from_path<S: AsRef<str>>(scheme: Scheme, segments: &[S]) -> anyhow::Result<TileAddress> {
    let segs: Vec<&str> = segments.iter().map(|s| s.as_ref()).collect();
    let joined = segs.join("/");
    if segs.len() != scheme.segments() {
        bail!(Error::structural(
            &joined,
            format!(
                "expected {} segments for {}, found {}",
                scheme.segments(),
                scheme,
                segs.len()
            )
        ));
    }

    let zoom = parse_zoom(&joined, segs[0])?;
    match scheme {
        Scheme::Tms => Ok(TileAddress::new(
            zoom,
            parse_dec(&joined, "column", segs[1])?,
            parse_dec(&joined, "row", segs[2])?,
        )),
        Scheme::Xyz => {
            let row = parse_dec(&joined, "row", segs[2])?;
            let row = flip_y(zoom, row).map_err(|_| {
                Error::structural(&joined, format!("row {} does not exist at zoom {}", row, zoom))
            })?;
            Ok(TileAddress::new(zoom, parse_dec(&joined, "column", segs[1])?, row))
        }
        Scheme::Wms => {
            let mut groups = [0_u32; 6];
            for (g, s) in groups.iter_mut().zip(&segs[1..]) {
                *g = parse_dec(&joined, "group", s)?;
                if *g >= 1_000 {
                    bail!(Error::structural(&joined, format!("group {:?} is above 999", s)));
                }
            }
            Ok(TileAddress::new(
                zoom,
                groups[0] * 1_000_000 + groups[1] * 1_000 + groups[2],
                groups[3] * 1_000_000 + groups[4] * 1_000 + groups[5],
            ))
        }
        Scheme::Ags => {
            let hex = match segs[1].strip_prefix('C') {
                Some(hex) if !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) => hex,
                _ => bail!(Error::structural(
                    &joined,
                    format!("column {:?} is not of the form C<hex>", segs[1])
                )),
            };
            let column = u32::from_str_radix(hex, 16)
                .map_err(|e| Error::structural(&joined, format!("column {:?}: {}", segs[1], e)))?;
            Ok(TileAddress::new(zoom, column, parse_dec(&joined, "row", segs[2])?))
        }
    }
}

// Splits a relative tile file path into coordinate segments and the file's
// extension. The file name splits at its first dot, so `3.grid.json` yields
// stem `3` and extension `grid.json`.
pub fn split_path(rel: &Path) -> anyhow::Result<(Vec<String>, String)> {
    let mut segs = Vec::new();
    for part in rel.iter() {
        match part.to_str() {
            Some(s) => segs.push(s.to_owned()),
            None => bail!(Error::structural(rel.display(), "path is not valid UTF-8")),
        }
    }
    let file = match segs.pop() {
        Some(f) => f,
        None => bail!(Error::structural(rel.display(), "empty path")),
    };
    let (stem, ext) = file.split_once('.').unwrap_or((file.as_str(), ""));
    segs.push(stem.to_owned());
    Ok((segs, ext.to_owned()))
}

fn parse_zoom(path: &str, s: &str) -> anyhow::Result<u8> {
    let zoom = parse_dec(path, "zoom", s)?;
    if zoom > u32::from(u8::MAX) {
        bail!(Error::structural(path, format!("zoom {} is too large", zoom)));
    }
    Ok(zoom as u8)
}

fn parse_dec(path: &str, what: &str, s: &str) -> anyhow::Result<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        bail!(Error::structural(
            path,
            format!("{} {:?} is not a decimal number", what, s)
        ));
    }
    s.parse::<u32>()
        .map_err(|_| Error::structural(path, format!("{} {:?} is out of range", what, s)).into())
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use rand::Rng;

    use super::{flip_y, from_path, split_path, to_path, Scheme, TileAddress};
    use crate::error::{classify, Error};

    #[test]
    fn flip_is_involutive() {
        for zoom in 0..=12_u8 {
            for row in 0..(1_u32 << zoom) {
                assert_eq!(row, flip_y(zoom, flip_y(zoom, row).unwrap()).unwrap());
            }
        }
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let zoom = rng.gen_range(13..=31_u8);
            let row = rng.gen_range(0..(1_u64 << zoom)) as u32;
            assert_eq!(row, flip_y(zoom, flip_y(zoom, row).unwrap()).unwrap());
        }
    }

    #[test]
    fn flip_rejects_out_of_range_rows() {
        assert!(flip_y(0, 1).is_err());
        assert!(flip_y(32, 0).is_err());
        assert_eq!(0, flip_y(0, 0).unwrap());
        assert_eq!(u32::MAX, flip_y(31, 0).unwrap() * 2 + 1);
    }

    #[test]
    fn inverse_law() {
        let mut rng = rand::thread_rng();
        for scheme in [Scheme::Tms, Scheme::Xyz, Scheme::Wms] {
            for _ in 0..2000 {
                let zoom = rng.gen_range(0..=29_u8);
                let side = 1_u64 << zoom;
                let addr = TileAddress::new(
                    zoom,
                    rng.gen_range(0..side) as u32,
                    rng.gen_range(0..side) as u32,
                );
                let path = to_path(scheme, addr).unwrap();
                let mut segs = path.dirs.clone();
                segs.push(path.stem.clone());
                assert_eq!(addr, from_path(scheme, &segs).unwrap(), "{} {}", scheme, path);
            }
        }
    }

    #[test]
    fn xyz_example() {
        let path = to_path(Scheme::Xyz, TileAddress::new(1, 0, 0)).unwrap();
        assert_eq!(Path::new("1/0/1.png"), path.file("png"));
    }

    #[test]
    fn schemes_parse() {
        assert_eq!(Scheme::Xyz, "XYZ".parse().unwrap());
        let err = "quadkey".parse::<Scheme>().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        let err = to_path(Scheme::Ags, TileAddress::new(0, 0, 0)).unwrap_err();
        assert!(matches!(classify(&err), Some(Error::Configuration(_))));
    }

    #[test]
    fn split_at_first_dot() {
        let (segs, ext) = split_path(Path::new("4/2/9.grid.json")).unwrap();
        assert_eq!(vec!["4", "2", "9"], segs);
        assert_eq!("grid.json", ext);
        let (segs, ext) = split_path(Path::new("metadata.json")).unwrap();
        assert_eq!(vec!["metadata"], segs);
        assert_eq!("json", ext);
    }
}
