use std::{path::PathBuf, process::ExitCode};

use clap::Parser;

use tilepack::{
    compact::DEFAULT_CHUNK_SIZE, export_mbtiles, import_dir, Config, Scheme, Stats, TileFormat,
};

/// Import a directory of map tiles into an MBTiles file, or export one back
/// out into a directory.
#[derive(Parser, Debug)]
#[command(name = "tilepack")]
struct Args {
    /// A tile directory to import, or an MBTiles file to export
    #[arg(long)]
    from: PathBuf,

    /// The MBTiles file (on import) or directory (on export) to write
    #[arg(long)]
    to: PathBuf,

    /// Tile file extension: png, jpg, jpeg, webp or pbf
    #[arg(long, default_value = "png")]
    format: String,

    /// Directory layout: tms, xyz, wms, or ags (import only)
    #[arg(long, default_value = "tms")]
    scheme: String,

    /// Deduplicate identical tiles after an import (the default)
    #[arg(long, overrides_with = "no_compress")]
    compress: bool,

    /// Keep one stored copy per tile
    #[arg(long, overrides_with = "compress")]
    no_compress: bool,

    /// Rows per compaction chunk
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Wrap exported grids in `<name>(...);`
    #[arg(long)]
    grid_callback: Option<String>,

    /// Reader threads on import, writer threads on export
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

impl Args {
    fn config(&self) -> anyhow::Result<Config> {
        Ok(Config {
            scheme: self.scheme.parse::<Scheme>()?,
            format: self.format.parse::<TileFormat>()?,
            compress: self.compress || !self.no_compress,
            chunk_size: self.chunk_size,
            grid_callback: self.grid_callback.clone(),
            workers: self.workers,
        })
    }
}

fn run(args: &Args) -> anyhow::Result<Stats> {
    let config = args.config()?;
    if args.from.is_dir() {
        import_dir(&args.from, &args.to, config)
    } else {
        export_mbtiles(&args.from, &args.to, config)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(stats) => {
            match serde_json::to_string(&stats) {
                Ok(summary) => println!("{}", summary),
                Err(e) => tracing::warn!("cannot print summary: {}", e),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
