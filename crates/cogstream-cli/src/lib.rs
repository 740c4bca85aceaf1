//! Command-line front end: `cogstream info` and `cogstream read`.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use cogstream_reader::{CogReader, ReaderConfig, ReaderError, TileErrorPolicy};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

/// Errors surfaced by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// Opening or reading the COG failed.
    #[error(transparent)]
    Reader(#[from] ReaderError),

    /// A local file could not be read or written.
    #[error("{}: {source}", path.display())]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("invalid configuration {}: {message}", path.display())]
    Config {
        /// Configuration file.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// JSON output failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Parser)]
#[command(name = "cogstream")]
#[command(author, version, about = "Range-read access to cloud-optimized GeoTIFFs")]
pub struct Cli {
    /// Reader configuration file (YAML, or JSON with a .json extension)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the resolution levels of a COG
    Info {
        /// Path or file://, http(s)://, s3://, gs:// or az:// URL
        location: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write the raw interleaved pixels of a region to a file
    Read {
        /// Path or file://, http(s)://, s3://, gs:// or az:// URL
        location: String,

        /// Resolution level, 0 being full resolution
        #[arg(short, long, default_value_t = 0)]
        level: u32,

        /// Left column of the region
        #[arg(short, long, default_value_t = 0)]
        x: u32,

        /// Top row of the region
        #[arg(short, long, default_value_t = 0)]
        y: u32,

        /// Region width (defaults to the rest of the level)
        #[arg(long)]
        width: Option<u32>,

        /// Region height (defaults to the rest of the level)
        #[arg(long)]
        height: Option<u32>,

        /// Keep every n-th column
        #[arg(long, default_value_t = 1)]
        subsample_x: u32,

        /// Keep every n-th row
        #[arg(long, default_value_t = 1)]
        subsample_y: u32,

        /// Leave failed tiles filled instead of aborting
        #[arg(long)]
        skip_failed: bool,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },
}

/// Summary of one resolution level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelSummary {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub tiles: u32,
    pub samples_per_pixel: u16,
    pub bits_per_sample: u16,
    pub compression: String,
    pub stripped: bool,
}

/// Summary of a COG's structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CogInfo {
    pub location: String,
    pub bigtiff: bool,
    pub byte_order: String,
    pub length: u64,
    pub levels: Vec<LevelSummary>,
}

/// Where and how a region read landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSummary {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: usize,
    pub skipped_tiles: usize,
    pub output: PathBuf,
}

/// Load a reader configuration, or the defaults when `path` is `None`.
pub fn load_config(path: Option<&Path>) -> Result<ReaderConfig, CliError> {
    let Some(path) = path else {
        return Ok(ReaderConfig::default());
    };
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed = if path.extension().is_some_and(|ext| ext == "json") {
        ReaderConfig::from_json(&text).map_err(|e| e.to_string())
    } else {
        ReaderConfig::from_yaml(&text).map_err(|e| e.to_string())
    };
    parsed.map_err(|message| CliError::Config {
        path: path.to_path_buf(),
        message,
    })
}

/// Describe the structure of the COG at `location`.
pub fn info(location: &str, config: ReaderConfig) -> Result<CogInfo, CliError> {
    let reader = CogReader::open(location, config)?;
    let structure = reader.structure()?;
    let mut levels = Vec::with_capacity(structure.num_levels());
    for index in 0..reader.num_levels()? {
        let level = reader.open_level(index)?;
        levels.push(LevelSummary {
            index,
            width: level.width,
            height: level.height,
            tile_width: level.tile_width,
            tile_height: level.tile_height,
            tiles: level.tiles_across * level.tiles_down,
            samples_per_pixel: level.samples_per_pixel,
            bits_per_sample: level.bits_per_sample,
            compression: format!("{:?}", level.compression),
            stripped: level.stripped,
        });
    }
    let summary = CogInfo {
        location: location.to_string(),
        bigtiff: structure.bigtiff,
        byte_order: format!("{:?}", structure.byte_order),
        length: structure.length,
        levels,
    };
    reader.close();
    Ok(summary)
}

/// Render `info` as the plain-text listing printed by `cogstream info`.
pub fn format_info(info: &CogInfo) -> String {
    let mut out = format!(
        "{}: {} bytes, {}, {}\n",
        info.location,
        info.length,
        if info.bigtiff { "BigTIFF" } else { "TIFF" },
        info.byte_order
    );
    for level in &info.levels {
        out.push_str(&format!(
            "  level {}: {}x{} {} {}x{} ({} {}), {} x {}-bit, {}\n",
            level.index,
            level.width,
            level.height,
            if level.stripped { "strips" } else { "tiles" },
            level.tile_width,
            level.tile_height,
            level.tiles,
            if level.stripped { "strips" } else { "tiles" },
            level.samples_per_pixel,
            level.bits_per_sample,
            level.compression
        ));
    }
    out
}

/// Read a region and write its raw pixels to `output`.
#[allow(clippy::too_many_arguments)]
pub fn read(
    location: &str,
    mut config: ReaderConfig,
    level: u32,
    x: u32,
    y: u32,
    width: Option<u32>,
    height: Option<u32>,
    subsample_x: u32,
    subsample_y: u32,
    skip_failed: bool,
    output: &Path,
) -> Result<ReadSummary, CliError> {
    if skip_failed {
        config.tile_error_policy = TileErrorPolicy::Skip;
    }
    let reader = CogReader::open(location, config)?;
    let dims = reader.open_level(level)?;
    let width = width.unwrap_or_else(|| dims.width.saturating_sub(x));
    let height = height.unwrap_or_else(|| dims.height.saturating_sub(y));

    let raster = reader.read_region(level, x, y, width, height, subsample_x, subsample_y)?;
    std::fs::write(output, raster.data()).map_err(|source| CliError::Io {
        path: output.to_path_buf(),
        source,
    })?;

    let stats = reader.reader_stats();
    info!(
        requests = stats.requests,
        bytes = stats.bytes,
        retries = stats.retries,
        "backend traffic"
    );
    if let Some(cache) = reader.cache_stats() {
        info!(hits = cache.hits, misses = cache.misses, fetches = cache.fetches, "cache");
    }
    reader.close();

    Ok(ReadSummary {
        width: raster.width(),
        height: raster.height(),
        bytes_per_pixel: raster.bytes_per_pixel(),
        skipped_tiles: raster.skipped_tiles().len(),
        output: output.to_path_buf(),
    })
}

/// Run the parsed command, printing its result to stdout.
pub fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Info { location, json } => {
            let summary = info(&location, config)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", format_info(&summary));
            }
        }
        Commands::Read {
            location,
            level,
            x,
            y,
            width,
            height,
            subsample_x,
            subsample_y,
            skip_failed,
            output,
        } => {
            let summary = read(
                &location,
                config,
                level,
                x,
                y,
                width,
                height,
                subsample_x,
                subsample_y,
                skip_failed,
                &output,
            )?;
            println!(
                "wrote {}x{} pixels ({} bytes each) to {}",
                summary.width,
                summary.height,
                summary.bytes_per_pixel,
                summary.output.display()
            );
            if summary.skipped_tiles > 0 {
                println!("{} tiles skipped", summary.skipped_tiles);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cogstream_tiff::testing::{CogBuilder, CogFile};
    use cogstream_tiff::Region;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_cog(file: &CogFile) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&file.bytes).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    #[test]
    fn test_parse_read_command() {
        let cli = Cli::try_parse_from([
            "cogstream",
            "read",
            "s3://bucket/scene.tif",
            "--level",
            "1",
            "-x",
            "10",
            "--width",
            "64",
            "--subsample-x",
            "2",
            "-o",
            "out.raw",
            "--skip-failed",
        ])
        .unwrap();
        match cli.command {
            Commands::Read {
                location,
                level,
                x,
                y,
                width,
                height,
                subsample_x,
                subsample_y,
                skip_failed,
                output,
            } => {
                assert_eq!(location, "s3://bucket/scene.tif");
                assert_eq!((level, x, y), (1, 10, 0));
                assert_eq!((width, height), (Some(64), None));
                assert_eq!((subsample_x, subsample_y), (2, 1));
                assert!(skip_failed);
                assert_eq!(output, PathBuf::from("out.raw"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_read_requires_output() {
        assert!(Cli::try_parse_from(["cogstream", "read", "a.tif"]).is_err());
    }

    #[test]
    fn test_info_lists_levels() {
        let file = CogBuilder::pyramid(1024, 512, 512, 1).build();
        let tmp = write_cog(&file);
        let location = tmp.path().to_str().unwrap();

        let summary = info(location, ReaderConfig::default()).unwrap();
        assert!(!summary.bigtiff);
        assert_eq!(summary.length, file.bytes.len() as u64);
        assert_eq!(summary.levels.len(), 2);
        assert_eq!((summary.levels[0].width, summary.levels[0].height), (1024, 512));
        assert_eq!(summary.levels[0].tiles, 2);
        assert_eq!((summary.levels[1].width, summary.levels[1].height), (512, 256));
        assert_eq!(summary.levels[1].compression, "None");

        let text = format_info(&summary);
        assert!(text.contains("level 0: 1024x512 tiles 512x512"));
        assert!(text.contains("level 1: 512x256"));

        let json: serde_json::Value = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["levels"][1]["width"], 512);
    }

    #[test]
    fn test_read_writes_raw_pixels() {
        let file = CogBuilder::pyramid(200, 100, 64, 1).build();
        let tmp = write_cog(&file);
        let out = NamedTempFile::new().unwrap();

        let summary = read(
            tmp.path().to_str().unwrap(),
            ReaderConfig::default(),
            0,
            20,
            10,
            None,
            Some(50),
            2,
            1,
            false,
            out.path(),
        )
        .unwrap();
        assert_eq!((summary.width, summary.height), (90, 50));
        assert_eq!(summary.skipped_tiles, 0);

        let written = std::fs::read(out.path()).unwrap();
        assert_eq!(written, file.expected_region(0, Region::new(20, 10, 180, 50), 2, 1));
    }

    #[test]
    fn test_load_config() {
        let mut yaml = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(yaml, "tile_error_policy: skip\nparallel: false").unwrap();
        let config = load_config(Some(yaml.path())).unwrap();
        assert_eq!(config.tile_error_policy, TileErrorPolicy::Skip);
        assert!(!config.parallel);

        let mut json = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(json, r#"{{"fill_byte": 9}}"#).unwrap();
        assert_eq!(load_config(Some(json.path())).unwrap().fill_byte, 9);

        let mut bad = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(bad, "not json").unwrap();
        assert!(matches!(
            load_config(Some(bad.path())),
            Err(CliError::Config { .. })
        ));
        assert_eq!(load_config(None).unwrap(), ReaderConfig::default());
    }
}
