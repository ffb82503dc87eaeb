//! roi_tool - inspect and edit a camera's directional zones in the
//! configured ROI store

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use traffic_view::config::ServiceConfig;
use traffic_view::roi::{RoiEntry, RoiRegistry};
use traffic_view::CameraId;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the stored zones as JSON.
    Get {
        #[arg(long)]
        camera: CameraId,
    },
    /// Store zones given as JSON point lists, e.g. '[[0,0],[100,0],[100,80]]'.
    Set {
        #[arg(long)]
        camera: CameraId,
        #[arg(long)]
        upstream: Option<String>,
        #[arg(long)]
        downstream: Option<String>,
        /// Read a `{"upstream":…,"downstream":…}` document instead.
        #[arg(long, conflicts_with_all = ["upstream", "downstream"])]
        file: Option<PathBuf>,
    },
    /// Remove the stored zones.
    Clear {
        #[arg(long)]
        camera: CameraId,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let config = ServiceConfig::load()?;
    let registry = RoiRegistry::new(config.open_roi_store()?);

    match args.command {
        Command::Get { camera } => {
            let entry = RoiEntry::from_config(registry.get(camera)?.as_ref());
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        Command::Set {
            camera,
            upstream,
            downstream,
            file,
        } => {
            let entry = match file {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    serde_json::from_str(&raw)
                        .with_context(|| format!("invalid roi document {}", path.display()))?
                }
                None => RoiEntry {
                    upstream: parse_points("upstream", upstream.as_deref())?,
                    downstream: parse_points("downstream", downstream.as_deref())?,
                    roi_polygon: None,
                },
            };
            let config = entry.into_config(camera).ok_or_else(|| {
                anyhow!("no usable polygon given (each needs at least 3 points)")
            })?;
            registry.save(config)?;
            println!("saved roi for camera {}", camera);
        }
        Command::Clear { camera } => {
            registry.clear(camera)?;
            println!("cleared roi for camera {}", camera);
        }
    }
    Ok(())
}

fn parse_points(name: &str, raw: Option<&str>) -> Result<Option<Vec<[f32; 2]>>> {
    raw.map(|raw| {
        serde_json::from_str(raw).map_err(|e| anyhow!("--{} must be a JSON point list: {}", name, e))
    })
    .transpose()
}
