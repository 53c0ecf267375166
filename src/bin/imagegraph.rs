//! imagegraph CLI tool
//!
//! Resolves images, sequences and areas from a JSON dataset through the graph service and
//! prints the result as JSON.
//!
//! ## Commands
//!
//! - `cache <id>`: Resolve one image with its navigation edges
//! - `sequence <id>`: Cache a sequence and all of its images
//! - `bbox <min-lng> <min-lat> <max-lng> <max-lat>`: Cache the images inside a bounding box

use clap::{Parser, Subcommand};
use imagegraph::{
    config::{ConfigProvider, GraphConfiguration, TomlConfigProvider},
    graph::{Graph, Image, NavigationEdge},
    provider::{LngLat, MemoryProvider},
    service::{GraphMode, GraphService},
};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};

#[derive(Parser)]
#[command(name = "imagegraph")]
#[command(author, version, about = "Resolve geotagged images and their navigation edges", long_about = None)]
struct Cli {
    /// JSON dataset served by the in-memory provider
    #[arg(short, long)]
    dataset: PathBuf,

    /// Graph configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Graph mode: spatial or sequence
    #[arg(short, long, default_value = "spatial")]
    mode: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve an image and print it with its edges
    Cache {
        /// Image id
        id: String,
    },

    /// Cache a sequence and its images
    Sequence {
        /// Sequence id
        id: String,

        /// Image to prioritize when fetching the sequence's images
        #[arg(short, long)]
        reference: Option<String>,
    },

    /// Cache the images inside a bounding box
    Bbox {
        #[arg(allow_negative_numbers = true)]
        min_lng: f64,
        #[arg(allow_negative_numbers = true)]
        min_lat: f64,
        #[arg(allow_negative_numbers = true)]
        max_lng: f64,
        #[arg(allow_negative_numbers = true)]
        max_lat: f64,
    },
}

#[derive(Serialize)]
struct ImageSummary<'a> {
    id: &'a str,
    sequence_id: &'a str,
    lng_lat: LngLat,
    complete: bool,
    assets_cached: bool,
    sequence_edges: Option<&'a [NavigationEdge]>,
    spatial_edges: Option<&'a [NavigationEdge]>,
}

impl<'a> From<&'a Image> for ImageSummary<'a> {
    fn from(image: &'a Image) -> Self {
        let edges = |status: &'a imagegraph::graph::NavigationEdgeStatus| {
            status.cached.then_some(status.edges.as_slice())
        };
        ImageSummary {
            id: image.id(),
            sequence_id: image.sequence_id(),
            lng_lat: image.lng_lat(),
            complete: image.complete(),
            assets_cached: image.assets_cached(),
            sequence_edges: edges(&image.sequence_edges),
            spatial_edges: edges(&image.spatial_edges),
        }
    }
}

fn print_images(images: &[Image]) -> Result<(), Box<dyn std::error::Error>> {
    let summaries = images.iter().map(ImageSummary::from).collect::<Vec<_>>();
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mode: GraphMode = cli.mode.parse()?;
    let config = match &cli.config {
        Some(path) => TomlConfigProvider::new(path.clone()).get_configuration()?,
        None => GraphConfiguration::default(),
    };
    let provider = Arc::new(MemoryProvider::from_json_path(&cli.dataset)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let service = GraphService::new(Graph::with_configuration(provider, config));
        service.set_graph_mode(mode);

        match cli.command {
            Commands::Cache { id } => {
                let image = service.cache_image(&id).await?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ImageSummary::from(&image))?
                );
            }
            Commands::Sequence { id, reference } => {
                let images = service
                    .cache_sequence_images(&id, reference.as_deref())
                    .await?;
                print_images(&images)?;
            }
            Commands::Bbox {
                min_lng,
                min_lat,
                max_lng,
                max_lat,
            } => {
                let images = service
                    .cache_bounding_box(
                        LngLat::new(min_lng, min_lat),
                        LngLat::new(max_lng, max_lat),
                    )
                    .await?;
                print_images(&images)?;
            }
        }
        Ok(())
    })
}
