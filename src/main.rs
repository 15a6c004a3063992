use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::future::join_all;
use log::warn;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pinphotos::config::{API_KEY_ENV, Config};
use pinphotos::engine::{ImageOutcome, SyncEngine};
use pinphotos::fetch::HttpImageFetcher;
use pinphotos::flickr::FlickrClient;
use pinphotos::selection::SelectionSet;
use pinphotos::store::{Photo, PhotoStore, Pin};

#[derive(Parser)]
#[command(author, version, about = "Browse cached Flickr photos around map pins")]
struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize with a default config file
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Manage pins
    Pin {
        #[command(subcommand)]
        action: PinAction,
    },

    /// Show a pin's photos, searching for some if it has none
    Photos(Coordinate),

    /// Download and cache every missing image for a pin
    Images(Coordinate),

    /// Delete a pin's photos
    Delete {
        #[command(flatten)]
        at: Coordinate,

        /// Delete every photo and search again
        #[arg(long, conflicts_with = "positions")]
        all: bool,

        /// Comma-separated photo positions to delete
        #[arg(long, value_delimiter = ',')]
        positions: Vec<usize>,
    },

    /// Show configuration and cache statistics
    Status,
}

#[derive(Subcommand)]
enum PinAction {
    /// Drop a pin at a coordinate
    Add(Coordinate),
    /// List all pins
    List,
    /// Remove a pin and all its photos
    Remove(Coordinate),
}

#[derive(Args, Clone, Copy)]
struct Coordinate {
    /// Latitude in degrees
    #[arg(allow_negative_numbers = true)]
    latitude: f64,
    /// Longitude in degrees
    #[arg(allow_negative_numbers = true)]
    longitude: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => init_config(&cli.config, force),
        Commands::Pin { action } => {
            let config = load_config(&cli.config)?;
            let engine = open_engine(&config)?;
            match action {
                PinAction::Add(at) => {
                    let pin = engine.add_pin(at.latitude, at.longitude)?;
                    println!("Pin {} at {}, {}", pin.id, pin.latitude, pin.longitude);
                }
                PinAction::List => {
                    let pins = engine.pins();
                    println!("{} pins", pins.len());
                    for pin in pins {
                        let count = engine.photos(pin.id)?.len();
                        println!(
                            "  {}  {:>10.5} {:>11.5}  {} photos",
                            pin.id, pin.latitude, pin.longitude, count
                        );
                    }
                }
                PinAction::Remove(at) => {
                    let pin = find_pin(&engine, at)?;
                    let removed = engine.remove_pin(pin.id).await?;
                    println!("Removed pin {} and {} photos", pin.id, removed);
                }
            }
            Ok(())
        }
        Commands::Photos(at) => {
            let config = load_config(&cli.config)?;
            let engine = open_engine(&config)?;
            let pin = find_pin(&engine, at)?;

            let view = engine.photos_for_display(pin.id)?;
            let photos = match view.pending {
                None => view.photos,
                Some(pending) => {
                    println!(
                        "Searching for photos around {}, {}...",
                        pin.latitude, pin.longitude
                    );
                    let changes = pending.await.context("Photo search task failed")??;
                    println!("Inserted {} photos", changes.inserted.len());
                    engine.photos(pin.id)?
                }
            };

            print_photos(&photos);
            Ok(())
        }
        Commands::Images(at) => {
            let config = load_config(&cli.config)?;
            let engine = open_engine(&config)?;
            let pin = find_pin(&engine, at)?;
            let photos = engine.photos(pin.id)?;

            let outcomes = join_all(photos.iter().map(|p| engine.ensure_image(p.key))).await;

            let (mut cached, mut fetched, mut placeholders, mut failed) = (0, 0, 0, 0);
            for (photo, outcome) in photos.iter().zip(outcomes) {
                match outcome {
                    Ok(ImageOutcome::Cached(_)) => cached += 1,
                    Ok(ImageOutcome::Fetched { .. }) => fetched += 1,
                    Ok(ImageOutcome::Placeholder(_)) => placeholders += 1,
                    Err(e) => {
                        warn!("Failed to cache image for photo {}: {}", photo.key, e);
                        failed += 1;
                    }
                }
            }

            println!(
                "Images: {} already cached, {} fetched, {} placeholders, {} failed",
                cached, fetched, placeholders, failed
            );
            Ok(())
        }
        Commands::Delete { at, all, positions } => {
            let config = load_config(&cli.config)?;
            let engine = open_engine(&config)?;
            let pin = find_pin(&engine, at)?;

            let changes = if all {
                engine.delete_all(pin.id).await?
            } else if !positions.is_empty() {
                let mut selection: SelectionSet = positions.into_iter().collect();
                engine.delete_selected(pin.id, &mut selection).await?
            } else {
                anyhow::bail!("Nothing to delete: pass --all or --positions");
            };

            println!(
                "Deleted {} photos, inserted {}",
                changes.deleted.len(),
                changes.inserted.len()
            );
            print_photos(&engine.photos(pin.id)?);
            Ok(())
        }
        Commands::Status => {
            let config = load_config(&cli.config)?;
            println!("pinphotos Status");
            println!("Configuration:");
            println!("  Search endpoint: {}", config.base_url);
            println!("  Data file: {}", config.data_file);
            println!("  Image cache: {}", config.cache_dir);
            println!(
                "  Search: radius {} km, {} per page, pages 0..{}",
                config.radius, config.per_page, config.page_range
            );

            let store = PhotoStore::open(Path::new(&config.data_file), Path::new(&config.cache_dir))
                .context("Failed to open photo store")?;
            println!("Pins: {}", store.pins().len());
            println!("Photos: {}", store.photo_count());
            println!("Cached images: {}/{}", store.cached_count(), store.photo_count());
            Ok(())
        }
    }
}

fn print_photos(photos: &[Photo]) {
    if photos.is_empty() {
        println!("No photos for this pin");
        return;
    }

    println!("{} photos", photos.len());
    for (pos, photo) in photos.iter().enumerate() {
        println!(
            "  {:>3}  {:<14} {}  {}",
            pos,
            photo.id.as_deref().unwrap_or("-"),
            if photo.has_image() { "cached " } else { "pending" },
            photo.title.as_deref().unwrap_or("")
        );
    }
}

fn find_pin(engine: &SyncEngine, at: Coordinate) -> Result<Pin> {
    engine
        .find_pin(at.latitude, at.longitude)
        .with_context(|| format!("No pin at {}, {}", at.latitude, at.longitude))
}

fn open_engine(config: &Config) -> Result<Arc<SyncEngine>> {
    let store = PhotoStore::open(Path::new(&config.data_file), Path::new(&config.cache_dir))
        .context("Failed to open photo store")?;

    if config.api_key.is_empty() {
        warn!("No API key configured; set api_key or {API_KEY_ENV}");
    }
    let search = FlickrClient::from_config(config)?;

    Ok(Arc::new(SyncEngine::new(
        store,
        Arc::new(search),
        Arc::new(HttpImageFetcher::new()),
        config.pin_tolerance,
    )))
}

fn init_config(config_path_opt: &Option<PathBuf>, force: bool) -> Result<()> {
    let config_path = Config::get_config_path(config_path_opt);

    if config_path.exists() && !force {
        println!("Config file already exists at {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    let config = Config::default();
    config
        .save_to_file(&config_path)
        .with_context(|| format!("Failed to write config to {}", config_path.display()))?;

    println!("Created config file at {}", config_path.display());
    Ok(())
}

fn load_config(config_path_opt: &Option<PathBuf>) -> Result<Config> {
    let config_path = Config::get_config_path(config_path_opt);

    if !config_path.exists() {
        anyhow::bail!(
            "Config file not found at {}. Run 'pinphotos init' to create one.",
            config_path.display()
        );
    }

    Config::load_from_file(&config_path)
}
