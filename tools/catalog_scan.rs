mod config;

use std::env;
use std::path::PathBuf;

use common::RootLocator;
use config::{config_path_from_env, load_or_create_config, resolve_music_root, resolve_path};
use library::{refresh, AssetStore, LibraryParser};
use metadata::TagParser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }

    let music_root = env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| resolve_music_root(&config_path, &config.music_root))
        .ok_or("music_root not configured and no path argument")?;
    let store_path = resolve_path(&config_path, &config.store_path);

    let locator = RootLocator::new(&music_root);
    let mut store = AssetStore::open(&store_path, &locator);
    let retina_changed = store.set_retina(config.retina);

    let library_parser = LibraryParser::new(config.grouping_title_cleanup);
    let result = refresh(
        &mut store,
        &music_root,
        &TagParser,
        &library_parser,
        config.concurrency(),
    )?;

    let changed: Vec<usize> = if retina_changed {
        info!("Artwork density changed; every album is stale");
        (0..result.library.albums().len()).collect()
    } else {
        result.changed.iter().copied().collect()
    };

    match store.save_to_path(&store_path, &locator) {
        Ok(saved) => info!("Saved {} assets to {:?}", saved, store_path),
        Err(err) => warn!("Failed to save asset store {:?}: {}", store_path, err),
    }

    let stats = result.library.stats();
    println!(
        "Catalog: {} artists, {} albums, {} tracks ({} parsed, {} reused, {} deleted)",
        stats.album_artists,
        stats.albums,
        stats.tracks,
        result.stats.parsed,
        result.stats.reused,
        result.stats.deleted
    );
    for index in changed {
        if let Some(album) = result.library.album(index) {
            println!(
                "changed album {}: {} / {}",
                album.album_id.map(|id| id.to_string()).unwrap_or_default(),
                album.artist.as_deref().unwrap_or("Various Artists"),
                album.title.as_deref().unwrap_or("Unknown Album")
            );
        }
    }

    for album_id in &result.freed_album_ids {
        println!("freed album {}", album_id);
    }

    Ok(())
}
