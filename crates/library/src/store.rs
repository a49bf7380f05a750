use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use common::{Asset, AssetLocator};
use metadata::AssetParser;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::model::Library;
use crate::LibraryError;

pub const STORE_VERSION: &str = "1";
const BATCH_SIZE: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Synced,
    Created,
    Modified,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssetEntity {
    pub asset: Asset,
    pub album_id: Option<u32>,
    pub state: SyncState,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateStats {
    pub scanned: usize,
    pub reused: usize,
    pub parsed: usize,
    pub failed: usize,
    pub deleted: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { assets: usize, dropped: usize },
    /// The file was written by another format version; the store is left empty.
    VersionMismatch(String),
}

/// Persistent resource → asset cache with stable album ids.
#[derive(Clone, Debug)]
pub struct AssetStore {
    version: String,
    /// Milliseconds since the epoch at which the last update started scanning.
    timestamp: u64,
    retina: Option<bool>,
    entities: BTreeMap<PathBuf, AssetEntity>,
    /// Album ids freed by deleted resources since the last sync.
    tombstones: BTreeSet<u32>,
}

impl Default for AssetStore {
    fn default() -> Self {
        Self::new(STORE_VERSION)
    }
}

impl AssetStore {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            timestamp: 0,
            retina: None,
            entities: BTreeMap::new(),
            tombstones: BTreeSet::new(),
        }
    }

    /// Loads the store at `path`. Any failure yields an empty store, which
    /// makes the next update reparse everything.
    pub fn open(path: &Path, locator: &impl AssetLocator) -> Self {
        let mut store = Self::default();
        if !path.exists() {
            info!("No asset store at {:?}; starting empty", path);
            return store;
        }

        let result = fs::File::open(path)
            .map_err(LibraryError::from)
            .and_then(|file| store.load(BufReader::new(file), locator));
        match result {
            Ok(LoadOutcome::Loaded { assets, dropped }) => {
                info!(
                    "Loaded asset store from {:?}: {} assets, {} dropped",
                    path, assets, dropped
                );
            }
            Ok(LoadOutcome::VersionMismatch(found)) => {
                warn!("Asset store version mismatch ({}); rebuilding", found);
            }
            Err(err) => {
                warn!("Failed to load asset store {:?}: {}; rebuilding", path, err);
                store = Self::default();
            }
        }
        store
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn retina(&self) -> Option<bool> {
        self.retina
    }

    /// Returns whether the value differs from the stored one.
    pub fn set_retina(&mut self, retina: Option<bool>) -> bool {
        let changed = self.retina != retina;
        self.retina = retina;
        changed
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn asset(&self, resource: &Path) -> Option<&Asset> {
        self.entities.get(resource).map(|entity| &entity.asset)
    }

    pub fn entity(&self, resource: &Path) -> Option<&AssetEntity> {
        self.entities.get(resource)
    }

    /// Assets ordered by resource path.
    pub fn assets(&self) -> impl Iterator<Item = &Asset> + '_ {
        self.entities.values().map(|entity| &entity.asset)
    }

    pub fn tombstones(&self) -> &BTreeSet<u32> {
        &self.tombstones
    }

    /// Rescans `root`, reparsing new and modified files on up to
    /// `max_concurrency` threads and forgetting files that disappeared.
    pub fn update<P: AssetParser>(
        &mut self,
        root: &Path,
        parser: &P,
        max_concurrency: usize,
    ) -> Result<UpdateStats, LibraryError> {
        if !root.is_dir() {
            return Err(LibraryError::MissingRoot(root.to_path_buf()));
        }

        let started = now_millis();
        let resources = scan_resources(root, parser)?;

        let mut previous = std::mem::take(&mut self.entities);
        let mut stats = UpdateStats {
            scanned: resources.len(),
            ..UpdateStats::default()
        };

        let mut pending = Vec::new();
        for (resource, modified) in resources {
            let fresh = modified.map_or(false, |modified| modified <= self.timestamp);
            if fresh {
                if let Some(entity) = previous.remove(&resource) {
                    self.entities.insert(resource, entity);
                    stats.reused += 1;
                    continue;
                }
            }
            let prior_album_id = previous.get(&resource).map(|entity| entity.album_id);
            pending.push(Pending {
                resource,
                prior_album_id,
            });
        }

        let requested: HashSet<PathBuf> =
            pending.iter().map(|pending| pending.resource.clone()).collect();
        for (pending, asset) in parse_concurrently(parser, pending, max_concurrency) {
            previous.remove(&pending.resource);
            let (album_id, state) = match pending.prior_album_id {
                Some(album_id) => (album_id, SyncState::Modified),
                None => (None, SyncState::Created),
            };
            self.entities.insert(
                pending.resource,
                AssetEntity {
                    asset,
                    album_id,
                    state,
                },
            );
            stats.parsed += 1;
        }
        stats.failed = requested.len() - stats.parsed;

        for (resource, entity) in previous {
            debug!("Forgetting {:?}", resource);
            if let Some(album_id) = entity.album_id {
                self.tombstones.insert(album_id);
            }
            if !requested.contains(&resource) {
                stats.deleted += 1;
            }
        }

        self.timestamp = started;
        info!(
            "Asset scan finished: {} files, {} reused, {} parsed, {} failed, {} deleted",
            stats.scanned, stats.reused, stats.parsed, stats.failed, stats.deleted
        );
        Ok(stats)
    }

    /// Assigns album ids to `library`'s albums, reusing the ids their tracks
    /// carried last time. Returns the indices of albums that changed.
    pub fn sync(&mut self, library: &mut Library) -> BTreeSet<usize> {
        let used: HashSet<u32> = self
            .entities
            .values()
            .filter_map(|entity| entity.album_id)
            .collect();
        let mut claimed: HashSet<u32> = HashSet::new();
        let mut covered: HashSet<PathBuf> = HashSet::new();
        let mut cursor = 0u32;
        let mut changed = BTreeSet::new();

        let Library { albums, tracks, .. } = library;
        for (index, album) in albums.iter_mut().enumerate() {
            let donated = album
                .tracks
                .iter()
                .filter_map(|&track| self.entities.get(&tracks[track].resource))
                .filter_map(|entity| entity.album_id)
                .find(|album_id| !claimed.contains(album_id));
            let album_id = match donated {
                Some(album_id) => album_id,
                None => {
                    while used.contains(&cursor) || claimed.contains(&cursor) {
                        cursor += 1;
                    }
                    cursor
                }
            };
            let fresh_claim = claimed.insert(album_id);
            debug_assert!(fresh_claim, "album id {} claimed twice", album_id);

            let mut album_changed = self.tombstones.contains(&album_id);
            for &track in &album.tracks {
                let resource = &tracks[track].resource;
                if let Some(entity) = self.entities.get_mut(resource) {
                    if entity.album_id != Some(album_id) || entity.state != SyncState::Synced {
                        album_changed = true;
                    }
                    entity.album_id = Some(album_id);
                    covered.insert(resource.clone());
                }
            }

            album.album_id = Some(album_id);
            if album_changed {
                changed.insert(index);
            }
        }

        self.tombstones.clear();
        for (resource, entity) in self.entities.iter_mut() {
            if !covered.contains(resource) {
                entity.album_id = None;
            }
            entity.state = SyncState::Synced;
        }

        debug!("Synced {} albums, {} changed", albums.len(), changed.len());
        changed
    }

    /// Writes the store as JSON. Assets the locator cannot express are skipped.
    pub fn save<W: Write>(
        &self,
        writer: W,
        locator: &impl AssetLocator,
    ) -> Result<usize, LibraryError> {
        let asset: Vec<AssetRecord> = self
            .entities
            .iter()
            .filter_map(|(resource, entity)| {
                let asset_path = locator.asset_path(resource)?;
                Some(AssetRecord::new(asset_path, entity))
            })
            .collect();
        let saved = asset.len();
        let document = StoreDocument {
            version: self.version.clone(),
            timestamp: self.timestamp,
            retina: self.retina,
            asset,
        };
        serde_json::to_writer_pretty(writer, &document)?;
        Ok(saved)
    }

    pub fn save_to_path(
        &self,
        path: &Path,
        locator: &impl AssetLocator,
    ) -> Result<usize, LibraryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = path.with_extension("tmp");
        let mut writer = BufWriter::new(fs::File::create(&tmp_path)?);
        let saved = self.save(&mut writer, locator)?;
        writer.flush()?;
        drop(writer);
        fs::rename(&tmp_path, path)?;
        Ok(saved)
    }

    /// Replaces the contents of this store with the document in `reader`.
    pub fn load<R: Read>(
        &mut self,
        mut reader: R,
        locator: &impl AssetLocator,
    ) -> Result<LoadOutcome, LibraryError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        let probe: VersionProbe = serde_json::from_slice(&data)?;
        if probe.version != self.version {
            self.clear();
            return Ok(LoadOutcome::VersionMismatch(probe.version));
        }

        let document: StoreDocument = serde_json::from_slice(&data)?;
        let mut entities = BTreeMap::new();
        let mut dropped = 0usize;
        for record in document.asset {
            let resource = match locator.resource(&record.asset_path) {
                Some(resource) => resource,
                None => {
                    warn!("Dropping unresolvable asset {:?}", record.asset_path);
                    dropped += 1;
                    continue;
                }
            };
            let (asset, album_id) = record.into_asset(resource.clone());
            entities.insert(
                resource,
                AssetEntity {
                    asset,
                    album_id,
                    state: SyncState::Synced,
                },
            );
        }

        self.entities = entities;
        self.tombstones.clear();
        self.timestamp = document.timestamp;
        self.retina = document.retina;
        Ok(LoadOutcome::Loaded {
            assets: self.entities.len(),
            dropped,
        })
    }

    fn clear(&mut self) {
        self.entities.clear();
        self.tombstones.clear();
        self.timestamp = 0;
        self.retina = None;
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    version: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StoreDocument {
    version: String,
    timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retina: Option<bool>,
    #[serde(default)]
    asset: Vec<AssetRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AssetRecord {
    album_id: Option<u32>,
    album: Option<String>,
    album_artist: Option<String>,
    artist: Option<String>,
    #[serde(default)]
    artwork_available: bool,
    asset_path: String,
    #[serde(default)]
    compilation: bool,
    composer: Option<String>,
    disc_number: Option<u32>,
    duration: Option<u32>,
    genre: Option<String>,
    grouping: Option<String>,
    name: Option<String>,
    track_number: Option<u32>,
    year: Option<i32>,
}

impl AssetRecord {
    fn new(asset_path: String, entity: &AssetEntity) -> Self {
        let asset = &entity.asset;
        Self {
            album_id: entity.album_id,
            album: asset.album.clone(),
            album_artist: asset.album_artist.clone(),
            artist: asset.artist.clone(),
            artwork_available: asset.artwork_available,
            asset_path,
            compilation: asset.compilation,
            composer: asset.composer.clone(),
            disc_number: asset.disc_number,
            duration: asset.duration,
            genre: asset.genre.clone(),
            grouping: asset.grouping.clone(),
            name: asset.name.clone(),
            track_number: asset.track_number,
            year: asset.year,
        }
    }

    fn into_asset(self, resource: PathBuf) -> (Asset, Option<u32>) {
        let asset = Asset {
            resource,
            name: self.name,
            artist: self.artist,
            album_artist: self.album_artist,
            album: self.album,
            genre: self.genre,
            composer: self.composer,
            grouping: self.grouping,
            duration: self.duration,
            disc_number: self.disc_number,
            track_number: self.track_number,
            year: self.year,
            compilation: self.compilation,
            artwork_available: self.artwork_available,
        };
        (asset, self.album_id)
    }
}

struct Pending {
    resource: PathBuf,
    /// `Some` when the store already knew this resource.
    prior_album_id: Option<Option<u32>>,
}

fn scan_resources<P: AssetParser>(
    root: &Path,
    parser: &P,
) -> Result<Vec<(PathBuf, Option<u64>)>, LibraryError> {
    let mut resources = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => return Err(err.into()),
            Err(err) => {
                warn!("Skipping unreadable entry: {}", err);
                continue;
            }
        };
        if !entry.file_type().is_file() || !parser.is_asset_path(entry.path()) {
            continue;
        }
        let modified = entry
            .metadata()
            .ok()
            .and_then(|metadata| metadata.modified().ok())
            .map(system_millis);
        resources.push((entry.into_path(), modified));
    }

    Ok(resources)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

/// Parses `pending` in batches of [`BATCH_SIZE`] on a dedicated rayon pool.
/// Results come back to the calling thread, the only one that sees them.
fn parse_concurrently<P: AssetParser>(
    parser: &P,
    pending: Vec<Pending>,
    max_concurrency: usize,
) -> Vec<(Pending, Asset)> {
    if pending.is_empty() {
        return Vec::new();
    }

    let workers = worker_count(pending.len(), max_concurrency);
    let mut batches = Vec::new();
    let mut remaining = pending.into_iter();
    loop {
        let batch: Vec<Pending> = remaining.by_ref().take(BATCH_SIZE).collect();
        if batch.is_empty() {
            break;
        }
        batches.push(batch);
    }
    debug!("Parsing {} batches on {} workers", batches.len(), workers);

    let pool = match ThreadPoolBuilder::new().num_threads(workers).build() {
        Ok(pool) => pool,
        Err(err) => {
            warn!("Failed to start parser pool: {}; parsing inline", err);
            return batches
                .into_iter()
                .flat_map(|batch| parse_batch(parser, batch))
                .collect();
        }
    };

    let parsed: Vec<Vec<(Pending, Asset)>> = pool.install(|| {
        batches
            .into_par_iter()
            .map(|batch| parse_batch(parser, batch))
            .collect()
    });
    parsed.into_iter().flatten().collect()
}

fn parse_batch<P: AssetParser>(parser: &P, batch: Vec<Pending>) -> Vec<(Pending, Asset)> {
    batch
        .into_iter()
        .filter_map(|pending| {
            let parsed =
                panic::catch_unwind(AssertUnwindSafe(|| parser.parse(&pending.resource)));
            match parsed {
                Ok(Ok(mut asset)) => {
                    asset.resource = pending.resource.clone();
                    Some((pending, asset))
                }
                Ok(Err(err)) => {
                    warn!("Failed to parse {:?}: {}", pending.resource, err);
                    None
                }
                Err(payload) => {
                    warn!(
                        "Parser panicked on {:?}: {}",
                        pending.resource,
                        panic_message(payload.as_ref())
                    );
                    None
                }
            }
        })
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

fn worker_count(items: usize, max_concurrency: usize) -> usize {
    let available = thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1);
    items
        .div_ceil(BATCH_SIZE)
        .min(max_concurrency.max(1))
        .min(available)
        .max(1)
}

fn system_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

fn now_millis() -> u64 {
    system_millis(SystemTime::now())
}
