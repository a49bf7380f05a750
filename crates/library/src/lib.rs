mod model;
mod parser;
mod store;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use metadata::AssetParser;
use tracing::info;

pub use model::{Album, Artist, Disc, Library, LibraryStats, Track};
pub use parser::LibraryParser;
pub use store::{AssetEntity, AssetStore, LoadOutcome, SyncState, UpdateStats, STORE_VERSION};

/// Result of one update → parse → sync cycle.
#[derive(Debug)]
pub struct Refresh {
    pub stats: UpdateStats,
    pub library: Library,
    /// Indices into `library.albums()` whose rendering is stale.
    pub changed: BTreeSet<usize>,
    /// Ids of albums whose tracks were all deleted since the last run. An id
    /// reclaimed by a new album in the same run also shows up in `changed`.
    pub freed_album_ids: BTreeSet<u32>,
}

pub fn refresh<P: AssetParser>(
    store: &mut AssetStore,
    root: &Path,
    parser: &P,
    library_parser: &LibraryParser,
    max_concurrency: usize,
) -> Result<Refresh, LibraryError> {
    let stats = store.update(root, parser, max_concurrency)?;
    let mut library = library_parser.parse(store.assets());
    let freed_album_ids = store.tombstones().clone();
    let changed = store.sync(&mut library);

    let counts = library.stats();
    info!(
        "Library built: {} album artists, {} albums, {} tracks; {} albums changed, {} ids freed",
        counts.album_artists,
        counts.albums,
        counts.tracks,
        changed.len(),
        freed_album_ids.len()
    );

    Ok(Refresh {
        stats,
        library,
        changed,
        freed_album_ids,
    })
}

#[derive(Debug)]
pub enum LibraryError {
    Io(std::io::Error),
    Walk(walkdir::Error),
    Json(serde_json::Error),
    MissingRoot(PathBuf),
}

impl std::fmt::Display for LibraryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryError::Io(err) => write!(f, "io error: {}", err),
            LibraryError::Walk(err) => write!(f, "walk error: {}", err),
            LibraryError::Json(err) => write!(f, "store format error: {}", err),
            LibraryError::MissingRoot(path) => {
                write!(f, "music root is not a directory: {:?}", path)
            }
        }
    }
}

impl std::error::Error for LibraryError {}

impl From<std::io::Error> for LibraryError {
    fn from(err: std::io::Error) -> Self {
        LibraryError::Io(err)
    }
}

impl From<walkdir::Error> for LibraryError {
    fn from(err: walkdir::Error) -> Self {
        LibraryError::Walk(err)
    }
}

impl From<serde_json::Error> for LibraryError {
    fn from(err: serde_json::Error) -> Self {
        LibraryError::Json(err)
    }
}
