use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// Album artist or track artist. `title == None` is the "Various Artists" /
/// "Unknown Artist" bucket.
#[derive(Clone, Debug, PartialEq)]
pub struct Artist {
    pub artist_id: u32,
    pub title: Option<String>,
    /// Indices into [`Library::albums`].
    pub albums: Vec<usize>,
}

impl Artist {
    pub(crate) fn new(artist_id: u32, title: Option<String>) -> Self {
        Self {
            artist_id,
            title,
            albums: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Album {
    pub title: Option<String>,
    /// Key of the owning album artist.
    pub artist: Option<String>,
    /// Assigned by `AssetStore::sync`.
    pub album_id: Option<u32>,
    pub discs: BTreeMap<u32, Disc>,
    /// Indices into [`Library::tracks`], sorted across discs.
    pub tracks: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Disc {
    /// 0 when the tags carry no disc number.
    pub disc_number: u32,
    pub tracks: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    pub title: String,
    pub resource: PathBuf,
    pub artwork_available: bool,
    pub compilation: bool,
    pub composer: Option<String>,
    pub disc_number: Option<u32>,
    pub duration: Option<u32>,
    pub genre: Option<String>,
    pub grouping: Option<String>,
    pub track_number: Option<u32>,
    pub year: Option<i32>,
    pub album: usize,
    /// Key of the track artist.
    pub artist: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LibraryStats {
    pub album_artists: usize,
    pub track_artists: usize,
    pub albums: usize,
    pub tracks: usize,
}

/// Artist → album → disc → track graph. Containers own their children; the
/// links back up (track → album, album → artist, artist → albums) are indices
/// and title keys.
#[derive(Clone, Debug, Default)]
pub struct Library {
    pub(crate) albums: Vec<Album>,
    pub(crate) album_artists: BTreeMap<Option<String>, Artist>,
    pub(crate) track_artists: BTreeMap<Option<String>, Artist>,
    pub(crate) tracks: Vec<Track>,
}

impl Library {
    pub fn albums(&self) -> &[Album] {
        &self.albums
    }

    pub fn album(&self, index: usize) -> Option<&Album> {
        self.albums.get(index)
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn album_tracks(&self, index: usize) -> impl Iterator<Item = &Track> + '_ {
        self.albums
            .get(index)
            .into_iter()
            .flat_map(move |album| album.tracks.iter().filter_map(move |&t| self.tracks.get(t)))
    }

    pub fn album_artists(&self) -> &BTreeMap<Option<String>, Artist> {
        &self.album_artists
    }

    pub fn track_artists(&self) -> &BTreeMap<Option<String>, Artist> {
        &self.track_artists
    }

    pub fn album_artist(&self, title: Option<&str>) -> Option<&Artist> {
        self.album_artists.get(&title.map(str::to_string))
    }

    pub fn track_artist(&self, title: Option<&str>) -> Option<&Artist> {
        self.track_artists.get(&title.map(str::to_string))
    }

    pub fn stats(&self) -> LibraryStats {
        LibraryStats {
            album_artists: self.album_artists.len(),
            track_artists: self.track_artists.len(),
            albums: self.albums.len(),
            tracks: self.tracks.len(),
        }
    }

    /// Drops albums flagged in `removed`. Their tracks must already point at a
    /// surviving album.
    pub(crate) fn remove_albums(&mut self, removed: &[bool]) {
        let mut remap = vec![None; self.albums.len()];
        let mut kept = Vec::with_capacity(self.albums.len());
        for (index, album) in std::mem::take(&mut self.albums).into_iter().enumerate() {
            if removed.get(index).copied().unwrap_or(false) {
                continue;
            }
            remap[index] = Some(kept.len());
            kept.push(album);
        }
        self.albums = kept;

        for track in &mut self.tracks {
            if let Some(index) = remap.get(track.album).copied().flatten() {
                track.album = index;
            }
        }
        self.relink_artists();
    }

    /// Rebuilds every artist's album list from the album owners and track artists.
    pub(crate) fn relink_artists(&mut self) {
        for artist in self
            .album_artists
            .values_mut()
            .chain(self.track_artists.values_mut())
        {
            artist.albums.clear();
        }

        for (index, album) in self.albums.iter().enumerate() {
            if let Some(artist) = self.album_artists.get_mut(&album.artist) {
                artist.albums.push(index);
            }
        }

        let mut seen = HashSet::new();
        for track in &self.tracks {
            if !seen.insert((track.artist.clone(), track.album)) {
                continue;
            }
            if let Some(artist) = self.track_artists.get_mut(&track.artist) {
                artist.albums.push(track.album);
            }
        }
    }
}
