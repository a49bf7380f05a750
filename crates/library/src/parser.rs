use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use common::Asset;
use tracing::{debug, info};

use crate::model::{Album, Artist, Disc, Library, Track};

/// Builds a [`Library`] from a flat asset stream.
#[derive(Clone, Debug, Default)]
pub struct LibraryParser {
    grouping_title_cleanup: bool,
}

impl LibraryParser {
    /// With `grouping_title_cleanup`, a track title that starts with its grouping
    /// ("Symphony No. 5 - I. Allegro" in grouping "Symphony No. 5") loses that prefix.
    pub fn new(grouping_title_cleanup: bool) -> Self {
        Self {
            grouping_title_cleanup,
        }
    }

    pub fn parse<'a, I>(&self, assets: I) -> Library
    where
        I: IntoIterator<Item = &'a Asset>,
    {
        let mut builder = Builder::new();
        for asset in assets {
            self.add_asset(&mut builder, asset);
        }
        builder.redistribute_compilations();
        builder.drop_empty_unknown_artists();
        builder.sort_tracks();
        builder.library
    }

    fn add_asset(&self, builder: &mut Builder, asset: &Asset) {
        let name = clean(&asset.name);
        let grouping = clean(&asset.grouping);
        let album_title = clean(&asset.album);
        let mut artist = clean(&asset.artist);
        let mut album_artist = clean(&asset.album_artist);

        let title = match (name, grouping.as_deref()) {
            (Some(name), Some(grouping)) if self.grouping_title_cleanup => {
                let stripped = strip_grouping(&name, grouping).map(str::to_string);
                stripped.unwrap_or(name)
            }
            (name, _) => match name {
                Some(name) => name,
                None => {
                    info!("Skipping {:?}: no title", asset.resource);
                    return;
                }
            },
        };

        if album_artist.is_none() && !asset.compilation {
            album_artist = artist.clone();
        }
        if artist.is_none() && album_artist.is_some() {
            artist = album_artist.clone();
        }

        if album_title.is_none() && artist.is_none() {
            info!("Skipping {:?}: neither album nor artist", asset.resource);
            return;
        }

        let album = builder.album(album_artist, album_title);
        builder.track_artist(&artist);

        let index = builder.library.tracks.len();
        builder.library.tracks.push(Track {
            title,
            resource: asset.resource.clone(),
            artwork_available: asset.artwork_available,
            compilation: asset.compilation,
            composer: clean(&asset.composer),
            disc_number: asset.disc_number,
            duration: asset.duration,
            genre: clean(&asset.genre),
            grouping,
            track_number: asset.track_number,
            year: asset.year,
            album,
            artist: artist.clone(),
        });

        let album_ref = &mut builder.library.albums[album];
        album_ref.tracks.push(index);
        let disc_number = asset.disc_number.unwrap_or(0);
        album_ref
            .discs
            .entry(disc_number)
            .or_insert_with(|| Disc {
                disc_number,
                tracks: Vec::new(),
            })
            .tracks
            .push(index);

        if let Some(track_artist) = builder.library.track_artists.get_mut(&artist) {
            if !track_artist.albums.contains(&album) {
                track_artist.albums.push(album);
            }
        }
    }
}

struct Builder {
    library: Library,
    next_album_artist_id: u32,
    next_track_artist_id: u32,
}

impl Builder {
    fn new() -> Self {
        let mut library = Library::default();
        library.album_artists.insert(None, Artist::new(0, None));
        library.track_artists.insert(None, Artist::new(0, None));
        Self {
            library,
            next_album_artist_id: 1,
            next_track_artist_id: 1,
        }
    }

    fn album_artist(&mut self, title: &Option<String>) -> &mut Artist {
        let next_id = &mut self.next_album_artist_id;
        self.library
            .album_artists
            .entry(title.clone())
            .or_insert_with(|| {
                let artist = Artist::new(*next_id, title.clone());
                *next_id += 1;
                artist
            })
    }

    fn track_artist(&mut self, title: &Option<String>) -> &mut Artist {
        let next_id = &mut self.next_track_artist_id;
        self.library
            .track_artists
            .entry(title.clone())
            .or_insert_with(|| {
                let artist = Artist::new(*next_id, title.clone());
                *next_id += 1;
                artist
            })
    }

    /// Index of the album titled `title` under `artist`, created on first use.
    fn album(&mut self, artist: Option<String>, title: Option<String>) -> usize {
        let existing = self
            .album_artist(&artist)
            .albums
            .clone()
            .into_iter()
            .find(|&index| self.library.albums[index].title == title);
        if let Some(index) = existing {
            return index;
        }

        let index = self.library.albums.len();
        self.library.albums.push(Album {
            title,
            artist: artist.clone(),
            album_id: None,
            discs: BTreeMap::new(),
            tracks: Vec::new(),
        });
        self.album_artist(&artist).albums.push(index);
        index
    }

    /// Hands compilations whose tracks all share one named artist over to that artist.
    fn redistribute_compilations(&mut self) {
        let candidates = match self.library.album_artists.get(&None) {
            Some(various) => various.albums.clone(),
            None => return,
        };

        let mut removed = vec![false; self.library.albums.len()];
        let mut touched = false;
        for source in candidates {
            let Some(owner) = self.common_track_artist(source) else {
                continue;
            };
            let owner = Some(owner);
            touched = true;

            let title = self.library.albums[source].title.clone();
            let target = self.library.album_artists.get(&owner).and_then(|artist| {
                artist.albums.iter().copied().find(|&index| {
                    index != source && !removed[index] && self.library.albums[index].title == title
                })
            });

            match target {
                Some(target) => {
                    debug!("Merging compilation {:?} into album of {:?}", title, owner);
                    self.merge_album(source, target);
                    removed[source] = true;
                }
                None => {
                    debug!("Moving compilation {:?} to {:?}", title, owner);
                    self.album_artist(&owner).albums.push(source);
                    self.library.albums[source].artist = owner;
                }
            }

            if let Some(various) = self.library.album_artists.get_mut(&None) {
                various.albums.retain(|&index| index != source);
            }
        }

        if touched {
            self.library.remove_albums(&removed);
        }
    }

    fn common_track_artist(&self, album: usize) -> Option<String> {
        let mut tracks = self.library.albums[album]
            .tracks
            .iter()
            .map(|&index| &self.library.tracks[index].artist);
        let first = tracks.next()?.as_ref()?;
        if tracks.all(|artist| artist.as_ref() == Some(first)) {
            Some(first.clone())
        } else {
            None
        }
    }

    fn merge_album(&mut self, source: usize, target: usize) {
        let discs = std::mem::take(&mut self.library.albums[source].discs);
        let tracks = std::mem::take(&mut self.library.albums[source].tracks);
        for &index in &tracks {
            self.library.tracks[index].album = target;
        }

        let target = &mut self.library.albums[target];
        for (disc_number, disc) in discs {
            match target.discs.entry(disc_number) {
                Entry::Occupied(mut entry) => entry.get_mut().tracks.extend(disc.tracks),
                Entry::Vacant(entry) => {
                    entry.insert(disc);
                }
            }
        }
        target.tracks.extend(tracks);
    }

    fn drop_empty_unknown_artists(&mut self) {
        if self
            .library
            .album_artists
            .get(&None)
            .map_or(false, |artist| artist.albums.is_empty())
        {
            self.library.album_artists.remove(&None);
        }
        if self
            .library
            .track_artists
            .get(&None)
            .map_or(false, |artist| artist.albums.is_empty())
        {
            self.library.track_artists.remove(&None);
        }
    }

    fn sort_tracks(&mut self) {
        let Library { albums, tracks, .. } = &mut self.library;
        let tracks = &*tracks;
        let order = |a: &usize, b: &usize| compare_tracks(&tracks[*a], &tracks[*b]);
        for album in albums.iter_mut() {
            for disc in album.discs.values_mut() {
                disc.tracks.sort_by(order);
            }
            album.tracks.sort_by(order);
        }
    }
}

fn compare_tracks(a: &Track, b: &Track) -> Ordering {
    nulls_last(a.disc_number, b.disc_number)
        .then_with(|| nulls_last(a.track_number, b.track_number))
        .then_with(|| a.title.cmp(&b.title))
        .then_with(|| nulls_last(a.artist.as_deref(), b.artist.as_deref()))
}

fn nulls_last<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// `title` without the `grouping` prefix and the separator run after it.
fn strip_grouping<'a>(title: &'a str, grouping: &str) -> Option<&'a str> {
    let rest = title
        .strip_prefix(grouping)?
        .trim_start_matches(|c: char| !c.is_alphanumeric());
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}
