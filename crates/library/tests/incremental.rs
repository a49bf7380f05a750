use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use common::{Asset, RootLocator};
use library::{refresh, AssetStore, Library, LibraryError, LibraryParser, Refresh};
use metadata::{AssetParser, CoverArt, MetadataError};

/// Reads `key=value` lines from `.trk` files.
struct TextParser;

impl AssetParser for TextParser {
    fn is_asset_path(&self, path: &Path) -> bool {
        path.extension().map(|ext| ext == "trk").unwrap_or(false)
    }

    fn parse(&self, path: &Path) -> Result<Asset, MetadataError> {
        let text = fs::read_to_string(path)?;
        if text.contains("!fail") {
            return Err(MetadataError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "unreadable tags",
            )));
        }
        if text.contains("!panic") {
            panic!("tag reader crashed on {:?}", path);
        }
        let mut asset = Asset::new(path);
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.to_string();
            match key {
                "name" => asset.name = Some(value),
                "artist" => asset.artist = Some(value),
                "album_artist" => asset.album_artist = Some(value),
                "album" => asset.album = Some(value),
                "genre" => asset.genre = Some(value),
                "track" => asset.track_number = value.parse().ok(),
                "disc" => asset.disc_number = value.parse().ok(),
                "compilation" => asset.compilation = value == "1",
                _ => {}
            }
        }
        Ok(asset)
    }

    fn extract_artwork(&self, _path: &Path) -> Result<Option<CoverArt>, MetadataError> {
        Ok(None)
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    store: AssetStore,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            store: AssetStore::default(),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root().join(rel)
    }

    /// Writes a track that predates any scan.
    fn add(&self, rel: &str, album: &str, artist: &str, track: u32) {
        self.write(
            rel,
            &format!("name=Track {}\nartist={}\nalbum={}\ntrack={}\n", track, artist, album, track),
            SystemTime::now() - Duration::from_secs(3600),
        );
    }

    /// Rewrites a track with a modification time after the last scan.
    fn touch(&self, rel: &str, contents: &str) {
        self.write(rel, contents, SystemTime::now() + Duration::from_secs(3600));
    }

    fn write(&self, rel: &str, contents: &str, modified: SystemTime) {
        let path = self.path(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
    }

    fn remove(&self, rel: &str) {
        fs::remove_file(self.path(rel)).unwrap();
    }

    fn run(&mut self) -> Refresh {
        let root = self.dir.path().to_path_buf();
        refresh(&mut self.store, &root, &TextParser, &LibraryParser::default(), 4).unwrap()
    }
}

fn album_id(library: &Library, title: &str) -> Option<u32> {
    library
        .albums()
        .iter()
        .find(|album| album.title.as_deref() == Some(title))
        .and_then(|album| album.album_id)
}

fn changed_titles(refresh: &Refresh) -> BTreeSet<String> {
    refresh
        .changed
        .iter()
        .filter_map(|&index| refresh.library.albums()[index].title.clone())
        .collect()
}

#[test]
fn unchanged_library_reports_no_changes_on_second_run() {
    let mut fixture = Fixture::new();
    fixture.add("A/Q/1.trk", "Q", "A", 1);
    fixture.add("A/Q/2.trk", "Q", "A", 2);
    fixture.add("B/R/1.trk", "R", "B", 1);

    let first = fixture.run();
    assert_eq!(first.stats.parsed, 3);
    assert_eq!(first.changed.len(), 2);

    let second = fixture.run();
    assert_eq!(second.stats.reused, 3);
    assert_eq!(second.stats.parsed, 0);
    assert!(second.changed.is_empty());
    assert_eq!(album_id(&first.library, "Q"), album_id(&second.library, "Q"));
    assert_eq!(album_id(&first.library, "R"), album_id(&second.library, "R"));
}

#[test]
fn retagging_genre_keeps_album_id() {
    let mut fixture = Fixture::new();
    fixture.add("A/Q/1.trk", "Q", "A", 1);
    fixture.add("A/Q/2.trk", "Q", "A", 2);
    fixture.add("B/R/1.trk", "R", "B", 1);
    let first = fixture.run();

    fixture.touch("A/Q/2.trk", "name=Track 2\nartist=A\nalbum=Q\ntrack=2\ngenre=Jazz\n");
    let second = fixture.run();

    assert_eq!(second.stats.parsed, 1);
    assert_eq!(album_id(&first.library, "Q"), album_id(&second.library, "Q"));
    assert_eq!(album_id(&first.library, "R"), album_id(&second.library, "R"));
    assert_eq!(changed_titles(&second), BTreeSet::from(["Q".to_string()]));
    let asset = fixture.store.asset(&fixture.path("A/Q/2.trk")).unwrap();
    assert_eq!(asset.genre.as_deref(), Some("Jazz"));
}

#[test]
fn album_ids_are_unique_per_run() {
    let mut fixture = Fixture::new();
    for (album, artist) in [("One", "A"), ("Two", "A"), ("Three", "B"), ("Four", "C")] {
        for track in 1..=3 {
            fixture.add(&format!("{}/{}/{}.trk", artist, album, track), album, artist, track);
        }
    }

    let result = fixture.run();

    let ids: BTreeSet<u32> = result
        .library
        .albums()
        .iter()
        .map(|album| album.album_id.unwrap())
        .collect();
    assert_eq!(result.library.albums().len(), 4);
    assert_eq!(ids.len(), 4);
}

#[test]
fn freed_album_id_is_reported_when_reclaimed() {
    let mut fixture = Fixture::new();
    fixture.add("a/1.trk", "Alpha", "X", 1);
    fixture.add("b/1.trk", "Beta", "Y", 1);
    let first = fixture.run();
    let alpha = album_id(&first.library, "Alpha").unwrap();

    fixture.remove("a/1.trk");
    fixture.add("c/1.trk", "Gamma", "Z", 1);
    let second = fixture.run();

    assert_eq!(second.stats.deleted, 1);
    assert_eq!(album_id(&second.library, "Gamma"), Some(alpha));
    assert!(changed_titles(&second).contains("Gamma"));
    assert!(!changed_titles(&second).contains("Beta"));
    assert_eq!(second.freed_album_ids, BTreeSet::from([alpha]));
    assert!(fixture.store.tombstones().is_empty());
}

#[test]
fn deleting_last_track_frees_its_album_id() {
    let mut fixture = Fixture::new();
    fixture.add("a/1.trk", "Alpha", "X", 1);
    fixture.add("b/1.trk", "Beta", "Y", 1);
    fixture.add("b/2.trk", "Beta", "Y", 2);
    let first = fixture.run();
    let alpha = album_id(&first.library, "Alpha").unwrap();

    fixture.remove("a/1.trk");
    let second = fixture.run();

    assert!(fixture.store.asset(&fixture.path("a/1.trk")).is_none());
    assert_eq!(fixture.store.len(), 2);
    assert!(second.library.albums().iter().all(|a| a.title.as_deref() != Some("Alpha")));
    assert!(second.changed.is_empty());
    assert_eq!(second.freed_album_ids, BTreeSet::from([alpha]));
    for path in ["b/1.trk", "b/2.trk"] {
        let entity = fixture.store.entity(&fixture.path(path)).unwrap();
        assert_ne!(entity.album_id, Some(alpha));
    }

    let third = fixture.run();
    assert!(third.freed_album_ids.is_empty());
}

#[test]
fn parse_failures_are_skipped_without_failing_the_run() {
    let mut fixture = Fixture::new();
    fixture.add("a/1.trk", "Alpha", "X", 1);
    fixture.write("a/2.trk", "!fail", SystemTime::now() - Duration::from_secs(3600));

    let result = fixture.run();

    assert_eq!(result.stats.scanned, 2);
    assert_eq!(result.stats.parsed, 1);
    assert_eq!(result.stats.failed, 1);
    assert!(fixture.store.asset(&fixture.path("a/2.trk")).is_none());
    assert_eq!(result.library.tracks().len(), 1);
}

#[test]
fn failed_reparse_of_known_file_is_not_counted_as_deleted() {
    let mut fixture = Fixture::new();
    fixture.add("a/1.trk", "Alpha", "X", 1);
    fixture.add("a/2.trk", "Alpha", "X", 2);
    fixture.run();

    fixture.touch("a/2.trk", "!fail");
    let second = fixture.run();

    assert_eq!(second.stats.failed, 1);
    assert_eq!(second.stats.deleted, 0);
    assert_eq!(fixture.store.len(), 1);
}

#[test]
fn panicking_parser_only_loses_the_offending_file() {
    let mut fixture = Fixture::new();
    for track in 1..=10 {
        fixture.add(&format!("a/{:02}.trk", track), "Alpha", "X", track);
    }
    let first = fixture.run();
    let alpha = album_id(&first.library, "Alpha");

    for track in 1..=10 {
        let contents = if track == 5 {
            "!panic".to_string()
        } else {
            format!("name=Track {}\nartist=X\nalbum=Alpha\ntrack={}\n", track, track)
        };
        fixture.touch(&format!("a/{:02}.trk", track), &contents);
    }
    let second = fixture.run();

    assert_eq!(second.stats.parsed, 9);
    assert_eq!(second.stats.failed, 1);
    assert_eq!(second.stats.deleted, 0);
    assert_eq!(fixture.store.len(), 9);
    assert!(fixture.store.asset(&fixture.path("a/05.trk")).is_none());
    assert_eq!(album_id(&second.library, "Alpha"), alpha);
}

#[test]
fn hidden_entries_and_foreign_files_are_ignored() {
    let mut fixture = Fixture::new();
    fixture.add("a/1.trk", "Alpha", "X", 1);
    fixture.add(".cache/1.trk", "Hidden", "X", 1);
    fixture.add("a/.2.trk", "Alpha", "X", 2);
    fixture.write("a/cover.jpg", "jpeg", SystemTime::now());

    let result = fixture.run();

    assert_eq!(result.stats.scanned, 1);
    assert_eq!(fixture.store.len(), 1);
}

#[test]
fn many_files_are_parsed_across_batches() {
    let mut fixture = Fixture::new();
    for track in 1..=57 {
        fixture.add(&format!("big/{:02}.trk", track), "Big", "X", track);
    }

    let first = fixture.run();
    assert_eq!(first.stats.parsed, 57);
    assert_eq!(first.library.albums().len(), 1);
    assert_eq!(first.library.albums()[0].tracks.len(), 57);

    let second = fixture.run();
    assert_eq!(second.stats.reused, 57);
    assert!(second.changed.is_empty());
}

#[test]
fn persisted_store_carries_ids_into_the_next_process() {
    let mut fixture = Fixture::new();
    fixture.add("a/1.trk", "Alpha", "X", 1);
    fixture.add("b/1.trk", "Beta", "Y", 1);
    let first = fixture.run();

    let locator = RootLocator::new(fixture.root());
    let store_path = fixture.path(".state/store.json");
    fixture.store.save_to_path(&store_path, &locator).unwrap();

    fixture.store = AssetStore::open(&store_path, &locator);
    let second = fixture.run();

    assert_eq!(second.stats.reused, 2);
    assert!(second.changed.is_empty());
    assert_eq!(album_id(&first.library, "Alpha"), album_id(&second.library, "Alpha"));
    assert_eq!(album_id(&first.library, "Beta"), album_id(&second.library, "Beta"));
}

#[test]
fn compilation_tracks_are_grouped_under_their_artist() {
    let mut fixture = Fixture::new();
    for track in 1..=3 {
        fixture.write(
            &format!("mix/{}.trk", track),
            &format!("name=Song {}\nartist=X\nalbum=Mix\ncompilation=1\ntrack={}\n", track, track),
            SystemTime::now() - Duration::from_secs(3600),
        );
    }

    let result = fixture.run();

    assert_eq!(result.library.albums().len(), 1);
    assert_eq!(result.library.albums()[0].artist.as_deref(), Some("X"));
    assert!(result.library.album_artist(None).is_none());
}

#[test]
fn missing_root_is_an_error_and_keeps_the_store() {
    let mut fixture = Fixture::new();
    fixture.add("a/1.trk", "Alpha", "X", 1);
    fixture.run();

    let missing = fixture.path("does-not-exist");
    let err = fixture
        .store
        .update(&missing, &TextParser, 2)
        .unwrap_err();

    assert!(matches!(err, LibraryError::MissingRoot(_)));
    assert_eq!(fixture.store.len(), 1);
}
