use std::path::Path;

use common::Asset;
use lofty::error::LoftyError;
use lofty::picture::{Picture, PictureType};
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};

const ASSET_EXTENSIONS: &[&str] = &["mp3", "m4a", "m4b", "mp4", "flac"];

#[derive(Debug, Clone)]
pub struct CoverArt {
    pub data: Vec<u8>,
    pub mime: Option<String>,
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

/// Turns files into [`Asset`]s. Implementations are shared across scan workers.
pub trait AssetParser: Send + Sync {
    fn is_asset_path(&self, path: &Path) -> bool;

    fn parse(&self, path: &Path) -> Result<Asset, MetadataError>;

    fn extract_artwork(&self, path: &Path) -> Result<Option<CoverArt>, MetadataError>;
}

/// Tag reader for MP3, MP4/M4A and FLAC files.
#[derive(Debug, Default, Clone, Copy)]
pub struct TagParser;

impl AssetParser for TagParser {
    fn is_asset_path(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .map(|ext| ASSET_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false)
    }

    fn parse(&self, path: &Path) -> Result<Asset, MetadataError> {
        let tagged_file = lofty::read_from_path(path)?;
        let properties = tagged_file.properties();

        let mut asset = Asset::new(path);

        let duration_ms = properties.duration().as_millis();
        if duration_ms > 0 {
            asset.duration = Some(duration_ms.min(u128::from(u32::MAX)) as u32);
        }

        if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
            let text = |key: &ItemKey| tag.get_string(key).map(|v| v.to_string());
            asset.name = text(&ItemKey::TrackTitle);
            asset.artist = text(&ItemKey::TrackArtist);
            asset.album_artist = text(&ItemKey::AlbumArtist);
            asset.album = text(&ItemKey::AlbumTitle);
            asset.composer = text(&ItemKey::Composer);
            asset.grouping = text(&ItemKey::ContentGroup);
            asset.genre = tag.get_string(&ItemKey::Genre).and_then(first_genre);
            asset.track_number = tag.get_string(&ItemKey::TrackNumber).and_then(parse_number);
            asset.disc_number = tag.get_string(&ItemKey::DiscNumber).and_then(parse_number);
            asset.year = tag.get_string(&ItemKey::Year).and_then(parse_year);
            asset.compilation = tag
                .get_string(&ItemKey::FlagCompilation)
                .map(parse_flag)
                .unwrap_or(false);
            asset.artwork_available = !tag.pictures().is_empty();
        }

        Ok(asset)
    }

    fn extract_artwork(&self, path: &Path) -> Result<Option<CoverArt>, MetadataError> {
        let tagged_file = lofty::read_from_path(path)?;
        let tag = match tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
            Some(tag) => tag,
            None => return Ok(None),
        };

        let picture = match pick_picture(tag.pictures()) {
            Some(picture) => picture,
            None => return Ok(None),
        };

        let data = picture.data().to_vec();
        let mime = guess_mime(&data);
        Ok(Some(CoverArt { data, mime }))
    }
}

fn parse_number(text: &str) -> Option<u32> {
    let head = text.split('/').next().unwrap_or(text).trim();
    head.parse().ok()
}

fn parse_year(text: &str) -> Option<i32> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() == 4 {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn parse_flag(text: &str) -> bool {
    let value = text.trim();
    value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
}

// Multi-valued genre fields keep only their first entry.
fn first_genre(text: &str) -> Option<String> {
    text.split(&[';', '/', '|', '\0'][..])
        .map(str::trim)
        .find(|part| !part.is_empty())
        .map(str::to_string)
}

fn pick_picture(pictures: &[Picture]) -> Option<&Picture> {
    for picture in pictures {
        if picture.pic_type() == PictureType::CoverFront {
            return Some(picture);
        }
    }
    pictures.first()
}

fn guess_mime(bytes: &[u8]) -> Option<String> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg".to_string())
    } else if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        Some("image/png".to_string())
    } else {
        None
    }
}
