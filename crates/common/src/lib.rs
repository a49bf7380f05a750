use std::path::{Component, Path, PathBuf};

/// Flat tag snapshot of one audio file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Asset {
    pub resource: PathBuf,
    pub name: Option<String>,
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub composer: Option<String>,
    pub grouping: Option<String>,
    /// Milliseconds.
    pub duration: Option<u32>,
    pub disc_number: Option<u32>,
    pub track_number: Option<u32>,
    pub year: Option<i32>,
    pub compilation: bool,
    pub artwork_available: bool,
}

impl Asset {
    pub fn new(resource: impl Into<PathBuf>) -> Self {
        Self {
            resource: resource.into(),
            ..Self::default()
        }
    }
}

/// Maps resources to portable strings that survive a move of the music root, and back.
pub trait AssetLocator {
    fn asset_path(&self, resource: &Path) -> Option<String>;
    fn resource(&self, asset_path: &str) -> Option<PathBuf>;
}

#[derive(Clone, Debug)]
pub struct RootLocator {
    root: PathBuf,
}

impl RootLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AssetLocator for RootLocator {
    fn asset_path(&self, resource: &Path) -> Option<String> {
        let rel = relpath_from(&self.root, resource)?;
        if rel.is_empty() {
            None
        } else {
            Some(rel)
        }
    }

    fn resource(&self, asset_path: &str) -> Option<PathBuf> {
        let rel = Path::new(asset_path);
        if asset_path.trim().is_empty() || rel.is_absolute() {
            return None;
        }
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }
        Some(join_relpath(&self.root, asset_path))
    }
}

pub fn relpath_from(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(path_to_slash_string(rel))
}

pub fn join_relpath(root: &Path, relpath: &str) -> PathBuf {
    let mut out = PathBuf::from(root);
    for part in relpath.split('/') {
        if part.is_empty() {
            continue;
        }
        out.push(part);
    }
    out
}

fn path_to_slash_string(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    parts.join("/")
}
