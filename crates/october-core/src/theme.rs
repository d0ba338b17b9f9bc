//! # Themes and Datasources
//!
//! A theme is a directory of pages, layouts, partials and content files,
//! optionally inheriting from a parent theme. Objects are read through a
//! `Datasource`, which lets tests and embedders serve themes from memory.
//!
//! Parsed objects are cached through `CmsCache`, keyed by theme and
//! object path, and revalidated against the file's modification time.

use crate::cache::CmsCache;
use crate::object::CompoundObject;
use crate::primitives::{DEFAULT_EXTENSION, MAX_OBJECT_SIZE};
use crate::{CmsError, ObjectKind};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, UNIX_EPOCH};

/// Deepest parent-theme chain followed.
const MAX_PARENT_DEPTH: usize = 4;

/// Extensions a theme object may have.
const ALLOWED_EXTENSIONS: &[&str] = &["htm", "html", "txt", "md"];

// =============================================================================
// DATASOURCE
// =============================================================================

/// Raw file content with its modification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub content: String,
    pub mtime: u64,
}

/// Where theme objects come from.
pub trait Datasource: Send + Sync + fmt::Debug {
    /// File names (relative to the kind's directory) of every object.
    fn list(&self, kind: ObjectKind) -> Result<Vec<String>, CmsError>;

    /// Modification time, or `None` when the file does not exist.
    fn mtime(&self, kind: ObjectKind, file_name: &str) -> Result<Option<u64>, CmsError>;

    fn read(&self, kind: ObjectKind, file_name: &str) -> Result<Option<SourceFile>, CmsError>;
}

/// Reject names that could escape the theme directory.
fn validate_file_name(file_name: &str) -> Result<(), CmsError> {
    let path = Path::new(file_name);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    let extension_ok = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| ALLOWED_EXTENSIONS.contains(&e));

    if file_name.is_empty() || escapes || !extension_ok {
        return Err(CmsError::InvalidPartialName(file_name.to_string()));
    }
    Ok(())
}

/// Append the default extension when a name has none.
#[must_use]
pub fn normalize_file_name(name: &str) -> String {
    let name = name.trim().trim_start_matches('/');
    if Path::new(name).extension().is_some() {
        name.to_string()
    } else {
        format!("{}.{}", name, DEFAULT_EXTENSION)
    }
}

/// Reads objects from one or more theme directories.
///
/// Roots are searched in order, so a child theme's files shadow its
/// parent's.
#[derive(Debug, Clone)]
pub struct FileDatasource {
    roots: Vec<PathBuf>,
}

impl FileDatasource {
    #[must_use]
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    fn locate(&self, kind: ObjectKind, file_name: &str) -> Result<Option<PathBuf>, CmsError> {
        validate_file_name(file_name)?;
        Ok(self
            .roots
            .iter()
            .map(|root| root.join(kind.dir_name()).join(file_name))
            .find(|p| p.is_file()))
    }

    fn collect(dir: &Path, prefix: &str, out: &mut BTreeSet<String>) -> Result<(), CmsError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CmsError::Io(format!("{}: {}", dir.display(), e))),
        };
        for entry in entries {
            let entry = entry.map_err(|e| CmsError::Io(e.to_string()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let relative = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            let path = entry.path();
            if path.is_dir() {
                Self::collect(&path, &relative, out)?;
            } else if validate_file_name(&relative).is_ok() {
                out.insert(relative);
            }
        }
        Ok(())
    }
}

fn file_mtime(path: &Path) -> Result<u64, CmsError> {
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| CmsError::Io(format!("{}: {}", path.display(), e)))?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0))
}

impl Datasource for FileDatasource {
    fn list(&self, kind: ObjectKind) -> Result<Vec<String>, CmsError> {
        let mut names = BTreeSet::new();
        for root in &self.roots {
            Self::collect(&root.join(kind.dir_name()), "", &mut names)?;
        }
        Ok(names.into_iter().collect())
    }

    fn mtime(&self, kind: ObjectKind, file_name: &str) -> Result<Option<u64>, CmsError> {
        match self.locate(kind, file_name)? {
            Some(path) => file_mtime(&path).map(Some),
            None => Ok(None),
        }
    }

    fn read(&self, kind: ObjectKind, file_name: &str) -> Result<Option<SourceFile>, CmsError> {
        let Some(path) = self.locate(kind, file_name)? else {
            return Ok(None);
        };
        let size = std::fs::metadata(&path)
            .map(|m| m.len())
            .map_err(|e| CmsError::Io(e.to_string()))?;
        if size > MAX_OBJECT_SIZE {
            return Err(CmsError::Io(format!(
                "{} is {} bytes, above the {} byte limit",
                path.display(),
                size,
                MAX_OBJECT_SIZE
            )));
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| CmsError::Io(format!("{}: {}", path.display(), e)))?;
        Ok(Some(SourceFile {
            content,
            mtime: file_mtime(&path)?,
        }))
    }
}

/// In-memory datasource for tests and embedded themes.
///
/// Every write bumps a logical clock used as modification time.
#[derive(Debug, Default)]
pub struct MemoryDatasource {
    files: RwLock<BTreeMap<(ObjectKind, String), SourceFile>>,
    clock: AtomicU64,
}

impl MemoryDatasource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(self, kind: ObjectKind, file_name: &str, content: &str) -> Self {
        self.put(kind, file_name, content);
        self
    }

    pub fn put(&self, kind: ObjectKind, file_name: &str, content: &str) {
        let mtime = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        files.insert(
            (kind, file_name.to_string()),
            SourceFile {
                content: content.to_string(),
                mtime,
            },
        );
    }

    pub fn remove(&self, kind: ObjectKind, file_name: &str) -> bool {
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        files.remove(&(kind, file_name.to_string())).is_some()
    }

    fn files(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<(ObjectKind, String), SourceFile>> {
        self.files.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Datasource for MemoryDatasource {
    fn list(&self, kind: ObjectKind) -> Result<Vec<String>, CmsError> {
        Ok(self
            .files()
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect())
    }

    fn mtime(&self, kind: ObjectKind, file_name: &str) -> Result<Option<u64>, CmsError> {
        Ok(self
            .files()
            .get(&(kind, file_name.to_string()))
            .map(|f| f.mtime))
    }

    fn read(&self, kind: ObjectKind, file_name: &str) -> Result<Option<SourceFile>, CmsError> {
        Ok(self.files().get(&(kind, file_name.to_string())).cloned())
    }
}

// =============================================================================
// THEME
// =============================================================================

/// Contents of `theme.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ThemeConfig {
    pub name: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub homepage: Option<String>,
    /// Directory name of the parent theme.
    pub parent: Option<String>,
}

impl ThemeConfig {
    fn load(dir: &Path) -> Result<Self, CmsError> {
        let path = dir.join("theme.toml");
        if !path.is_file() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| CmsError::Io(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&text)
            .map_err(|e| CmsError::Config(format!("{}: {}", path.display(), e)))
    }
}

/// A loaded theme.
#[derive(Debug, Clone)]
pub struct Theme {
    dir_name: String,
    path: PathBuf,
    config: ThemeConfig,
    datasource: Arc<dyn Datasource>,
    key: String,
}

impl Theme {
    /// Load `themes_path/dir_name`, chaining parent themes.
    pub fn load(themes_path: &Path, dir_name: &str) -> Result<Self, CmsError> {
        let path = themes_path.join(dir_name);
        if !path.is_dir() {
            return Err(CmsError::ThemeNotFound(dir_name.to_string()));
        }
        let config = ThemeConfig::load(&path)?;

        let mut roots = vec![path.clone()];
        let mut parent = config.parent.clone();
        while let Some(parent_name) = parent.take() {
            if roots.len() > MAX_PARENT_DEPTH {
                tracing::warn!(theme = dir_name, "parent theme chain too deep, truncating");
                break;
            }
            let parent_path = themes_path.join(&parent_name);
            if roots.contains(&parent_path) || !parent_path.is_dir() {
                tracing::warn!(theme = dir_name, parent = %parent_name, "ignoring parent theme");
                break;
            }
            parent = ThemeConfig::load(&parent_path)?.parent;
            roots.push(parent_path);
        }

        Ok(Self::with_datasource(
            dir_name,
            path,
            config,
            Arc::new(FileDatasource::new(roots)),
        ))
    }

    /// Build a theme over any datasource.
    #[must_use]
    pub fn with_datasource(
        dir_name: &str,
        path: PathBuf,
        config: ThemeConfig,
        datasource: Arc<dyn Datasource>,
    ) -> Self {
        let key = CmsCache::theme_key(&path);
        Self {
            dir_name: dir_name.to_string(),
            path,
            config,
            datasource,
            key,
        }
    }

    #[must_use]
    pub fn dir_name(&self) -> &str {
        &self.dir_name
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn config(&self) -> &ThemeConfig {
        &self.config
    }

    #[must_use]
    pub fn datasource(&self) -> &dyn Datasource {
        self.datasource.as_ref()
    }

    /// Cache namespace derived from the theme path.
    #[must_use]
    pub fn cache_key(&self) -> &str {
        &self.key
    }

    /// File names of every page.
    pub fn list_pages(&self) -> Result<Vec<String>, CmsError> {
        self.datasource.list(ObjectKind::Page)
    }

    /// Load a compound object, using the object cache when fresh.
    pub fn find(
        &self,
        kind: ObjectKind,
        name: &str,
        cache: &CmsCache,
        ttl: Duration,
    ) -> Result<Option<CompoundObject>, CmsError> {
        let file_name = normalize_file_name(name);
        let Some(mtime) = self.datasource.mtime(kind, &file_name)? else {
            return Ok(None);
        };

        let key = format!("{}object:{}/{}", self.key, kind.dir_name(), file_name);
        if let Some(cached) = cache.get_json::<CompoundObject>(&key) {
            if cached.mtime() == mtime {
                return Ok(Some(cached));
            }
        }

        let Some(source) = self.datasource.read(kind, &file_name)? else {
            return Ok(None);
        };
        let object = CompoundObject::parse(kind, file_name, &source.content, source.mtime);
        cache.put_json(&key, &object, ttl);
        Ok(Some(object))
    }

    /// Raw text of a content file.
    pub fn find_content(&self, name: &str) -> Result<Option<SourceFile>, CmsError> {
        let file_name = normalize_file_name(name);
        self.datasource.read(ObjectKind::Content, &file_name)
    }

    /// Attributes visible to templates as `this.theme`.
    #[must_use]
    pub fn template_attributes(&self) -> serde_json::Value {
        serde_json::json!({
            "dirName": self.dir_name,
            "name": self.config.name.clone().unwrap_or_else(|| self.dir_name.clone()),
            "description": self.config.description,
            "author": self.config.author,
            "homepage": self.config.homepage,
        })
    }

    /// Location of the baked route manifest under `storage_path`.
    #[must_use]
    pub fn manifest_path(&self, storage_path: &Path) -> PathBuf {
        storage_path
            .join("cms")
            .join("manifest")
            .join(format!("{}.routes", self.key))
    }
}

// =============================================================================
// TESTS
// =============================================================================
