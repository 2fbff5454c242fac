//! Reference images for named UI elements.
//!
//! Templates live in a flat directory as `<name>.png` or
//! `<name>_<width>x<height>.png`, next to a `manifest.json` that records
//! which file belongs to which element and the resolution they were captured
//! at.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use image::RgbImage;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::capture::{FrameSource, Region};

/// File extensions recognized as templates, in lookup order.
pub const TEMPLATE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Manifest file name inside the templates directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// A screen resolution tag such as `1920x1080`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// `WIDTHxHEIGHT`, as used in template file suffixes and the manifest.
const RESOLUTION_PATTERN: &str = r"^(\d{1,5})x(\d{1,5})$";

impl FromStr for Resolution {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let caps = Regex::new(RESOLUTION_PATTERN)?
            .captures(s.trim())
            .ok_or_else(|| anyhow!("Invalid resolution '{}', expected WIDTHxHEIGHT", s))?;
        let width: u32 = caps[1].parse()?;
        let height: u32 = caps[2].parse()?;
        if width == 0 || height == 0 {
            return Err(anyhow!("Resolution '{}' has a zero dimension", s));
        }
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A loaded reference image.
#[derive(Debug)]
pub struct Template {
    name: String,
    resolution: Option<Resolution>,
    image: RgbImage,
    path: PathBuf,
}

impl Template {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Contents of `manifest.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub resolution: Option<Resolution>,
    /// Template name to file name (relative to the templates directory).
    pub templates: BTreeMap<String, String>,
    pub captured_at: Option<DateTime<Local>>,
}

impl Manifest {
    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }
}

/// Missing or broken template setup, detected before a session starts.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("template manifest not found at {0}; run calibration first")]
    ManifestMissing(PathBuf),
    #[error("failed to read template manifest {path}: {reason}")]
    ManifestUnreadable { path: PathBuf, reason: String },
    #[error("required template '{0}' is not listed in the manifest")]
    TemplateNotListed(String),
    #[error("template file for '{name}' is missing: {path}")]
    TemplateFileMissing { name: String, path: PathBuf },
}

/// Loads templates from disk and caches them for the process lifetime.
pub struct TemplateLibrary {
    dir: PathBuf,
    cache: HashMap<String, Arc<Template>>,
    warned: HashSet<String>,
}

impl TemplateLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: HashMap::new(),
            warned: HashSet::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn is_cached(&self, name: &str) -> bool {
        self.cache.contains_key(name)
    }

    /// Returns the template, loading it on first use.
    ///
    /// A template that cannot be found is reported once as a warning; later
    /// misses are traced at debug level and discovery is retried every call.
    pub fn get(&mut self, name: &str) -> Option<Arc<Template>> {
        if let Some(template) = self.cache.get(name) {
            return Some(Arc::clone(template));
        }

        let Some((path, resolution)) = self.discover(name) else {
            if self.warned.insert(name.to_string()) {
                log::warn!("Template not found: {} (in {})", name, self.dir.display());
            } else {
                log::debug!("Template still missing: {}", name);
            }
            return None;
        };

        let image = match image::open(&path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                log::warn!("Failed to load template {}: {}", path.display(), e);
                return None;
            }
        };
        if image.width() == 0 || image.height() == 0 {
            log::warn!("Template {} is empty", path.display());
            return None;
        }

        log::debug!(
            "Loaded template '{}' ({}x{}) from {}",
            name,
            image.width(),
            image.height(),
            path.display()
        );
        self.warned.remove(name);
        let template = Arc::new(Template {
            name: name.to_string(),
            resolution,
            image,
            path,
        });
        self.cache.insert(name.to_string(), Arc::clone(&template));
        Some(template)
    }

    /// Finds the file backing `name`.
    ///
    /// Order: the manifest entry, `<name>.<ext>`, then `<name>_<W>x<H>.<ext>`
    /// (sorted by file name).
    fn discover(&self, name: &str) -> Option<(PathBuf, Option<Resolution>)> {
        if let Ok(manifest) = self.read_manifest() {
            if let Some(file) = manifest.templates.get(name) {
                let path = self.dir.join(file);
                if path.is_file() {
                    let resolution = suffix_resolution(name, &path).or(manifest.resolution);
                    return Some((path, resolution));
                }
            }
        }

        for ext in TEMPLATE_EXTENSIONS {
            let path = self.dir.join(format!("{}.{}", name, ext));
            if path.is_file() {
                return Some((path, None));
            }
        }

        let mut tagged: Vec<(PathBuf, Resolution)> = fs::read_dir(&self.dir)
            .ok()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && has_template_extension(path))
            .filter_map(|path| suffix_resolution(name, &path).map(|res| (path, res)))
            .collect();
        tagged.sort_by(|a, b| a.0.cmp(&b.0));
        tagged.into_iter().next().map(|(path, res)| (path, Some(res)))
    }

    /// Drops every cached template.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
        log::debug!("Template cache cleared");
    }

    /// Writes `image` as the template for `name`, overwriting any previous
    /// file of the same name, and records it in the manifest.
    pub fn save(
        &mut self,
        name: &str,
        image: &RgbImage,
        resolution: Option<Resolution>,
    ) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(anyhow!("Invalid template name '{}'", name));
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let file_name = match resolution {
            Some(res) => format!("{}_{}.png", name, res),
            None => format!("{}.png", name),
        };
        let path = self.dir.join(&file_name);
        image
            .save(&path)
            .with_context(|| format!("Failed to save template {}", path.display()))?;

        self.cache.remove(name);
        self.warned.remove(name);

        let mut manifest = self.read_manifest().unwrap_or_default();
        manifest.templates.insert(name.to_string(), file_name);
        if resolution.is_some() {
            manifest.resolution = resolution;
        }
        manifest.captured_at = Some(Local::now());
        self.write_manifest(&manifest)?;

        log::info!("Saved template: {}", path.display());
        Ok(path)
    }

    /// Captures `region` from the screen and saves it as template `name`.
    pub fn capture_template(
        &mut self,
        source: &FrameSource,
        name: &str,
        region: Region,
        resolution: Option<Resolution>,
    ) -> Result<PathBuf> {
        let frame = source
            .capture(Some(region))
            .ok_or_else(|| anyhow!("Failed to capture template region {}", region))?;
        self.save(name, frame.image(), resolution)
    }

    /// Reads the manifest, or `None` if it is missing or unreadable.
    pub fn manifest(&self) -> Option<Manifest> {
        self.read_manifest().ok()
    }

    fn read_manifest(&self) -> std::result::Result<Manifest, SetupError> {
        let path = self.manifest_path();
        if !path.is_file() {
            return Err(SetupError::ManifestMissing(path));
        }
        let content = fs::read_to_string(&path).map_err(|e| SetupError::ManifestUnreadable {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| SetupError::ManifestUnreadable {
            path,
            reason: e.to_string(),
        })
    }

    pub fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.manifest_path();
        let content = serde_json::to_string_pretty(manifest)?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write manifest {}", path.display()))?;
        Ok(())
    }

    /// Checks that every required template is listed and present on disk.
    pub fn validate<S: AsRef<str>>(&self, required: &[S]) -> std::result::Result<Manifest, SetupError> {
        let manifest = self.read_manifest()?;
        for name in required {
            let name = name.as_ref();
            let file = manifest
                .templates
                .get(name)
                .ok_or_else(|| SetupError::TemplateNotListed(name.to_string()))?;
            let path = self.dir.join(file);
            if !path.is_file() {
                return Err(SetupError::TemplateFileMissing {
                    name: name.to_string(),
                    path,
                });
            }
        }
        Ok(manifest)
    }
}

fn has_template_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| TEMPLATE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Parses `<name>_<W>x<H>` from a file stem.
fn suffix_resolution(name: &str, path: &Path) -> Option<Resolution> {
    let stem = path.file_stem()?.to_str()?;
    let suffix = stem.strip_prefix(name)?.strip_prefix('_')?;
    suffix.parse().ok()
}
