use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ComponentError;

/// The closed set of component kinds the manager knows how to install.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "runner")]
    Runner,
    #[serde(rename = "runner:proton")]
    RunnerProton,
    #[serde(rename = "dxvk")]
    Dxvk,
    #[serde(rename = "vkd3d")]
    Vkd3d,
    #[serde(rename = "nvapi")]
    Nvapi,
    #[serde(rename = "latencyflex")]
    LatencyFlex,
    #[serde(rename = "runtime")]
    Runtime,
    #[serde(rename = "winebridge")]
    WineBridge,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Runner,
        Category::RunnerProton,
        Category::Dxvk,
        Category::Vkd3d,
        Category::Nvapi,
        Category::LatencyFlex,
        Category::Runtime,
        Category::WineBridge,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Runner => "runner",
            Category::RunnerProton => "runner:proton",
            Category::Dxvk => "dxvk",
            Category::Vkd3d => "vkd3d",
            Category::Nvapi => "nvapi",
            Category::LatencyFlex => "latencyflex",
            Category::Runtime => "runtime",
            Category::WineBridge => "winebridge",
        }
    }

    /// Directory name under the data root where this category is installed.
    pub fn root_dir_name(self) -> &'static str {
        match self {
            Category::Runner | Category::RunnerProton => "runners",
            Category::Dxvk => "dxvk",
            Category::Vkd3d => "vkd3d",
            Category::Nvapi => "nvapi",
            Category::LatencyFlex => "latencyflex",
            Category::Runtime => "runtimes",
            Category::WineBridge => "winebridge",
        }
    }

    /// Archives of nested categories are unpacked into `root/<component name>/`.
    pub fn nests_by_name(self) -> bool {
        matches!(self, Category::WineBridge)
    }

    /// Staged archives of ephemeral categories are dropped once installed.
    pub fn is_ephemeral(self) -> bool {
        matches!(self, Category::Runtime | Category::WineBridge)
    }

    /// Shared infrastructure is never selected per bottle, so it is always "in use".
    pub fn is_shared_infrastructure(self) -> bool {
        self.is_ephemeral()
    }

    /// Categories sharing one root directory share one installed set.
    pub fn shares_root_with(self, other: Category) -> bool {
        self.root_dir_name() == other.root_dir_name()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ComponentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Category::ALL
            .into_iter()
            .find(|category| category.as_str() == normalized)
            .or(match normalized.as_str() {
                "runners" | "wine" => Some(Category::Runner),
                "proton" => Some(Category::RunnerProton),
                "runtimes" => Some(Category::Runtime),
                _ => None,
            })
            .ok_or_else(|| ComponentError::UnknownCategory(value.to_owned()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub url: String,
    pub file_name: String,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub rename: Option<String>,
    #[serde(default, alias = "file_checksum", deserialize_with = "empty_as_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

impl ManifestFile {
    /// Name the archive carries in the staging directory once downloaded.
    pub fn staged_name(&self) -> &str {
        self.rename.as_deref().unwrap_or(&self.file_name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum PostInstallAction {
    Rename {
        source: String,
        dest: String,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentManifest {
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(alias = "Category")]
    pub category: Category,
    #[serde(default, alias = "Provider")]
    pub provider: Option<String>,
    #[serde(default, alias = "Channel")]
    pub channel: Option<String>,
    #[serde(alias = "File")]
    pub files: Vec<ManifestFile>,
    #[serde(default, alias = "Post")]
    pub post_install: Vec<PostInstallAction>,
}

impl ComponentManifest {
    /// Only the first file entry is installed; the rest are reserved.
    pub fn primary_file(&self) -> Result<&ManifestFile, ComponentError> {
        self.files
            .first()
            .ok_or_else(|| ComponentError::InvalidManifest {
                name: self.name.clone(),
                reason: "manifest lists no files".into(),
            })
    }
}

/// One row of the raw repository index, before installed state is merged in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(alias = "Category")]
    pub category: Category,
    #[serde(default, alias = "Sub-category", alias = "sub-category")]
    pub sub_category: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

pub type RepositoryIndex = BTreeMap<String, IndexEntry>;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub category: Category,
    pub sub_category: Option<String>,
    pub installed: bool,
    pub fields: BTreeMap<String, Value>,
}

/// Catalog grouped by category, names sorted within each group.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CatalogIndex {
    pub entries: BTreeMap<Category, Vec<CatalogEntry>>,
}

impl CatalogIndex {
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(Vec::is_empty)
    }

    pub fn category(&self, category: Category) -> &[CatalogEntry] {
        self.entries
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Runner entries keyed by their sub-category (`wine`, `proton`, ...).
    pub fn runners_by_sub_category(&self) -> BTreeMap<String, Vec<&CatalogEntry>> {
        let mut grouped: BTreeMap<String, Vec<&CatalogEntry>> = BTreeMap::new();
        for entry in self
            .category(Category::Runner)
            .iter()
            .chain(self.category(Category::RunnerProton))
        {
            let key = entry
                .sub_category
                .clone()
                .unwrap_or_else(|| "other".to_owned());
            grouped.entry(key).or_default().push(entry);
        }
        grouped
    }
}

/// What `install`/`uninstall` hand back to callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub ok: bool,
    pub message: Option<String>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            ok: true,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
        }
    }
}

impl From<ComponentError> for Outcome {
    fn from(err: ComponentError) -> Self {
        Outcome::failure(err.to_string())
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.map(|v| v.trim().to_owned()).filter(|v| !v.is_empty()))
}
