use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::sync::{Mutex, PoisonError};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::component::models::Category;
use crate::paths::ComponentPaths;

const BOTTLE_CONFIG: &str = "bottle.json";

/// The slice of a bottle's configuration that references components.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BottleConfig {
    #[serde(default, alias = "Name")]
    pub name: String,
    #[serde(default, alias = "Runner")]
    pub runner: String,
    #[serde(default, alias = "DXVK")]
    pub dxvk: String,
    #[serde(default, alias = "VKD3D")]
    pub vkd3d: String,
    #[serde(default, alias = "NVAPI")]
    pub nvapi: String,
    #[serde(default, alias = "LatencyFleX")]
    pub latencyflex: String,
}

impl BottleConfig {
    /// Component name this bottle selects for `category`, if the category is per-bottle.
    pub fn selection(&self, category: Category) -> Option<&str> {
        let value = match category {
            Category::Runner | Category::RunnerProton => &self.runner,
            Category::Dxvk => &self.dxvk,
            Category::Vkd3d => &self.vkd3d,
            Category::Nvapi => &self.nvapi,
            Category::LatencyFlex => &self.latencyflex,
            Category::Runtime | Category::WineBridge => return None,
        };
        Some(value.as_str()).filter(|v| !v.is_empty())
    }
}

/// Owner of the bottles and of the installed-component sets.
///
/// The re-scan hooks are idempotent and cheap enough to call after every install.
pub trait EnvironmentManager: Send + Sync {
    fn local_bottles(&self) -> BTreeMap<String, BottleConfig>;
    fn installed_components(&self, category: Category) -> Vec<String>;
    fn check_components(&self, category: Category);
    fn organize_components(&self);
}

/// Environment manager backed by the data directory itself.
#[derive(Debug)]
pub struct LocalEnvironments {
    paths: ComponentPaths,
    installed: Mutex<BTreeMap<&'static str, Vec<String>>>,
}

impl LocalEnvironments {
    pub fn new(paths: ComponentPaths) -> Self {
        let manager = Self {
            paths,
            installed: Mutex::new(BTreeMap::new()),
        };
        for category in Category::ALL {
            manager.check_components(category);
        }
        manager.organize_components();
        manager
    }
}

impl EnvironmentManager for LocalEnvironments {
    fn local_bottles(&self) -> BTreeMap<String, BottleConfig> {
        let mut bottles = BTreeMap::new();
        let Ok(entries) = fs::read_dir(self.paths.bottles_dir()) else {
            return bottles;
        };
        for entry in entries.flatten() {
            let config_path = entry.path().join(BOTTLE_CONFIG);
            let Ok(contents) = fs::read_to_string(&config_path) else {
                continue;
            };
            match serde_json::from_str::<BottleConfig>(&contents) {
                Ok(mut config) => {
                    let key = entry.file_name().to_string_lossy().into_owned();
                    if config.name.is_empty() {
                        config.name = key.clone();
                    }
                    bottles.insert(key, config);
                }
                Err(err) => warn!("environments: {} parse error: {err}", config_path.display()),
            }
        }
        bottles
    }

    fn installed_components(&self, category: Category) -> Vec<String> {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(category.root_dir_name())
            .cloned()
            .unwrap_or_default()
    }

    fn check_components(&self, category: Category) {
        let root = self.paths.category_root(category);
        let mut names: Vec<String> = fs::read_dir(&root)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        debug!(
            "environments: {} holds {} components",
            root.display(),
            names.len()
        );
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(category.root_dir_name(), names);
    }

    fn organize_components(&self) {
        let mut installed = self
            .installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for names in installed.values_mut() {
            names.sort_by(|a, b| natural_cmp(b, a));
        }
    }
}

/// Compare names with embedded numbers by value, so `dxvk-2.10` sorts after `dxvk-2.9`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();
    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let take_number = |it: &mut std::iter::Peekable<std::str::Chars<'_>>| {
                    let mut digits = String::new();
                    while let Some(c) = it.peek().copied().filter(char::is_ascii_digit) {
                        digits.push(c);
                        it.next();
                    }
                    digits
                };
                let ln = take_number(&mut left);
                let rn = take_number(&mut right);
                let ln = ln.trim_start_matches('0');
                let rn = rn.trim_start_matches('0');
                let ordering = ln.len().cmp(&rn.len()).then_with(|| ln.cmp(rn));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(l), Some(r)) => {
                if l != r {
                    return l.cmp(&r);
                }
                left.next();
                right.next();
            }
        }
    }
}
