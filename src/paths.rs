use std::fs;
use std::path::PathBuf;

use crate::component::models::Category;

const TEMP_DIR: &str = "temp";
const BOTTLES_DIR: &str = "bottles";

/// Maps component names to their on-disk locations under one data root.
#[derive(Clone, Debug)]
pub struct ComponentPaths {
    root: PathBuf,
}

impl ComponentPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Shared staging directory where archives land before extraction.
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    pub fn staged_file(&self, file_name: &str) -> PathBuf {
        self.temp_dir().join(file_name)
    }

    pub fn bottles_dir(&self) -> PathBuf {
        self.root.join(BOTTLES_DIR)
    }

    pub fn category_root(&self, category: Category) -> PathBuf {
        self.root.join(category.root_dir_name())
    }

    /// Directory an archive of `category` is unpacked into.
    pub fn extraction_root(&self, category: Category, name: &str) -> PathBuf {
        let root = self.category_root(category);
        if category.nests_by_name() {
            root.join(name)
        } else {
            root
        }
    }

    /// Installation path of a component. Runner binaries (`bin/wine`) are resolved by consumers.
    pub fn component_path(&self, category: Category, name: &str) -> PathBuf {
        self.category_root(category).join(name)
    }

    /// Create the on-disk folder layout expected by the manager.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        let mut folders = vec![self.root.clone(), self.temp_dir(), self.bottles_dir()];
        folders.extend(Category::ALL.into_iter().map(|c| self.category_root(c)));
        for dir in folders {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
