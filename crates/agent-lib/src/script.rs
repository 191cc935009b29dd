//! Pipeline script store
//!
//! Scripts pushed by the configuration source are laid out on disk as
//! `<root>/<category>/<name>.p`. The store reloads the whole tree after
//! every reconciliation pass so inputs started in that pass see the
//! scripts that came with their configuration.

use crate::reconcile::ReloadHook;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tokio::fs;
use tracing::{debug, info};

/// Extension of pipeline script files
pub const SCRIPT_EXTENSION: &str = "p";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ScriptKey {
    category: String,
    name: String,
}

/// In-memory copy of one namespace's pipeline scripts
#[derive(Debug)]
pub struct ScriptStore {
    namespace: String,
    root: PathBuf,
    scripts: RwLock<HashMap<ScriptKey, String>>,
}

impl ScriptStore {
    pub fn new(namespace: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            namespace: namespace.into(),
            root: root.into(),
            scripts: RwLock::new(HashMap::new()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Script content by category and file name (e.g. `("logging", "nginx.p")`)
    pub fn get(&self, category: &str, name: &str) -> Option<String> {
        let key = ScriptKey {
            category: category.to_string(),
            name: name.to_string(),
        };
        self.scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the scripts in a category, sorted
    pub fn names(&self, category: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|key| key.category == category)
            .map(|key| key.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Replace the store's contents with the scripts on disk.
    /// Returns the number of scripts loaded.
    pub async fn load(&self) -> Result<usize> {
        let scripts = read_tree(&self.root).await?;
        let count = scripts.len();
        *self.scripts.write().unwrap_or_else(PoisonError::into_inner) = scripts;
        Ok(count)
    }
}

async fn read_tree(root: &Path) -> Result<HashMap<ScriptKey, String>> {
    let mut scripts = HashMap::new();

    let mut categories = match fs::read_dir(root).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(root = %root.display(), "Script root does not exist, no scripts loaded");
            return Ok(scripts);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read script root {}", root.display()))
        }
    };

    while let Some(category) = categories.next_entry().await? {
        if !category.file_type().await?.is_dir() {
            continue;
        }
        let category_name = category.file_name().to_string_lossy().into_owned();
        let dir = category.path();

        let mut files = fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to read script category {}", dir.display()))?;

        while let Some(file) = files.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SCRIPT_EXTENSION)
                || !file.file_type().await?.is_file()
            {
                continue;
            }

            let content = fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read script {}", path.display()))?;
            scripts.insert(
                ScriptKey {
                    category: category_name.clone(),
                    name: file.file_name().to_string_lossy().into_owned(),
                },
                content,
            );
        }
    }

    Ok(scripts)
}

#[async_trait]
impl ReloadHook for ScriptStore {
    fn name(&self) -> &str {
        "scripts"
    }

    async fn reload(&self) -> Result<()> {
        let count = self.load().await?;
        info!(namespace = %self.namespace, scripts = count, "Reloaded pipeline scripts");
        Ok(())
    }
}
