//! Instruction templates on disk.
//!
//! ```text
//! <root>/generic/<event_type>.md
//! <root>/repos/<owner>/<repo>/<event_type>.md
//! ```
//!
//! A repository-specific template shadows the generic one for the same event
//! type. Templates are not versioned: a save replaces the file.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::TemplateError;

const EXTENSION: &str = "md";

/// Address of one template in the namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateKey {
    Generic {
        event_type: String,
    },
    Repository {
        owner: String,
        repo: String,
        event_type: String,
    },
}

impl TemplateKey {
    pub fn generic(event_type: &str) -> Result<Self, TemplateError> {
        Ok(Self::Generic {
            event_type: segment(event_type)?,
        })
    }

    /// Build a repository key from an `owner/repo` full name.
    pub fn repository(full_name: &str, event_type: &str) -> Result<Self, TemplateError> {
        let (owner, repo) = full_name
            .split_once('/')
            .ok_or_else(|| TemplateError::InvalidKey(full_name.to_string()))?;
        Ok(Self::Repository {
            owner: segment(owner)?,
            repo: segment(repo)?,
            event_type: segment(event_type)?,
        })
    }
}

/// Reject anything that could escape the template root.
fn segment(value: &str) -> Result<String, TemplateError> {
    let invalid = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0']);
    if invalid {
        return Err(TemplateError::InvalidKey(value.to_string()));
    }
    Ok(value.to_string())
}

/// Which templates exist, without their content.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateIndex {
    pub generic: BTreeMap<String, bool>,
    pub repos: BTreeMap<String, BTreeMap<String, bool>>,
}

#[derive(Debug, Clone)]
pub struct TemplateStore {
    root: PathBuf,
}

impl TemplateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Find the template for an event: repository-specific first, then
    /// generic. `None` is the normal outcome for event types nobody wrote a
    /// template for.
    pub async fn resolve(&self, repository: &str, event_type: &str) -> Option<String> {
        let repo_key = TemplateKey::repository(repository, event_type).ok();
        let generic_key = TemplateKey::generic(event_type).ok();
        let store = self.clone();
        let found = tokio::task::spawn_blocking(move || {
            [repo_key, generic_key]
                .into_iter()
                .flatten()
                .find_map(|key| store.read_optional(&key))
        })
        .await;
        match found {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("template lookup task failed: {e}");
                None
            }
        }
    }

    pub async fn get(&self, key: &TemplateKey) -> Result<String, TemplateError> {
        let key = key.clone();
        self.blocking(move |store| store.read(&key)).await
    }

    /// Create or replace a template.
    pub async fn put(&self, key: &TemplateKey, text: &str) -> Result<(), TemplateError> {
        let key = key.clone();
        let text = text.to_owned();
        self.blocking(move |store| store.write(&key, &text)).await
    }

    pub async fn delete(&self, key: &TemplateKey) -> Result<(), TemplateError> {
        let key = key.clone();
        self.blocking(move |store| store.remove(&key)).await
    }

    pub async fn list(&self) -> Result<TemplateIndex, TemplateError> {
        self.blocking(|store| store.index()).await
    }

    /// Filesystem calls block, so they run off the async workers.
    async fn blocking<T, F>(&self, f: F) -> Result<T, TemplateError>
    where
        T: Send + 'static,
        F: FnOnce(&TemplateStore) -> Result<T, TemplateError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| TemplateError::Io(io::Error::other(e)))?
    }

    fn read_optional(&self, key: &TemplateKey) -> Option<String> {
        match self.read(key) {
            Ok(text) => Some(text),
            Err(TemplateError::NotFound) => None,
            Err(e) => {
                tracing::warn!(path = %self.path_for(key).display(), "unreadable template: {e}");
                None
            }
        }
    }

    fn read(&self, key: &TemplateKey) -> Result<String, TemplateError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(TemplateError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &TemplateKey, text: &str) -> Result<(), TemplateError> {
        let path = self.path_for(key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, text)?;
        Ok(())
    }

    fn remove(&self, key: &TemplateKey) -> Result<(), TemplateError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(TemplateError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn index(&self) -> Result<TemplateIndex, TemplateError> {
        let mut index = TemplateIndex::default();

        for event_type in template_names(&self.root.join("generic"))? {
            index.generic.insert(event_type, true);
        }

        for owner in subdirectories(&self.root.join("repos"))? {
            let owner_dir = self.root.join("repos").join(&owner);
            for repo in subdirectories(&owner_dir)? {
                let names = template_names(&owner_dir.join(&repo))?;
                let entry = index.repos.entry(format!("{owner}/{repo}")).or_default();
                for event_type in names {
                    entry.insert(event_type, true);
                }
            }
        }

        Ok(index)
    }

    fn path_for(&self, key: &TemplateKey) -> PathBuf {
        match key {
            TemplateKey::Generic { event_type } => self
                .root
                .join("generic")
                .join(format!("{event_type}.{EXTENSION}")),
            TemplateKey::Repository {
                owner,
                repo,
                event_type,
            } => self
                .root
                .join("repos")
                .join(owner)
                .join(repo)
                .join(format!("{event_type}.{EXTENSION}")),
        }
    }
}

fn read_dir_or_empty(dir: &Path) -> io::Result<Vec<fs::DirEntry>> {
    match fs::read_dir(dir) {
        Ok(entries) => entries.collect(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn subdirectories(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in read_dir_or_empty(dir)? {
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn template_names(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in read_dir_or_empty(dir)? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn store() -> (TempDir, TemplateStore) {
        let dir = TempDir::new().unwrap();
        let store = TemplateStore::new(dir.path().join("prompts"));
        (dir, store)
    }

    #[tokio::test]
    async fn repository_template_shadows_generic() {
        let (_dir, store) = store();
        store
            .put(&TemplateKey::generic("issues").unwrap(), "generic issues")
            .await
            .unwrap();
        store
            .put(
                &TemplateKey::repository("acme/widgets", "issues").unwrap(),
                "widgets issues",
            )
            .await
            .unwrap();

        assert_eq!(
            store.resolve("acme/widgets", "issues").await.as_deref(),
            Some("widgets issues")
        );
    }

    #[tokio::test]
    async fn falls_back_to_generic() {
        let (_dir, store) = store();
        store
            .put(&TemplateKey::generic("issues").unwrap(), "generic issues")
            .await
            .unwrap();
        store
            .put(
                &TemplateKey::repository("acme/widgets", "push").unwrap(),
                "widgets push",
            )
            .await
            .unwrap();

        assert_eq!(
            store.resolve("acme/gadgets", "issues").await.as_deref(),
            Some("generic issues")
        );
        assert_eq!(
            store.resolve("acme/widgets", "issues").await.as_deref(),
            Some("generic issues")
        );
    }

    #[tokio::test]
    async fn missing_everywhere_is_none() {
        let (_dir, store) = store();
        assert_eq!(store.resolve("acme/widgets", "issues").await, None);
    }

    #[tokio::test]
    async fn non_repository_names_use_generic_only() {
        let (_dir, store) = store();
        store
            .put(&TemplateKey::generic("projects_v2_item").unwrap(), "projects")
            .await
            .unwrap();
        assert_eq!(
            store.resolve("GitHub Projects", "projects_v2_item").await.as_deref(),
            Some("projects")
        );
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let (_dir, store) = store();
        assert!(TemplateKey::generic("../secrets").is_err());
        assert!(TemplateKey::generic("").is_err());
        assert!(TemplateKey::repository("acme", "issues").is_err());
        assert!(TemplateKey::repository("acme/..", "issues").is_err());
        assert!(TemplateKey::repository("acme/widgets/extra", "issues").is_err());
        assert_eq!(store.resolve("acme/widgets", "../../etc/passwd").await, None);
    }

    #[tokio::test]
    async fn update_replaces_and_delete_removes() {
        let (_dir, store) = store();
        let key = TemplateKey::generic("push").unwrap();
        store.put(&key, "v1").await.unwrap();
        store.put(&key, "v2").await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), "v2");

        store.delete(&key).await.unwrap();
        assert!(matches!(store.get(&key).await, Err(TemplateError::NotFound)));
        assert!(matches!(store.delete(&key).await, Err(TemplateError::NotFound)));
    }

    #[tokio::test]
    async fn list_reports_both_namespaces() {
        let (_dir, store) = store();
        assert_eq!(store.list().await.unwrap(), TemplateIndex::default());

        store
            .put(&TemplateKey::generic("issues").unwrap(), "a")
            .await
            .unwrap();
        store
            .put(
                &TemplateKey::repository("acme/widgets", "pull_request").unwrap(),
                "b",
            )
            .await
            .unwrap();
        fs::write(store.root().join("generic").join("notes.txt"), "ignored").unwrap();

        let index = store.list().await.unwrap();
        assert_eq!(index.generic.keys().collect::<Vec<_>>(), vec!["issues"]);
        assert_eq!(
            index.repos["acme/widgets"].keys().collect::<Vec<_>>(),
            vec!["pull_request"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shared_across_tasks() {
        let (_dir, store) = store();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let key = TemplateKey::generic(&format!("event_{i}")).unwrap();
                store.put(&key, &format!("template {i}")).await.unwrap();
                store.get(&key).await.unwrap()
            }));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap(), format!("template {i}"));
        }
        assert_eq!(store.list().await.unwrap().generic.len(), 8);
    }
}
