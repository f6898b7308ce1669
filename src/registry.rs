use crate::{
    config::{Config, Platform, RepositoryConfig, RepositoryDocument},
    error::{RepoError, RepoResult},
};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const BUILTIN_DOCUMENTS: &[(&str, &str)] = &[
    ("builtin:linux.yaml", include_str!("../repositories/linux.yaml")),
    ("builtin:macos.yaml", include_str!("../repositories/macos.yaml")),
    ("builtin:universal.yaml", include_str!("../repositories/universal.yaml")),
];

/// Where repository definitions come from. Later sources override earlier ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Builtin,
    /// every `*.yaml`/`*.yml` file, in file name order; a missing directory is skipped
    Directory(PathBuf),
    File(PathBuf),
    Inline { name: String, yaml: String },
}

impl ConfigSource {
    pub fn inline(name: impl Into<String>, yaml: impl Into<String>) -> Self {
        ConfigSource::Inline {
            name: name.into(),
            yaml: yaml.into(),
        }
    }

    /// Sources implied by the process settings: built-ins first, then user directories.
    pub fn from_config(config: &Config) -> Vec<ConfigSource> {
        let mut sources = Vec::new();
        if config.include_builtin {
            sources.push(ConfigSource::Builtin);
        }
        sources.extend(config.config_dirs.iter().cloned().map(ConfigSource::Directory));
        sources
    }

    fn documents(&self) -> RepoResult<Vec<(String, String)>> {
        match self {
            ConfigSource::Builtin => Ok(BUILTIN_DOCUMENTS
                .iter()
                .map(|(name, yaml)| (name.to_string(), yaml.to_string()))
                .collect()),
            ConfigSource::Directory(dir) => read_directory(dir),
            ConfigSource::File(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    RepoError::ConfigError(format!("cannot read {}: {}", path.display(), e))
                })?;
                Ok(vec![(path.display().to_string(), content)])
            }
            ConfigSource::Inline { name, yaml } => Ok(vec![(name.clone(), yaml.clone())]),
        }
    }
}

fn read_directory(dir: &Path) -> RepoResult<Vec<(String, String)>> {
    if !dir.is_dir() {
        debug!("Repository directory {} does not exist, skipping", dir.display());
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                RepoError::ConfigError(format!("cannot read {}: {}", path.display(), e))
            })?;
            Ok((path.display().to_string(), content))
        })
        .collect()
}

/// Immutable view of the loaded repositories. Queries hold on to the snapshot
/// they started with, so a reload never changes the set under their feet.
#[derive(Debug)]
pub struct RegistrySnapshot {
    repositories: Vec<Arc<RepositoryConfig>>,
    index: HashMap<String, usize>,
    loaded_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    fn build(sources: &[ConfigSource]) -> RepoResult<Self> {
        let mut repositories: Vec<Arc<RepositoryConfig>> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for source in sources {
            for (origin, content) in source.documents()? {
                let document = RepositoryDocument::from_yaml(&content, &origin)?;
                let mut seen = HashSet::new();

                for repo in document.repositories {
                    repo.validate()
                        .map_err(|e| RepoError::ConfigError(format!("{}: {}", origin, e)))?;
                    if !seen.insert(repo.name.clone()) {
                        return Err(RepoError::ConfigError(format!(
                            "{}: duplicate repository name '{}'",
                            origin, repo.name
                        )));
                    }

                    match index.get(&repo.name) {
                        Some(&position) => {
                            debug!("{} overrides repository {}", origin, repo.name);
                            repositories[position] = Arc::new(repo);
                        }
                        None => {
                            index.insert(repo.name.clone(), repositories.len());
                            repositories.push(Arc::new(repo));
                        }
                    }
                }
            }
        }

        Ok(Self {
            repositories,
            index,
            loaded_at: Utc::now(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<RepositoryConfig>> {
        self.index.get(name).map(|&i| &self.repositories[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Repositories in load order; disabled ones included.
    pub fn iter(&self) -> impl Iterator<Item = &RepositoryConfig> {
        self.repositories.iter().map(|r| r.as_ref())
    }

    pub fn list(&self, platform: Option<Platform>, repo_type: Option<&str>) -> Vec<Arc<RepositoryConfig>> {
        self.repositories
            .iter()
            .filter(|r| platform.map(|p| r.platform.serves(p)).unwrap_or(true))
            .filter(|r| repo_type.map(|t| r.repo_type == t).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

#[derive(Debug)]
pub struct RepositoryRegistry {
    sources: Vec<ConfigSource>,
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl RepositoryRegistry {
    /// Loads every source. Any invalid definition fails the whole load.
    pub fn load(sources: Vec<ConfigSource>) -> RepoResult<Self> {
        let snapshot = RegistrySnapshot::build(&sources)?;
        info!("Loaded {} repository definitions", snapshot.len());
        Ok(Self {
            sources,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    pub fn from_config(config: &Config) -> RepoResult<Self> {
        Self::load(ConfigSource::from_config(config))
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<RepositoryConfig>> {
        self.current.read().get(name).cloned()
    }

    pub fn list(&self, platform: Option<Platform>, repo_type: Option<&str>) -> Vec<Arc<RepositoryConfig>> {
        self.snapshot().list(platform, repo_type)
    }

    pub fn sources(&self) -> &[ConfigSource] {
        &self.sources
    }

    /// Re-reads the sources and swaps the active set. On failure the previous
    /// set stays active.
    pub fn reload(&self) -> RepoResult<Arc<RegistrySnapshot>> {
        self.reload_with(|_| Ok(()))
    }

    /// Like [`reload`](Self::reload), with an extra check the new set must pass
    /// before it replaces the active one.
    pub fn reload_with<F>(&self, check: F) -> RepoResult<Arc<RegistrySnapshot>>
    where
        F: FnOnce(&RegistrySnapshot) -> RepoResult<()>,
    {
        let built = RegistrySnapshot::build(&self.sources)
            .and_then(|snapshot| check(&snapshot).map(|_| snapshot));
        match built {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                *self.current.write() = snapshot.clone();
                info!("Reloaded {} repository definitions", snapshot.len());
                Ok(snapshot)
            }
            Err(e) => {
                warn!("Repository reload failed, keeping previous set: {}", e);
                Err(e)
            }
        }
    }
}
