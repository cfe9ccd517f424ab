//! Service loaders for definition files.
//!
//! Definitions can come from the `[[service]]` array of the supervisor
//! configuration file or from a directory holding one file per service.
//! Each file format is handled by a [`ServiceLoader`]; the registry picks
//! one by extension.

pub mod toml;

use crate::error::ConfigError;
use crate::service::ServiceDefinition;
use std::path::Path;

/// Trait for service configuration loaders.
///
/// Implement this trait to add support for new configuration formats.
pub trait ServiceLoader: Send + Sync {
    /// Load a service definition from the given path.
    fn load(&self, path: &Path) -> Result<ServiceDefinition, ConfigError>;

    /// Check if this loader supports the given file extension.
    fn supports_extension(&self, ext: &str) -> bool;

    /// Get a description of the loader for logging purposes.
    fn name(&self) -> &'static str;
}

/// Registry of service loaders.
pub struct LoaderRegistry {
    loaders: Vec<Box<dyn ServiceLoader>>,
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LoaderRegistry {
    /// Create a new loader registry with default loaders.
    pub fn new() -> Self {
        let mut registry = Self {
            loaders: Vec::new(),
        };
        registry.register(Box::new(toml::TomlLoader));
        registry
    }

    /// Register a new loader.
    pub fn register(&mut self, loader: Box<dyn ServiceLoader>) {
        self.loaders.push(loader);
    }

    /// Find a loader that supports the given file extension.
    pub fn find_loader(&self, ext: &str) -> Option<&dyn ServiceLoader> {
        self.loaders
            .iter()
            .find(|loader| loader.supports_extension(ext))
            .map(|b| b.as_ref())
    }

    /// Load a service definition from the given path.
    ///
    /// Automatically selects the appropriate loader based on the file extension.
    pub fn load(&self, path: &Path) -> Result<ServiceDefinition, ConfigError> {
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let loader = self.find_loader(ext).ok_or_else(|| ConfigError::Invalid {
            key: path.display().to_string(),
            reason: format!("no loader for extension {:?}", ext),
        })?;

        let def = loader.load(path)?;
        tracing::debug!(service = %def.name, loader = loader.name(), path = %path.display(), "Loaded service definition");
        Ok(def)
    }

    /// Load every supported file in `dir`, sorted by file name.
    ///
    /// Files without a matching loader are skipped.
    pub fn load_dir(&self, dir: &Path) -> Result<Vec<ServiceDefinition>, ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            let supported = path
                .extension()
                .and_then(|s| s.to_str())
                .map(|ext| self.find_loader(ext).is_some())
                .unwrap_or(false);
            if path.is_file() && supported {
                paths.push(path);
            }
        }
        paths.sort();

        paths.iter().map(|path| self.load(path)).collect()
    }
}

pub use self::toml::TomlLoader;
