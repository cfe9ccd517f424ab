//! TOML service definition loader.
//!
//! One service per file, keys as in a `[[service]]` entry of the
//! supervisor configuration:
//!
//! ```toml
//! name = "ovs-vswitchd"
//! command = "ovs-vswitchd"
//! args = ["--pidfile", "--detach"]
//! stop_timeout = 10
//!
//! [[health]]
//! kind = "command"
//! command = "ovs-vsctl"
//! args = ["show"]
//! ```

use crate::error::ConfigError;
use crate::service::ServiceDefinition;
use std::path::Path;

/// Loader for native TOML definitions.
pub struct TomlLoader;

impl super::ServiceLoader for TomlLoader {
    fn load(&self, path: &Path) -> Result<ServiceDefinition, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let def: ServiceDefinition =
            toml::from_str(&content).map_err(|source| ConfigError::TomlParse {
                path: path.to_path_buf(),
                source,
            })?;
        def.validate()?;
        Ok(def)
    }

    fn supports_extension(&self, ext: &str) -> bool {
        ext == "toml"
    }

    fn name(&self) -> &'static str {
        "toml"
    }
}
