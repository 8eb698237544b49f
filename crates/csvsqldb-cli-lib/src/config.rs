//! Loads an `EngineConfig` from a TOML file, replacing the original's
//! Lua/INI `Configuration` singleton (`original_source/csvsqldb/base/configuration.cpp`)
//! with a plain deserialized struct per SPEC_FULL's redesign guidance.

use std::path::Path;

use csvsqldb_engine::EngineConfig;

pub fn load(path: Option<&Path>) -> Result<EngineConfig, String> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    toml::from_str(&text).map_err(|e| format!("{}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_path_falls_back_to_defaults() {
        let config = load(None).unwrap();
        assert_eq!(config.block_capacity, EngineConfig::default().block_capacity);
    }

    #[test]
    fn loads_overrides_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "block_capacity = 4096\ndefault_delimiter = \";\"\n").unwrap();
        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.block_capacity, 4096);
        assert_eq!(config.default_delimiter, ';');
    }
}
