use std::{fs, path::Path};

use anyhow::Error;
use schemars::schema_for;
use tracing::info;

use crate::config_node::ConfigNodeSettings;
use crate::node::LeafConfig;

/// Writes the JSON schemas of the persisted node configs into `out_dir`.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>, Error> {
    fs::create_dir_all(out_dir)?;

    let schemas = [
        ("leaf-node.schema.json", serde_json::to_string_pretty(&schema_for!(LeafConfig))?),
        ("database-config.schema.json", serde_json::to_string_pretty(&schema_for!(ConfigNodeSettings))?),
    ];
    let mut written = vec![];
    for (name, text) in schemas {
        fs::write(out_dir.join(name), text)?;
        info!(schema = name, "schema written");
        written.push(name.to_string());
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_schema() {
        let dir = tempfile::tempdir().unwrap();
        let written = write_schema(&dir.path().join("schemas")).unwrap();
        assert_eq!(written.len(), 2);
        let text = fs::read_to_string(dir.path().join("schemas/leaf-node.schema.json")).unwrap();
        assert!(text.contains("useConstraints"));
        assert!(text.contains("pathType"));
    }
}
