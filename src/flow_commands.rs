use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::{fs, path::Path};
use tracing::info;

use crate::migration::migrate_flows;
use crate::path::check_path;

/// Upgrades the leaf nodes of a flow export in place. Returns how many
/// nodes changed; with `dry_run` the file is left alone.
pub fn migrate_flow_file(flow_file: &Path, dry_run: bool) -> Result<usize> {
    if !flow_file.exists() {
        bail!("File does not exist: {}", flow_file.display());
    }
    let content = fs::read_to_string(flow_file)
        .with_context(|| format!("Failed to read file: {}", flow_file.display()))?;
    let mut flows: Value = serde_json::from_str(&content)
        .with_context(|| format!("Invalid JSON in file: {}", flow_file.display()))?;

    let changed = migrate_flows(&mut flows)
        .with_context(|| format!("Failed to migrate {}", flow_file.display()))?;
    if changed > 0 && !dry_run {
        fs::write(flow_file, serde_json::to_string_pretty(&flows)?)
            .with_context(|| format!("Failed to write {}", flow_file.display()))?;
    }
    info!(file = %flow_file.display(), changed, dry_run, "flows migrated");
    Ok(changed)
}

/// Checks a database path the way the leaf nodes do.
pub fn check_path_arg(path: &str) -> Result<()> {
    check_path(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flows() -> Value {
        json!([
            {"id": "g1", "type": "firebase-get", "constraint": {"limitToLast": {"value": "5", "type": "num"}}, "useConstraint": true},
            {"id": "d1", "type": "debug"}
        ])
    }

    #[test]
    fn test_migrate_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("flows.json");
        fs::write(&file, flows().to_string()).unwrap();

        assert_eq!(migrate_flow_file(&file, true).unwrap(), 1);
        let untouched: Value = serde_json::from_str(&fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(untouched, flows());

        assert_eq!(migrate_flow_file(&file, false).unwrap(), 1);
        let migrated: Value = serde_json::from_str(&fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(migrated[0]["useConstraints"], json!(true));
        assert_eq!(migrate_flow_file(&file, false).unwrap(), 0);
    }

    #[test]
    fn test_bad_inputs() {
        let dir = tempfile::tempdir().unwrap();
        assert!(migrate_flow_file(&dir.path().join("missing.json"), false).is_err());
        let file = dir.path().join("broken.json");
        fs::write(&file, "{not json").unwrap();
        assert!(migrate_flow_file(&file, false).is_err());

        assert!(check_path_arg("a/b").is_ok());
        assert!(check_path_arg("a//b").is_err());
        assert!(check_path_arg("a.b").is_err());
    }
}
