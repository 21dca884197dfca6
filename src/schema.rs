use std::{fs, path::Path, path::PathBuf};

use anyhow::{Context, Error};
use schemars::{JsonSchema, schema_for};

use crate::config::BridgeConfig;
use crate::health::{HealthReport, StatusReport};

/// Write the JSON Schemas of the bridge's serializable surfaces into `out_dir`.
/// Returns the files written.
pub fn write_schema(out_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("creating schema dir {}", out_dir.display()))?;

    Ok(vec![
        write_one::<BridgeConfig>(out_dir, "config.schema.json")?,
        write_one::<HealthReport>(out_dir, "health.schema.json")?,
        write_one::<StatusReport>(out_dir, "status.schema.json")?,
    ])
}

fn write_one<T: JsonSchema>(out_dir: &Path, file_name: &str) -> Result<PathBuf, Error> {
    let schema = schema_for!(T);
    let json = serde_json::to_string_pretty(&schema)?;
    let path = out_dir.join(file_name);
    fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
