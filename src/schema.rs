use std::{fs, path::{Path, PathBuf}};

use anyhow::{Context, Error};
use schemars::schema_for;

use crate::config::RouterConfig;

pub const CONFIG_SCHEMA_FILE: &str = "router_config.schema.json";

/// Write the JSON Schema of `config.yaml` into `out_dir`.
pub fn write_schema(out_dir: &Path) -> Result<PathBuf, Error> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("could not create {}", out_dir.display()))?;

    let schema = schema_for!(RouterConfig);
    let json = serde_json::to_string_pretty(&schema)?;
    let path = out_dir.join(CONFIG_SCHEMA_FILE);
    fs::write(&path, json).with_context(|| format!("could not write {}", path.display()))?;
    Ok(path)
}
