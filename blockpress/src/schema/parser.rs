use super::types::DefinitionFile;
use crate::error::{BlockPressError, Result};
use std::path::{Path, PathBuf};

/// Parse a definition file into a DefinitionFile
pub fn parse_definitions(path: &Path) -> Result<DefinitionFile> {
    let content = std::fs::read_to_string(path)?;
    parse_definitions_str(&content)
}

/// Parse a definition YAML string into a DefinitionFile
pub fn parse_definitions_str(content: &str) -> Result<DefinitionFile> {
    if content.trim().is_empty() {
        return Ok(DefinitionFile::default());
    }
    let definitions: DefinitionFile = serde_yaml::from_str(content)?;
    Ok(definitions)
}

/// Load the root definition file and merge every file matched by its `include` globs.
///
/// Included files contribute blocks and layouts only. When the same name is
/// defined more than once, the file loaded last wins.
pub fn load_definitions(config_path: &Path) -> Result<DefinitionFile> {
    let mut root = parse_definitions(config_path)?;
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));

    for path in include_paths(base, &root.include)? {
        if path == config_path {
            continue;
        }
        let included = parse_definitions(&path)?;
        if !included.include.is_empty() {
            log::warn!(
                "Nested includes in {} are ignored",
                path.display()
            );
        }
        merge_into(&mut root, included, &path);
    }

    Ok(root)
}

/// Expand include globs relative to `base`, sorted for a stable merge order.
pub fn include_paths(base: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        let full = format!("{}/{}", base.display(), pattern);
        let mut matched: Vec<PathBuf> = glob::glob(&full)
            .map_err(|e| BlockPressError::Config(format!("Bad include pattern '{pattern}': {e}")))?
            .filter_map(|r| r.ok())
            .filter(|p| p.is_file())
            .collect();
        if matched.is_empty() {
            log::warn!("Include pattern '{pattern}' matched no files");
        }
        matched.sort();
        for path in matched {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    Ok(paths)
}

fn merge_into(root: &mut DefinitionFile, other: DefinitionFile, source: &Path) {
    for (name, block) in other.blocks {
        if root.blocks.insert(name.clone(), block).is_some() {
            log::warn!("Block '{name}' redefined in {}", source.display());
        }
    }
    for (name, layout) in other.layouts {
        if root.layouts.insert(name.clone(), layout).is_some() {
            log::warn!("Layout '{name}' redefined in {}", source.display());
        }
    }
}
