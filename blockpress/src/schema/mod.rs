mod generators;
mod parser;
mod types;

pub use generators::{GeneratorFn, GeneratorRegistry};
pub use parser::{include_paths, load_definitions, parse_definitions, parse_definitions_str};
pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};

/// Hash a set of definitions. Maps are ordered, so equal definitions hash equally
/// regardless of file layout or key order in the source YAML.
pub fn hash_definitions(definitions: &DefinitionFile) -> Result<String> {
    let canonical = serde_json::to_vec(definitions)?;
    let digest = Sha256::digest(&canonical);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}
