pub mod schema;
pub mod key;
pub mod registry;
pub mod compiler;
pub mod flatmap;
pub mod rehydrate;
pub mod render_cache;
pub mod system_db;
pub mod builder;
pub mod validation;
pub mod watcher;
pub mod error;

pub use builder::Builder;
pub use compiler::{compile, CompiledSchema};
pub use error::{BlockPressError, Result};
pub use flatmap::{FlatEntry, FlatIndex};
pub use registry::Registry;
pub use rehydrate::{RawValues, ValueResolver};
pub use render_cache::{RenderCache, RenderPass, TemplateRenderer};
pub use schema::DefinitionFile;
