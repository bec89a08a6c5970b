use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlockPressError {
    #[error("Duplicate field name '{name}' in {entity} ({group})")]
    DuplicateFieldName {
        entity: String,
        group: String,
        name: String,
    },

    #[error("Unknown entity: {name}")]
    UnknownEntity { name: String },

    #[error("Unknown field type '{field_type}' for field '{field}' in {entity}")]
    UnknownFieldType {
        entity: String,
        field: String,
        field_type: String,
    },

    #[error("Collection field '{field}' compiled without a layout context")]
    MissingLayoutContext { field: String },

    #[error("Incompatible nesting: '{child}' cannot be nested within '{parent}'")]
    IncompatibleNesting { child: String, parent: String },

    #[error("Missing template for {name}")]
    MissingTemplate { name: String },

    #[error("Field '{field}' in {entity} has conditional logic on unknown sibling '{target}'")]
    UnknownConditionField {
        entity: String,
        field: String,
        target: String,
    },

    #[error("Invalid name '{0}'")]
    InvalidName(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("{0}")]
    Other(String),
}

impl BlockPressError {
    /// Whether this error aborts a compilation pass.
    ///
    /// Structural errors reject the whole pass so that no partial schema or
    /// flat index is ever published.
    pub fn is_fatal_to_compile(&self) -> bool {
        matches!(
            self,
            BlockPressError::DuplicateFieldName { .. }
                | BlockPressError::UnknownFieldType { .. }
                | BlockPressError::MissingLayoutContext { .. }
                | BlockPressError::UnknownConditionField { .. }
                | BlockPressError::InvalidName(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BlockPressError>;
