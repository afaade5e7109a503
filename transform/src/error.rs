use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("transform config major_version {found} does not match supported version {expected}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("unknown transform tag: {0}")]
    UnknownTransform(String),

    #[error("transform type mismatch: {0}")]
    TypeMismatch(String),

    #[error("invalid regex pattern: {0}")]
    RegexCompile(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("password hashing failed: {0}")]
    HashLibrary(String),

    #[error("failed to read transform config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse transform config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Model(#[from] kasho_model::ModelError),

    #[error("transforming {table}.{column}: {source}")]
    Column {
        table: String,
        column: String,
        #[source]
        source: Box<TransformError>,
    },
}
