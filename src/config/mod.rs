// Configuration management module
// TOML configuration file plus environment overrides for API credentials

pub mod settings;

#[cfg(test)]
mod tests;

pub use settings::{
    Config, ConfigError, ENV_CONFIG_HOME, ENV_PINECONE_API_KEY, ENV_PINECONE_INDEX_HOST,
    ENV_VOYAGE_API_KEY, EmbeddingConfig, LanceDbConfig, PineconeConfig, VectorBackend,
    VectorStoreConfig,
};
