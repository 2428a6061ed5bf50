use super::*;
use std::fs;
use tempfile::TempDir;

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn config_file_persistence() {
        let temp_dir = TempDir::new().expect("should create TempDir successfully");
        let config_path = temp_dir.path().join("config.toml");

        let original_config = Config {
            embedding: EmbeddingConfig {
                base_url: "https://voyage.internal.example.com".to_string(),
                model: "voyage-3-large".to_string(),
                dimension: 2048,
                batch_size: 32,
                ..EmbeddingConfig::default()
            },
            vector_store: VectorStoreConfig {
                backend: VectorBackend::Pinecone,
                pinecone: PineconeConfig {
                    index_host: "https://kb-abc.svc.pinecone.io".to_string(),
                    namespace: "production".to_string(),
                    ..PineconeConfig::default()
                },
                lancedb: LanceDbConfig::default(),
            },
            ..Config::default()
        };

        let toml_content = toml::to_string_pretty(&original_config)
            .expect("config should convert to toml string successfully");
        fs::write(&config_path, toml_content).expect("should write to config_path successfully");

        let loaded_config =
            Config::load(temp_dir.path()).expect("should load config from directory");

        assert_eq!(loaded_config.embedding, original_config.embedding);
        assert_eq!(loaded_config.vector_store, original_config.vector_store);
        assert_eq!(loaded_config.base_dir, temp_dir.path());
    }

    #[test]
    fn invalid_toml_handling() {
        let invalid_toml = r#"
            [embedding
            model = "voyage-3"
            dimension = "invalid_dimension"
        "#;

        let result: Result<Config, toml::de::Error> = toml::from_str(invalid_toml);
        assert!(result.is_err());
    }

    #[test]
    fn partial_config_with_defaults() {
        let partial_toml = r#"
            [embedding]
            model = "voyage-3-lite"
            dimension = 512
        "#;

        let config: Config = toml::from_str(partial_toml).expect("partial config should parse");
        assert_eq!(config.embedding.model, "voyage-3-lite");
        assert_eq!(config.embedding.dimension, 512);
        assert_eq!(config.embedding.batch_size, 128);
        assert_eq!(config.chunking.chunk_size, 500);
        assert_eq!(config.vector_store.backend, VectorBackend::Pinecone);
    }

    #[test]
    fn lancedb_backend_from_toml() {
        let valid_toml = r#"
            [chunking]
            chunk_size = 300
            overlap = 30

            [vector_store]
            backend = "lancedb"

            [vector_store.lancedb]
            path = "/var/lib/kb/vectors"
            table_name = "chunks"
        "#;

        let config: Config = toml::from_str(valid_toml).expect("should parse toml successfully");
        assert_eq!(config.vector_store.backend, VectorBackend::LanceDb);
        assert_eq!(config.vector_store.lancedb.table_name, "chunks");
        assert_eq!(config.chunking.chunk_size, 300);
        assert_eq!(config.chunking.overlap, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_file_is_rejected_on_load() {
        let temp_dir = TempDir::new().expect("should create TempDir successfully");
        fs::write(
            temp_dir.path().join("config.toml"),
            "[chunking]\nchunk_size = 100\noverlap = 100\n",
        )
        .expect("should write config file");

        let result = Config::load(temp_dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn error_display_messages() {
        let errors = vec![
            ConfigError::InvalidProtocol("ftp".to_string()),
            ConfigError::InvalidBatchSize(0),
            ConfigError::InvalidModel(String::new()),
            ConfigError::InvalidUrl("invalid-url".to_string()),
            ConfigError::OverlapTooLarge(50, 10),
            ConfigError::MissingApiKey("VOYAGE_API_KEY"),
            ConfigError::MissingIndexHost,
        ];

        for error in errors {
            let message = format!("{error}");
            assert!(!message.is_empty());
            assert!(message.len() > 10);
        }
    }
}
