use thiserror::Error;

/// Strata error types
#[derive(Error, Debug)]
pub enum StrataError {
    /// A RUN step exited non-zero
    #[error("Build step {index} ({instruction}) failed: {stderr}")]
    BuildInstructionFailure {
        index: usize,
        instruction: String,
        stderr: String,
    },

    /// A referenced binary, layer, or file is absent at run time
    #[error("Missing dependency: {0}")]
    MissingDependencyFailure(String),

    /// An operation requires privileges the active user lacks
    #[error("Build step {index} ({instruction}) requires privileges user '{user}' lacks")]
    PermissionFailure {
        index: usize,
        instruction: String,
        user: String,
    },

    /// A COPY source pattern matched nothing in the build context
    #[error("COPY source '{pattern}' matched no files in the build context")]
    GlobMatchFailure { pattern: String },

    /// A requested port is already in use or cannot be bound
    #[error("Cannot bind port {port}: {message}")]
    NetworkBindFailure { port: u16, message: String },

    /// Stratafile parse error
    #[error("Buildfile error: {0}")]
    BuildfileError(String),

    /// Build machinery error (workspace, snapshot, layer assembly)
    #[error("Build error: {0}")]
    BuildError(String),

    /// Layer cache error
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Image manifest or store error
    #[error("Image error: {0}")]
    ImageError(String),

    /// Registry endpoint error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Container runner error
    #[error("Container error: {0}")]
    ContainerError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::SerializationError(err.to_string())
    }
}

/// Result type alias for strata operations
pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_instruction_failure_display() {
        let error = StrataError::BuildInstructionFailure {
            index: 3,
            instruction: "RUN apk add curl".to_string(),
            stderr: "apk: not found".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Build step 3 (RUN apk add curl) failed: apk: not found"
        );
    }

    #[test]
    fn test_missing_dependency_failure_display() {
        let error = StrataError::MissingDependencyFailure("/app/server".to_string());
        assert_eq!(error.to_string(), "Missing dependency: /app/server");
    }

    #[test]
    fn test_permission_failure_display() {
        let error = StrataError::PermissionFailure {
            index: 5,
            instruction: "RUN apk add build-base".to_string(),
            user: "nodejs".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Build step 5 (RUN apk add build-base) requires privileges user 'nodejs' lacks"
        );
    }

    #[test]
    fn test_glob_match_failure_display() {
        let error = StrataError::GlobMatchFailure {
            pattern: "src/*.py".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "COPY source 'src/*.py' matched no files in the build context"
        );
    }

    #[test]
    fn test_network_bind_failure_display() {
        let error = StrataError::NetworkBindFailure {
            port: 3000,
            message: "address already in use".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Cannot bind port 3000: address already in use"
        );
    }

    #[test]
    fn test_buildfile_error_display() {
        let error = StrataError::BuildfileError("Line 2: Unknown directive 'FRM'".to_string());
        assert_eq!(
            error.to_string(),
            "Buildfile error: Line 2: Unknown directive 'FRM'"
        );
    }

    #[test]
    fn test_registry_error_display() {
        let error = StrataError::RegistryError {
            registry: "registry.example.com".to_string(),
            message: "manifest upload rejected".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Registry error: registry.example.com - manifest upload rejected"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let strata_error: StrataError = io_error.into();
        assert!(matches!(strata_error, StrataError::IoError(_)));
        assert!(strata_error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let json_str = "{ invalid json }";
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str(json_str);
        let json_error = result.unwrap_err();
        let strata_error: StrataError = json_error.into();
        assert!(matches!(strata_error, StrataError::SerializationError(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(StrataError::ConfigError("test error".to_string()))
        }

        assert_eq!(returns_ok().unwrap(), 42);
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_debug() {
        let error = StrataError::CacheError("test".to_string());
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("CacheError"));
    }
}
