use miette::Diagnostic;
use thiserror::Error;

use crate::detection::signatures::SignatureError;

/**
 * 扫描错误类型 - 使用 miette 提供用户友好的错误诊断
 *
 * "坏文件"从不在这里出现：畸形头、预算超限、扫描器故障都会被转换为 finding。
 * 这个枚举只覆盖真正的环境故障和调用方配置错误。
 */
#[derive(Error, Debug, Diagnostic)]
pub enum ScanError {
    #[error("IO error: {0}")]
    #[diagnostic(code(blobguard::io_error))]
    Io(#[from] std::io::Error),

    #[error("Scanner error [{scanner}]: {message}")]
    #[diagnostic(
        code(blobguard::scanner_error),
        help("The failing scanner is isolated; its findings are dropped from the report")
    )]
    Scanner { scanner: String, message: String },

    #[error("Timeout error: {0}")]
    #[diagnostic(code(blobguard::timeout_error))]
    Timeout(String),

    #[error("Signature error: {0}")]
    #[diagnostic(code(blobguard::signature_error))]
    Signature(#[from] SignatureError),

    #[error("Validation error: {0}")]
    #[diagnostic(
        code(blobguard::validation_error),
        help("Check that budgets and thresholds are positive and within range")
    )]
    Validation(String),

    #[error("Configuration error: {0}")]
    #[diagnostic(code(blobguard::config_error))]
    Config(String),

    #[error("Internal error: {0}")]
    #[diagnostic(code(blobguard::internal_error))]
    Internal(String),
}

impl ScanError {
    /**
     * 为错误添加上下文信息
     */
    pub fn with_context(self, context: impl Into<String>) -> Self {
        let context = context.into();
        match self {
            ScanError::Scanner { scanner, message } => ScanError::Scanner {
                scanner,
                message: format!("{}: {}", context, message),
            },
            ScanError::Config(message) => ScanError::Config(format!("{}: {}", context, message)),
            ScanError::Validation(message) => {
                ScanError::Validation(format!("{}: {}", context, message))
            }
            other => other,
        }
    }

    /**
     * 创建扫描器错误
     */
    pub fn scanner_error(scanner: impl Into<String>, message: impl Into<String>) -> Self {
        ScanError::Scanner {
            scanner: scanner.into(),
            message: message.into(),
        }
    }

    /**
     * 创建验证错误
     */
    pub fn validation_error(message: impl Into<String>) -> Self {
        ScanError::Validation(message.into())
    }

    /**
     * 创建配置错误
     */
    pub fn config_error(message: impl Into<String>) -> Self {
        ScanError::Config(message.into())
    }
}

impl From<config::ConfigError> for ScanError {
    fn from(error: config::ConfigError) -> Self {
        ScanError::Config(error.to_string())
    }
}

impl From<validator::ValidationErrors> for ScanError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ScanError::Validation(errors.to_string())
    }
}

/**
 * 统一结果类型
 */
pub type Result<T> = std::result::Result<T, ScanError>;
