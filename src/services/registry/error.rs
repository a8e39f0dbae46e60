use thiserror::Error;
use tonic::Status;

use crate::services::store::StoreError;

/// 注册中心错误类型
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{operation}: store unavailable: {source}")]
    StoreUnavailable {
        operation: &'static str,
        source: StoreError,
    },

    #[error("{operation}: lease failure: {source}")]
    LeaseFailure {
        operation: &'static str,
        source: StoreError,
    },

    #[error("{operation}: encoding failure: {source}")]
    EncodingFailure {
        operation: &'static str,
        source: serde_json::Error,
    },

    #[error("No instances found for service: {service_name}")]
    NotFound { service_name: String },

    // 批量读取时单条记录解码失败，只记录日志不返回给调用方
    #[error("Skipped undecodable record at {key}: {source}")]
    PartialDecodeSkip {
        key: String,
        source: serde_json::Error,
    },
}

impl RegistryError {
    pub(crate) fn store(operation: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::StoreUnavailable { operation, source }
    }

    pub(crate) fn lease(operation: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::LeaseFailure { operation, source }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<RegistryError> for Status {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { .. } => Status::not_found(err.to_string()),
            RegistryError::StoreUnavailable { .. } | RegistryError::LeaseFailure { .. } => {
                Status::unavailable(err.to_string())
            }
            RegistryError::EncodingFailure { .. } | RegistryError::PartialDecodeSkip { .. } => {
                Status::internal(err.to_string())
            }
        }
    }
}
