use crate::services::coordination::CoordinationError;

/// 注册中心错误类型
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// 配置缺失或非法，init 阶段抛出
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to load registry config: {0}")]
    ConfigLoad(String),

    /// 远端客户端未启动或已断开
    #[error("Registry backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Registry has been destroyed")]
    Destroyed,

    #[error("Failed to {operation} for service {service}: {source}")]
    Operation {
        operation: &'static str,
        service: String,
        #[source]
        source: CoordinationError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 阻塞任务 panic 或被取消
    #[error("Registry task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl RegistryError {
    pub fn operation(
        operation: &'static str,
        service: impl Into<String>,
        source: CoordinationError,
    ) -> Self {
        let service: String = service.into();
        match source {
            CoordinationError::NotStarted | CoordinationError::Closed => {
                RegistryError::BackendUnavailable(format!("{operation} {service}: {source}"))
            }
            source => RegistryError::Operation {
                operation,
                service,
                source,
            },
        }
    }
}
