use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::error::RegistryError;
use crate::config::RegistryConfig;
use crate::services::model::{ConsumerConfig, ProviderConfig, ProviderGroup};

/// 注册中心统一契约，本地文件与协调服务两种实现都遵循它
#[async_trait]
pub trait Registry: Send + Sync + fmt::Debug {
    fn config(&self) -> &RegistryConfig;

    /// 幂等，已初始化时直接返回
    async fn init(&self) -> Result<(), RegistryError>;

    /// 未 init 时返回 false
    async fn start(&self) -> Result<bool, RegistryError>;

    async fn register(&self, config: &ProviderConfig) -> Result<(), RegistryError>;

    async fn unregister(&self, config: &ProviderConfig) -> Result<(), RegistryError>;

    /// 尽力而为，单个失败只记录日志
    async fn batch_unregister(&self, configs: &[ProviderConfig]) {
        for config in configs {
            if let Err(e) = self.unregister(config).await {
                tracing::error!(
                    interface = %config.interface,
                    app_name = %config.app_name,
                    error = %e,
                    "Error when batch unregister"
                );
            }
        }
    }

    /// 注册中心关闭订阅时返回 None
    async fn subscribe(
        &self,
        config: &ConsumerConfig,
    ) -> Result<Option<Vec<ProviderGroup>>, RegistryError>;

    async fn unsubscribe(&self, config: &ConsumerConfig) -> Result<(), RegistryError>;

    async fn batch_unsubscribe(&self, configs: &[ConsumerConfig]) {
        for config in configs {
            if let Err(e) = self.unsubscribe(config).await {
                tracing::error!(
                    interface = %config.interface,
                    app_name = %config.app_name,
                    error = %e,
                    "Error when batch unsubscribe"
                );
            }
        }
    }

    /// 释放后台任务、远端连接和旁路表，返回前全部完成
    async fn destroy(&self);

    async fn destroy_with_hook(&self, hook: &dyn DestroyHook) {
        hook.pre_destroy();
        self.destroy().await;
        hook.post_destroy();
    }
}

/// 销毁前后的钩子
pub trait DestroyHook: Send + Sync {
    fn pre_destroy(&self);
    fn post_destroy(&self);
}

/// 注册中心实例的生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Uninitialized,
    Initialized,
    Started,
    Destroyed,
}

/// 生命周期状态机，所有实现共用
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<RegistryState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: Mutex::new(RegistryState::Uninitialized),
        }
    }
}

impl Lifecycle {
    pub fn state(&self) -> RegistryState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, state: RegistryState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// 销毁后任何操作都不合法
    pub fn ensure_alive(&self) -> Result<RegistryState, RegistryError> {
        match self.state() {
            RegistryState::Destroyed => Err(RegistryError::Destroyed),
            state => Ok(state),
        }
    }

    /// 标记为已销毁，返回之前的状态
    pub fn destroy(&self) -> RegistryState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *state, RegistryState::Destroyed)
    }
}

/// 进程关闭标记，置位后反注册/退订的失败不再抛出
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
