/// 统一错误类型

use thiserror::Error;

/// 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    #[error("无效的 CIDR: {0}")]
    InvalidCidr(String),

    #[error("地址池已耗尽: {0}")]
    AddressPoolExhausted(String),

    #[error("IP 地址已被占用: {0}")]
    AddressInUse(String),

    #[error("没有满足条件的宿主机: 需要内存 {required} MB")]
    NoCapacity { required: i64 },

    #[error("宿主机不可用 ({host}): {reason}")]
    HostUnavailable { host: String, reason: String },

    #[error("远程对象创建失败 [{step}]: {reason}")]
    RemoteObjectCreation { step: String, reason: String },

    #[error("数据已过期，写入冲突: {0}")]
    StaleState(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    #[error("状态不允许该操作: {0}")]
    InvalidState(String),

    #[error("虚拟化错误: {0}")]
    Hypervisor(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("内部错误: {0}")]
    Internal(String),

    #[error("其他错误: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn host_unavailable(host: impl Into<String>, reason: impl ToString) -> Self {
        Self::HostUnavailable {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    pub fn remote_creation(step: impl Into<String>, reason: impl ToString) -> Self {
        Self::RemoteObjectCreation {
            step: step.into(),
            reason: reason.to_string(),
        }
    }

    /// 本地输入校验类错误，同步返回给调用方且不自动重试
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidCidr(_)
                | Self::AddressPoolExhausted(_)
                | Self::AddressInUse(_)
                | Self::NoCapacity { .. }
                | Self::InvalidArgument(_)
        )
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;
