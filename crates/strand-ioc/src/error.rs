//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义容器在注册、解析、释放过程中可能出现的失败；
//! - 上层（管线构建器）会把这些错误包装为构建期错误，因此每个变体都携带可读的服务名。
//!
//! ## 设计要求（What）
//! - 全部变体派生 `thiserror::Error`，并满足 `Send + Sync + 'static`；
//! - 工厂返回的业务错误以 [`Fault`] 原样保存在 `source` 中，不做字符串化。

use thiserror::Error;

/// 跨越调用边界的业务错误。
pub type Fault = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 容器错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把“找不到”“构造不出”“循环依赖”“已释放”等情况区分开，
///   便于管线构建器给出精确诊断；
/// - **契约 (What)**：服务名统一以 `String` 保存（来自 `ServiceKey` 的 `Display`）；
/// - **设计权衡 (Trade-offs)**：`Factory` 变体不可 `Clone`，因此整个枚举只派生 `Debug`。
#[derive(Debug, Error)]
pub enum ContainerError {
    /// 实现类型的所有构造函数都存在无法解析的参数。
    ///
    /// - **契约 (What)**：`unresolved` 列出参数最多的那组构造函数中缺失的参数类型。
    #[error(
        "no constructor of `{implementation}` can be satisfied; unresolvable parameters: [{}]",
        .unresolved.join(", ")
    )]
    NoResolvableConstructor {
        implementation: String,
        unresolved: Vec<String>,
    },

    /// 服务在解析过程中再次请求了自身。
    #[error("circular dependency while resolving `{service}`: {}", .path.join(" -> "))]
    CircularDependency { service: String, path: Vec<String> },

    /// `get_required` 请求的服务在容器链上不存在。
    #[error("required service `{service}` is not registered")]
    Missing { service: String },

    /// 注册产出的实例与请求的类型不一致。
    #[error("service `{service}` produced an instance of an unexpected type")]
    TypeMismatch { service: String },

    /// 容器已经释放，拒绝继续解析或注册。
    #[error("container {container} has been disposed")]
    Disposed { container: u64 },

    /// 工厂闭包返回错误。
    #[error("factory for `{service}` failed: {source}")]
    Factory {
        service: String,
        #[source]
        source: Fault,
    },

    /// 开放泛型族无法针对给定类型参数实化。
    #[error("open generic `{family}` cannot be realized for `{service}`: {reason}")]
    Realization {
        family: String,
        service: String,
        reason: String,
    },
}

impl ContainerError {
    /// 便捷构造：包装工厂失败。
    pub fn factory(service: impl Into<String>, source: impl Into<Fault>) -> Self {
        Self::Factory {
            service: service.into(),
            source: source.into(),
        }
    }
}
