//! strand-advices：面向 `strand-core` 通知管线的可复用通知组件库。
//!
//! # 教案式概览
//! - **意图（Why）**：日志、重试、鉴权是几乎每个契约都需要的横切逻辑，集中实现一次，
//!   由配置作用域决定在哪些方法上生效。
//! - **结构（How）**：按关注点拆分为 [`logging`]、[`retry`] 与 [`authorization`] 三个模块，
//!   每个通知都声明自己的配置形态，设置写在形态命名空间之下。
//! - **契约（What）**：通知以单例注册在容器中（见 [`install`]），再以
//!   [`AdviceType::of`](strand_core::AdviceType::of) 挂到任意作用域；
//!   同一实例服务所有方法，按方法区分的配置在调用时从方法作用域读取。
//! - **风险提示（Trade-offs）**：鉴权通知的形态是强制的，挂载后未配置 `allowed_roles`
//!   的方法会在管线构建时失败。

pub mod authorization;
pub mod logging;
pub mod retry;

pub use authorization::{AuthorizationAdvice, AuthorizationError, AuthorizationSettings, Principal};
pub use logging::{LoggingAdvice, LoggingSettings};
pub use retry::{RetryAdvice, RetrySettings};

use strand_ioc::{Container, ContainerError};

/// 以单例注册全部内置通知。
pub fn install(container: &Container) -> Result<(), ContainerError> {
    container.add_singleton(|_| Ok(LoggingAdvice))?;
    container.add_singleton(|_| Ok(RetryAdvice))?;
    container.add_singleton(|_| Ok(AuthorizationAdvice))?;
    Ok(())
}
