//! strand-core：方法拦截与通知管线。
//!
//! # 教案式概览
//! - **意图（Why）**：为契约（trait）方法提供可配置的环绕通知链，把日志、重试、鉴权等横切逻辑
//!   从实现中剥离，并允许在全局、模块、契约、方法四级作用域上逐级覆盖配置。
//! - **结构（How）**：
//!   - [`configuration`]：作用域树、配置形态与 TOML 覆盖；
//!   - [`advice`]：通知契约、续体 [`Next`]、切点与排序约束；
//!   - [`pipeline`]：按方法构建并缓存有序通知链；
//!   - [`invocation`]：调用记录、取消令牌与任务级环境上下文；
//!   - [`dispatch`]：代理入口、实现分发与结果形态转换；
//!   - [`registry`]：把以上组件与 [`strand_ioc::Container`] 组合为宿主使用的注册表。
//! - **契约（What）**：通知的 `handle` 只能通过 `Next::proceed` 继续链条；实现分发步骤总在链尾；
//!   通知与实现返回的错误原样交还给调用方。
//! - **风险提示（Trade-offs）**：声明为同步返回的方法会在调用线程上阻塞等待管线完成，
//!   在单线程异步运行时内同步调用依赖运行时计时器的通知会导致死锁，此类方法应声明为异步返回。

pub mod advice;
pub mod configuration;
pub mod dispatch;
pub mod error;
pub mod invocation;
pub mod method;
pub mod pipeline;
pub mod registry;

pub use advice::{
    Advice, AdviceId, AdviceOrdering, AdviceRegistration, AdviceSource, AdviceType, Next, Pointcut,
};
pub use configuration::{
    AdviceConfig, ConfigShape, ConfigView, ConfigurationScope, ENABLED, ScopeKind, ScopeTree,
    Setting, ShapeId,
};
pub use dispatch::{
    AsyncResult, Dispatcher, ImplementationDispatch, MethodArguments, MethodInvoker, Neutral,
    Payload, ReturnValue,
};
pub use error::{ConfigurationError, DispatchError, Fault, PipelineError};
pub use invocation::{
    Cancellation, CurrentInvocation, Invocation, InvocationId, InvocationState, ValueScope,
    current_invocation,
};
pub use method::{MethodDescriptor, MethodKey, ParameterDescriptor, ReturnShape};
pub use pipeline::MethodInvocationConfiguration;
pub use registry::{ContractConfigurator, InterceptionRegistry};
