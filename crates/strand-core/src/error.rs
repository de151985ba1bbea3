//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 拦截框架的失败分为三层：配置期（作用域结构、覆盖文件）、构建期（管线排序与通知解析）、
//!   调用期（参数、返回形态、管线耗尽）；
//! - 业务实现返回的错误不属于上述任何一层，它们以 [`Fault`] 原样穿透，调用方可直接向下转型。
//!
//! ## 设计要求（What）
//! - 构建期错误必须点名方法与通知组成，避免运维在多层作用域中盲目排查；
//! - 层间转换通过 `#[from]` 完成：`ConfigurationError`/`ContainerError → PipelineError → DispatchError`。

use strand_ioc::ContainerError;
use thiserror::Error;

pub use strand_ioc::Fault;

/// 配置作用域与配置覆盖的错误。
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// 作用域已锁定，拒绝新增子作用域或通知注册。
    ///
    /// - **意图 (Why)**：锁定后的作用域结构被视为已发布，继续修改会让已构建管线与配置树失配；
    /// - **契约 (What)**：值写入不受锁定影响，只有结构性变更返回该错误。
    #[error("configuration scope `{scope}` is locked")]
    ScopeLocked { scope: String },

    /// 配置覆盖中出现无法映射的值类型。
    #[error("unsupported value for `{key}` in scope `{scope}`: {found}")]
    UnsupportedValue {
        scope: String,
        key: String,
        found: String,
    },

    /// 配置覆盖文本无法解析。
    #[error("configuration overlay cannot be parsed: {source}")]
    Overlay {
        #[from]
        source: toml::de::Error,
    },
}

/// 管线构建错误。
///
/// # 教案式说明
/// - **意图 (Why)**：构建失败意味着该方法不存在可执行的拦截链，必须在首次调用前暴露，绝不返回部分管线；
/// - **契约 (What)**：`method` 为 `契约::方法` 形式的限定名；`chain` 为已收集的通知组成（排序前）；
/// - **设计权衡 (Trade-offs)**：诊断信息以 `String` 保存，构建期只发生一次，分配成本可以忽略。
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 排序约束存在环。
    #[error("advice ordering for `{method}` contains a cycle: [{}]", .cycle.join(", "))]
    OrderingCycle { method: String, cycle: Vec<String> },

    /// 通知类型无法从容器解析。
    #[error(
        "advice `{advice}` for `{method}` cannot be resolved; composition: [{}]",
        .chain.join(", ")
    )]
    UnresolvableAdvice {
        method: String,
        advice: String,
        chain: Vec<String>,
        #[source]
        source: Option<ContainerError>,
    },

    /// 强制配置形态在方法作用域及其祖先上均未配置。
    #[error("advice `{advice}` for `{method}` requires configuration `{shape}`")]
    MissingConfiguration {
        method: String,
        advice: String,
        shape: String,
    },

    /// 方法键未注册。
    #[error("method `{method}` is not configured")]
    UnknownMethod { method: String },

    /// 通知的 `configure` 钩子拒绝了当前配置。
    #[error("advice `{advice}` rejected the configuration of `{method}`: {reason}")]
    InvalidConfiguration {
        method: String,
        advice: String,
        reason: String,
    },

    /// 配置作用域错误。
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// 容器错误。
    #[error(transparent)]
    Container(#[from] ContainerError),
}

/// 调用期错误。
#[derive(Debug, Error)]
pub enum DispatchError {
    /// 续体越过了管线末端。
    ///
    /// - **契约 (What)**：`chain` 为实际生效的通知序列，通常意味着缺少实现分发步骤。
    #[error("pipeline of `{method}` exhausted without a result; chain: [{}]", .chain.join(" -> "))]
    PipelineExhausted { method: String, chain: Vec<String> },

    /// 参数个数与方法声明不一致。
    #[error("`{method}` declares {expected} parameters but the invocation carries {actual}")]
    ArgumentCountMismatch {
        method: String,
        expected: usize,
        actual: usize,
    },

    /// 指定位置的参数不存在或类型不符。
    #[error("argument {index} of `{method}` is not a `{expected}`")]
    ArgumentType {
        method: String,
        index: usize,
        expected: &'static str,
    },

    /// 参数已被先前的 `take` 取走，通常意味着后续步骤被重放。
    #[error("argument {index} of `{method}` was already taken by an earlier attempt")]
    ArgumentTaken { method: String, index: usize },

    /// 返回值形态或类型与声明不符。
    #[error("return value of `{method}` does not match `{expected}`")]
    ReturnType { method: String, expected: String },

    /// 方法没有可分发的实现实例或调用器。
    #[error("no implementation available for `{method}`")]
    NoImplementation { method: String },

    /// 方法不属于当前代理的契约。
    #[error("method `{method}` does not belong to contract `{contract}`")]
    ForeignMethod { contract: String, method: String },

    /// 代理构造时所在的容器作用域已被释放。
    #[error("container scope {scope} of the `{contract}` proxy has been released")]
    ScopeReleased { contract: String, scope: u64 },

    /// 方法管线构建失败。
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
