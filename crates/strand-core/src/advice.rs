//! # advice 模块说明
//!
//! ## 角色定位（Why）
//! - 通知（Advice）是环绕方法调用的横切逻辑单元：日志、重试、鉴权、实现分发等；
//! - 通知以“类型 + 切点 + 排序约束”的形式注册在任意作用域，构建器据此为每个方法生成有序链。
//!
//! ## 行为契约（What）
//! - [`Advice::handle`] 接收可变调用记录与续体 [`Next`]；调用 [`Next::proceed`] 执行后续步骤，
//!   不调用则短路整个管线；
//! - [`Next`] 可复制，通知可以多次继续（重放），例如重试；
//! - 越过链尾继续会得到 [`DispatchError::PipelineExhausted`]。
//!
//! ## 风险提示（Trade-offs）
//! - `handle` 通过 `async_trait` 返回装箱 future，每一步一次堆分配；
//!   换来的好处是链可以是 `Arc<[Arc<dyn Advice>]>` 这样的同构切片。

use std::{borrow::Cow, fmt, sync::Arc};

use async_trait::async_trait;
use strand_ioc::{Instance, ServiceKey, downcast};
use tracing::trace;

use crate::{
    configuration::shape::{AdviceConfig, ShapeId},
    dispatch::result::Payload,
    error::{DispatchError, Fault, PipelineError},
    invocation::Invocation,
    method::MethodDescriptor,
};

/// 拦截通知。
///
/// # 教案式说明
/// - **意图 (Why)**：以统一接口表达“在调用前后做点什么，并决定是否继续”；
/// - **契约 (What)**：
///   - `name` 用于诊断与排序；默认取实现类型名；
///   - `shape` 声明配置形态，其 `Enabled` 决定通知是否进入方法链；默认以名称为命名空间；
///   - `configure` 在每次构建时以方法作用域调用一次，可校验或补全配置；
///   - `handle` 必须是 `Send` 的，链会在任意线程上被驱动；
/// - **设计权衡 (Trade-offs)**：通知实例由容器提供，生命周期由注册决定；
///   需要按调用保存状态时应写入调用记录而非通知自身。
#[async_trait]
pub trait Advice: Send + Sync + 'static {
    /// 诊断名称。
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(std::any::type_name::<Self>())
    }

    /// 配置形态。
    fn shape(&self) -> ShapeId {
        ShapeId::new(self.name())
    }

    /// 构建期配置钩子。
    fn configure(&self, config: &AdviceConfig) -> Result<(), PipelineError> {
        let _ = config;
        Ok(())
    }

    /// 处理一次调用。
    async fn handle(&self, invocation: &mut Invocation, next: Next<'_>) -> Result<Payload, Fault>;
}

/// 指向链中下一步的续体。
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Advice>],
    position: usize,
}

impl<'a> Next<'a> {
    /// 指向链首的续体。
    pub fn start(chain: &'a [Arc<dyn Advice>]) -> Self {
        Self { chain, position: 0 }
    }

    /// 即将执行的步骤序号。
    pub fn position(&self) -> usize {
        self.position
    }

    /// 后续是否还有步骤。
    pub fn has_next(&self) -> bool {
        self.position < self.chain.len()
    }

    /// 执行后续步骤。
    pub async fn proceed(self, invocation: &mut Invocation) -> Result<Payload, Fault> {
        let Some(advice) = self.chain.get(self.position) else {
            return Err(Fault::from(DispatchError::PipelineExhausted {
                method: invocation.method().qualified_name(),
                chain: invocation.configuration().names().to_vec(),
            }));
        };
        trace!(
            invocation = %invocation.id(),
            step = self.position,
            advice = %advice.name(),
            "advice step"
        );
        invocation.enter(self.position);
        let next = Self {
            chain: self.chain,
            position: self.position + 1,
        };
        advice.handle(invocation, next).await
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("position", &self.position)
            .field("len", &self.chain.len())
            .finish()
    }
}

/// 通知类型标识，排序约束以它互相引用。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdviceId(Cow<'static, str>);

impl AdviceId {
    /// 以类型名标识通知类型 `A`。
    pub fn of<A: ?Sized + 'static>() -> Self {
        Self(Cow::Borrowed(std::any::type_name::<A>()))
    }

    /// 任意名称。
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    /// 保留的实现分发通知。
    pub fn implementation_dispatch() -> Self {
        Self(Cow::Borrowed(IMPLEMENTATION_DISPATCH))
    }

    /// 是否为保留的实现分发通知。
    pub fn is_implementation_dispatch(&self) -> bool {
        self.0 == IMPLEMENTATION_DISPATCH
    }

    /// 字符串形式。
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for AdviceId {
    fn from(name: &'static str) -> Self {
        Self::named(name)
    }
}

impl fmt::Display for AdviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) const IMPLEMENTATION_DISPATCH: &str = "strand.implementation-dispatch";

type AdviceCast = fn(&Instance) -> Option<Arc<dyn Advice>>;

/// 通知实例的来源。
#[derive(Clone)]
pub enum AdviceSource {
    /// 以服务键从容器解析，再转换为 `dyn Advice`。
    Closed { key: ServiceKey, cast: AdviceCast },
    /// 开放泛型族，按 `(契约, 声明返回类型, 管线结果类型)` 实化后从容器解析。
    Open { family: Cow<'static, str> },
    /// 固定实例。
    Instance(Arc<dyn Advice>),
}

impl fmt::Debug for AdviceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed { key, .. } => f.debug_struct("Closed").field("key", key).finish(),
            Self::Open { family } => f.debug_struct("Open").field("family", family).finish(),
            Self::Instance(advice) => f.debug_tuple("Instance").field(&advice.name()).finish(),
        }
    }
}

/// 通知类型：标识加上实例来源。
#[derive(Clone, Debug)]
pub struct AdviceType {
    id: AdviceId,
    source: AdviceSource,
}

impl AdviceType {
    /// 以具体类型 `A` 注册，实例以 `A` 为服务键从容器解析。
    pub fn of<A: Advice>() -> Self {
        Self {
            id: AdviceId::of::<A>(),
            source: AdviceSource::Closed {
                key: ServiceKey::of::<A>(),
                cast: |instance| downcast::<A>(instance).map(|advice| advice as Arc<dyn Advice>),
            },
        }
    }

    /// 以 `dyn Advice` 形式注册在任意服务键下的通知。
    pub fn keyed(id: AdviceId, key: ServiceKey) -> Self {
        Self {
            id,
            source: AdviceSource::Closed {
                key,
                cast: downcast::<dyn Advice>,
            },
        }
    }

    /// 开放泛型族。
    pub fn open(family: impl Into<Cow<'static, str>>) -> Self {
        let family = family.into();
        Self {
            id: AdviceId::named(family.clone()),
            source: AdviceSource::Open { family },
        }
    }

    /// 固定实例。
    pub fn instance(id: AdviceId, advice: Arc<dyn Advice>) -> Self {
        Self {
            id,
            source: AdviceSource::Instance(advice),
        }
    }

    /// 标识。
    pub fn id(&self) -> &AdviceId {
        &self.id
    }

    /// 来源。
    pub fn source(&self) -> &AdviceSource {
        &self.source
    }
}

type Predicate = dyn Fn(&MethodDescriptor) -> bool + Send + Sync;

/// 切点：选择通知适用的方法。
#[derive(Clone)]
pub struct Pointcut(Arc<Predicate>);

impl Pointcut {
    /// 匹配全部方法。
    pub fn all() -> Self {
        Self::new(|_| true)
    }

    /// 自定义谓词。
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&MethodDescriptor) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    /// 按方法名匹配。
    pub fn method_named(name: &'static str) -> Self {
        Self::new(move |method| method.name() == name)
    }

    /// 匹配契约 `C` 的全部方法。
    pub fn contract<C: ?Sized + 'static>() -> Self {
        Self::new(|method| method.contract().is::<C>())
    }

    /// 是否匹配。
    pub fn matches(&self, method: &MethodDescriptor) -> bool {
        (self.0)(method)
    }
}

impl Default for Pointcut {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for Pointcut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pointcut(..)")
    }
}

/// 排序约束。
#[derive(Clone, Debug, Default)]
pub struct AdviceOrdering {
    before: Vec<AdviceId>,
    after: Vec<AdviceId>,
}

impl AdviceOrdering {
    /// 无约束。
    pub fn new() -> Self {
        Self::default()
    }

    /// 必须排在 `other` 之前。
    pub fn before(mut self, other: impl Into<AdviceId>) -> Self {
        self.before.push(other.into());
        self
    }

    /// 必须排在 `other` 之后。
    pub fn after(mut self, other: impl Into<AdviceId>) -> Self {
        self.after.push(other.into());
        self
    }

    /// 之前约束。
    pub fn before_ids(&self) -> &[AdviceId] {
        &self.before
    }

    /// 之后约束。
    pub fn after_ids(&self) -> &[AdviceId] {
        &self.after
    }
}

/// 一条通知注册。
#[derive(Clone, Debug)]
pub struct AdviceRegistration {
    pub(crate) advice: AdviceType,
    pub(crate) pointcut: Pointcut,
    pub(crate) ordering: AdviceOrdering,
    pub(crate) sequence: u64,
}

impl AdviceRegistration {
    /// 创建注册；`sequence` 为全局注册序号，排序并列时序号小者在前。
    pub fn new(advice: AdviceType, pointcut: Pointcut, ordering: AdviceOrdering, sequence: u64) -> Self {
        Self {
            advice,
            pointcut,
            ordering,
            sequence,
        }
    }

    /// 通知类型。
    pub fn advice(&self) -> &AdviceType {
        &self.advice
    }

    /// 通知标识。
    pub fn id(&self) -> &AdviceId {
        self.advice.id()
    }

    /// 切点。
    pub fn pointcut(&self) -> &Pointcut {
        &self.pointcut
    }

    /// 排序约束。
    pub fn ordering(&self) -> &AdviceOrdering {
        &self.ordering
    }

    /// 注册序号。
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}
