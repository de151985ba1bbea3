//! # context 模块说明
//!
//! ## 角色定位（Why）
//! - 调用记录 [`Invocation`](crate::invocation::Invocation) 由管线独占，
//!   但实现代码也需要在不增加参数的情况下读取“当前调用”；
//! - [`CurrentInvocation`] 是调用中可共享部分的句柄，在实现分发步骤执行期间发布到
//!   `tokio::task_local!` 槽位，随调用自身的 future 跨越挂起点与嵌套分发。
//!
//! ## 行为契约（What）
//! - [`current_invocation`] 只在实现分发步骤的执行期间返回 `Some`；
//!   嵌套调用期间返回内层调用，内层返回后恢复外层；
//! - 调用级键值读取时回落到代理级存储 [`ProxyScope`]，后者在同一代理的多次调用间保留。

use std::{
    any::Any,
    fmt,
    future::Future,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;

use crate::{
    configuration::scope::ScopeValue, invocation::cancellation::Cancellation,
    method::MethodDescriptor,
};

static NEXT_INVOCATION: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT: CurrentInvocation;
}

/// 调用方身份。
pub type Caller = Arc<dyn Any + Send + Sync>;

/// 调用标识，首次读取时生成。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvocationId(u64);

impl InvocationId {
    fn next() -> Self {
        Self(NEXT_INVOCATION.fetch_add(1, Ordering::Relaxed))
    }

    /// 数值形式。
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inv-{:08x}", self.0)
    }
}

/// 键值写入的目标存储。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueScope {
    /// 仅本次调用可见。
    Invocation,
    /// 同一代理的后续调用均可见。
    Proxy,
}

/// 代理级键值存储，每个代理实例一份。
#[derive(Default)]
pub struct ProxyScope {
    values: DashMap<String, ScopeValue>,
}

impl ProxyScope {
    /// 创建空存储。
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取值；缺失或类型不符时返回 `None`。
    pub fn get_value<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|value| value.downcast_ref::<T>().cloned())
    }

    /// 写入值。
    pub fn set_value<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Arc::new(value));
    }

    /// 条目数。
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for ProxyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyScope")
            .field("values", &self.values.len())
            .finish()
    }
}

/// 调用中可跨任务共享的部分。
pub(crate) struct InvocationShared {
    pub(crate) id: OnceLock<InvocationId>,
    pub(crate) descriptor: Arc<MethodDescriptor>,
    pub(crate) values: DashMap<String, ScopeValue>,
    pub(crate) proxy: Arc<ProxyScope>,
    pub(crate) cancellation: Option<Cancellation>,
    pub(crate) caller: Option<Caller>,
}

impl InvocationShared {
    pub(crate) fn id(&self) -> InvocationId {
        *self.id.get_or_init(InvocationId::next)
    }

    pub(crate) fn get_value<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|value| value.downcast_ref::<T>().cloned())
            .or_else(|| self.proxy.get_value(key))
    }

    pub(crate) fn set_value_in<T: Send + Sync + 'static>(
        &self,
        scope: ValueScope,
        key: String,
        value: T,
    ) {
        match scope {
            ValueScope::Invocation => {
                self.values.insert(key, Arc::new(value));
            }
            ValueScope::Proxy => self.proxy.set_value(key, value),
        }
    }

    pub(crate) fn cancel(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(Cancellation::cancel)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(Cancellation::is_cancelled)
    }

    pub(crate) fn caller_as<T: Any>(&self) -> Option<&T> {
        self.caller
            .as_deref()
            .and_then(|caller| caller.downcast_ref::<T>())
    }
}

/// 当前调用的共享句柄。
///
/// 克隆成本为一次引用计数递增；在调用结束后仍可持有，但不再出现在环境槽位中。
#[derive(Clone)]
pub struct CurrentInvocation {
    shared: Arc<InvocationShared>,
}

impl CurrentInvocation {
    pub(crate) fn new(shared: Arc<InvocationShared>) -> Self {
        Self { shared }
    }

    /// 调用标识。
    pub fn id(&self) -> InvocationId {
        self.shared.id()
    }

    /// 方法描述符。
    pub fn method(&self) -> &MethodDescriptor {
        &self.shared.descriptor
    }

    /// 读取调用级值，缺失时回落到代理级。
    pub fn get_value<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        self.shared.get_value(key)
    }

    /// 写入调用级值。
    pub fn set_value<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.shared.set_value_in(ValueScope::Invocation, key.into(), value);
    }

    /// 写入指定存储。
    pub fn set_value_in<T: Send + Sync + 'static>(
        &self,
        scope: ValueScope,
        key: impl Into<String>,
        value: T,
    ) {
        self.shared.set_value_in(scope, key.into(), value);
    }

    /// 调用方身份。
    pub fn caller_as<T: Any>(&self) -> Option<&T> {
        self.shared.caller_as()
    }

    /// 取消合并令牌；调用没有取消令牌时无操作。
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }

    /// 合并令牌是否已取消。
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// 两个句柄是否指向同一调用。
    pub fn same_as(&self, other: &CurrentInvocation) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for CurrentInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CurrentInvocation")
            .field("id", &self.id())
            .field("method", &self.shared.descriptor.qualified_name())
            .finish()
    }
}

/// 读取环境槽位中的当前调用。
pub fn current_invocation() -> Option<CurrentInvocation> {
    CURRENT.try_with(CurrentInvocation::clone).ok()
}

/// 在 `future` 执行期间发布 `current`。
pub(crate) async fn publish<F: Future>(current: CurrentInvocation, future: F) -> F::Output {
    CURRENT.scope(current, future).await
}
