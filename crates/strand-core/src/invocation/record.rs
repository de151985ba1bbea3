//! # Invocation：单次调用记录
//!
//! ## 核心意图（Why）
//! - 为每一次经由代理的方法调用保存可变状态：参数、当前步骤、调用级键值、取消令牌与调用方身份；
//! - 由管线独占并以 `&mut` 传给每个通知，通知之间无需加锁即可改写参数。
//!
//! ## 状态机（What）
//! - `Created`：参数已捕获；类型为 [`Cancellation`] 的参数已被原位替换为合并令牌；
//! - `Running(step)`：第 `step` 个通知正在执行；
//! - `Completed` / `Faulted`：链返回结果或错误后进入终态。
//!
//! ## 风险提示（Trade-offs）
//! - 参数以 [`Payload`] 形式保存，类型错误只能在运行期以 [`DispatchError`] 暴露；
//!   `replace_argument` 在参数个数与声明不一致时拒绝执行，避免按错位的参数名改写。

use std::{any::Any, fmt, sync::Arc};

use dashmap::DashMap;
use strand_ioc::Instance;

use crate::{
    configuration::scope::ConfigurationScope,
    dispatch::result::{Neutral, Payload},
    error::{DispatchError, Fault},
    invocation::{
        cancellation::Cancellation,
        context::{Caller, CurrentInvocation, InvocationId, InvocationShared, ProxyScope, ValueScope},
    },
    method::{MethodDescriptor, MethodKey},
    pipeline::MethodInvocationConfiguration,
};

/// 调用状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvocationState {
    Created,
    Running(usize),
    Completed,
    Faulted,
}

/// 单次调用记录。
pub struct Invocation {
    shared: Arc<InvocationShared>,
    configuration: Arc<MethodInvocationConfiguration>,
    arguments: Vec<Payload>,
    target: Option<Instance>,
    state: InvocationState,
}

impl Invocation {
    pub(crate) fn new(
        configuration: Arc<MethodInvocationConfiguration>,
        mut arguments: Vec<Payload>,
        target: Option<Instance>,
        proxy: Arc<ProxyScope>,
        caller: Option<Caller>,
    ) -> Self {
        let tokens: Vec<Cancellation> = arguments
            .iter()
            .filter_map(|argument| argument.downcast_ref::<Cancellation>().cloned())
            .collect();
        let cancellation = if tokens.is_empty() {
            None
        } else {
            let combined = Cancellation::linked(tokens);
            for argument in arguments.iter_mut() {
                if argument.is::<Cancellation>() {
                    *argument = Box::new(combined.clone());
                }
            }
            Some(combined)
        };

        Self {
            shared: Arc::new(InvocationShared {
                id: Default::default(),
                descriptor: Arc::clone(configuration.descriptor()),
                values: DashMap::new(),
                proxy,
                cancellation,
                caller,
            }),
            configuration,
            arguments,
            target,
            state: InvocationState::Created,
        }
    }

    /// 调用标识，首次读取时生成。
    pub fn id(&self) -> InvocationId {
        self.shared.id()
    }

    /// 方法描述符。
    pub fn method(&self) -> &MethodDescriptor {
        &self.shared.descriptor
    }

    /// 方法键。
    pub fn method_key(&self) -> MethodKey {
        self.configuration.key()
    }

    /// 本次调用所用的方法配置。
    pub fn configuration(&self) -> &Arc<MethodInvocationConfiguration> {
        &self.configuration
    }

    /// 方法作用域，通知可在调用期读取配置。
    pub fn scope(&self) -> &Arc<ConfigurationScope> {
        self.configuration.scope()
    }

    /// 当前状态。
    pub fn state(&self) -> InvocationState {
        self.state
    }

    pub(crate) fn enter(&mut self, step: usize) {
        self.state = InvocationState::Running(step);
    }

    pub(crate) fn finish<T>(&mut self, result: &Result<T, Fault>) {
        self.state = if result.is_ok() {
            InvocationState::Completed
        } else {
            InvocationState::Faulted
        };
    }

    /// 全部参数。
    pub fn arguments(&self) -> &[Payload] {
        &self.arguments
    }

    /// 可变参数列表；改变参数个数后 `replace_argument` 与实现分发都会拒绝执行。
    pub fn arguments_mut(&mut self) -> &mut Vec<Payload> {
        &mut self.arguments
    }

    /// 读取指定位置的参数。
    pub fn argument<T: Any>(&self, index: usize) -> Option<&T> {
        self.arguments
            .get(index)
            .and_then(|argument| argument.downcast_ref::<T>())
    }

    fn ensure_arity(&self) -> Result<(), DispatchError> {
        let expected = self.method().parameters().len();
        if self.arguments.len() != expected {
            return Err(DispatchError::ArgumentCountMismatch {
                method: self.method().qualified_name(),
                expected,
                actual: self.arguments.len(),
            });
        }
        Ok(())
    }

    /// 以 `f(参数名, 当前值)` 原位改写每个类型为 `T` 的参数。
    pub fn replace_argument<T, F>(&mut self, mut f: F) -> Result<(), DispatchError>
    where
        T: Send + 'static,
        F: FnMut(&str, T) -> T,
    {
        self.ensure_arity()?;
        let descriptor = Arc::clone(&self.shared.descriptor);
        for (argument, parameter) in self.arguments.iter_mut().zip(descriptor.parameters()) {
            if !argument.is::<T>() {
                continue;
            }
            let current = std::mem::replace(argument, Box::new(Neutral));
            match current.downcast::<T>() {
                Ok(value) => *argument = Box::new(f(parameter.name(), *value)),
                Err(original) => *argument = original,
            }
        }
        Ok(())
    }

    pub(crate) fn ensure_dispatchable(&self) -> Result<(), DispatchError> {
        self.ensure_arity()
    }

    /// 取消合并令牌；参数中没有取消令牌时无操作并返回 `false`。
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }

    /// 合并令牌是否已取消。
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// 合并令牌。
    pub fn cancellation(&self) -> Option<&Cancellation> {
        self.shared.cancellation.as_ref()
    }

    /// 读取调用级值，缺失时回落到代理级。
    pub fn get_value<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        self.shared.get_value(key)
    }

    /// 写入调用级值。
    pub fn set_value<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.shared
            .set_value_in(ValueScope::Invocation, key.into(), value);
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
    pub fn caller(&self) -> Option<&Caller> {
        self.shared.caller.as_ref()
    }

    /// 以具体类型读取调用方身份。
    pub fn caller_as<T: Any>(&self) -> Option<&T> {
        self.shared.caller_as()
    }

    /// 代理级存储。
    pub fn proxy_scope(&self) -> &Arc<ProxyScope> {
        &self.shared.proxy
    }

    pub(crate) fn target(&self) -> Option<&Instance> {
        self.target.as_ref()
    }

    /// 生效通知链的诊断描述。
    pub fn chain_description(&self) -> String {
        self.configuration.names().join(" -> ")
    }

    /// 可共享的当前调用句柄。
    pub fn handle(&self) -> CurrentInvocation {
        CurrentInvocation::new(Arc::clone(&self.shared))
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("method", &self.method().qualified_name())
            .field("state", &self.state)
            .field("arguments", &self.arguments.len())
            .finish()
    }
}
