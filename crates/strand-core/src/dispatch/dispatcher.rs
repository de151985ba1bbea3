use std::{any::Any, fmt, sync::Arc};

use futures::FutureExt;
use strand_ioc::{Instance, TypeKey, WeakContainer};
use tracing::trace;

use crate::{
    advice::Next,
    dispatch::result::{AsyncResult, Payload, ReturnValue},
    error::{DispatchError, Fault},
    invocation::{Caller, Invocation, ProxyScope},
    method::MethodKey,
    pipeline::MethodInvocationConfiguration,
    registry::InterceptionRegistry,
};

/// 代理背后的调用入口。
///
/// # 教案式说明
/// - **意图 (Why)**：生成的代理只需把方法键与参数交给 `Dispatcher`，其余的管线解析、
///   调用记录创建与结果形态转换都在这里完成；
/// - **契约 (What)**：
///   - 每次调用都从注册表取当前代次的管线，已开始的调用不受后续重建影响；
///   - 返回值为方法声明的形态：同步方法得到 `Ready`，异步方法得到 `Pending`；
///   - 通知或实现产生的错误原样返回，不做包装；
///   - 由容器构造的代理记住构造它的容器作用域，管线中的通知从该作用域解析；
/// - **设计权衡 (Trade-offs)**：`Dispatcher` 可克隆，克隆共享同一份代理级存储，
///   因此代理可以把它放在自身字段里随意复制；作用域以弱句柄保存，
///   缓存在子作用域中的代理不会让该作用域无法释放。
#[derive(Clone)]
pub struct Dispatcher {
    registry: InterceptionRegistry,
    contract: TypeKey,
    target: Option<Instance>,
    proxy: Arc<ProxyScope>,
    caller: Option<Caller>,
    scope: Option<WeakContainer>,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: InterceptionRegistry,
        contract: TypeKey,
        target: Option<Instance>,
        scope: Option<WeakContainer>,
    ) -> Self {
        Self {
            registry,
            contract,
            target,
            proxy: Arc::new(ProxyScope::new()),
            caller: None,
            scope,
        }
    }

    /// 附带调用方身份，后续调用的通知可以通过 `Invocation::caller_as` 读取。
    pub fn with_caller<T: Any + Send + Sync>(mut self, caller: T) -> Self {
        self.caller = Some(Arc::new(caller));
        self
    }

    /// 所属契约。
    pub fn contract(&self) -> TypeKey {
        self.contract
    }

    /// 代理级存储。
    pub fn proxy_scope(&self) -> &Arc<ProxyScope> {
        &self.proxy
    }

    /// 所属注册表。
    pub fn registry(&self) -> &InterceptionRegistry {
        &self.registry
    }

    /// 按方法名查找本契约的方法键。
    pub fn method(&self, name: &str) -> Result<MethodKey, DispatchError> {
        self.registry
            .method_key(self.contract, name)
            .ok_or_else(|| DispatchError::ForeignMethod {
                contract: self.contract.name().to_owned(),
                method: name.to_owned(),
            })
    }

    fn configuration(
        &self,
        method: MethodKey,
    ) -> Result<Arc<MethodInvocationConfiguration>, DispatchError> {
        let Some(scope) = &self.scope else {
            return Ok(self.registry.invocation_configuration(method)?);
        };
        let container = scope.upgrade().ok_or_else(|| DispatchError::ScopeReleased {
            contract: self.contract.name().to_owned(),
            scope: scope.id().get(),
        })?;
        Ok(self.registry.invocation_configuration_in(method, &container)?)
    }

    /// 以声明形态执行一次调用。
    pub fn invoke(&self, method: MethodKey, arguments: Vec<Payload>) -> Result<ReturnValue, Fault> {
        let configuration = self.configuration(method)?;
        let descriptor = configuration.descriptor();
        if descriptor.contract() != self.contract {
            return Err(DispatchError::ForeignMethod {
                contract: self.contract.name().to_owned(),
                method: descriptor.qualified_name(),
            }
            .into());
        }

        let invocation = Invocation::new(
            Arc::clone(&configuration),
            arguments,
            self.target.clone(),
            Arc::clone(&self.proxy),
            self.caller.clone(),
        );
        trace!(
            method = %descriptor.qualified_name(),
            chain = %invocation.chain_description(),
            "dispatching invocation"
        );
        let pipeline = async move {
            let mut invocation = invocation;
            let configuration = Arc::clone(invocation.configuration());
            let result = Next::start(configuration.chain())
                .proceed(&mut invocation)
                .await;
            invocation.finish(&result);
            result.map(ReturnValue::Ready)
        }
        .boxed();
        configuration
            .converter()
            .to_declared(ReturnValue::Pending(pipeline))
    }

    /// 同步调用并取回 `R`。
    pub fn invoke_blocking<R: Send + 'static>(
        &self,
        method: MethodKey,
        arguments: Vec<Payload>,
    ) -> Result<R, Fault> {
        self.invoke(method, arguments)?.wait::<R>()
    }

    /// 异步调用，完成后得到 `R`。
    pub fn invoke_async<R: Send + 'static>(
        &self,
        method: MethodKey,
        arguments: Vec<Payload>,
    ) -> AsyncResult<R> {
        let value = self.invoke(method, arguments);
        async move { value?.resolve::<R>().await }.boxed()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("contract", &self.contract.name())
            .field("has_target", &self.target.is_some())
            .field("scope", &self.scope.as_ref().map(WeakContainer::id))
            .field("proxy_values", &self.proxy.len())
            .finish()
    }
}
