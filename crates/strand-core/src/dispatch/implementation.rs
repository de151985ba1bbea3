use std::{borrow::Cow, sync::Arc};

use async_trait::async_trait;

use crate::{
    advice::{Advice, AdviceId, AdviceType, IMPLEMENTATION_DISPATCH, Next},
    configuration::shape::ShapeId,
    dispatch::{
        arguments::MethodArguments,
        result::{Payload, ReturnValue},
    },
    error::{DispatchError, Fault},
    invocation::{Invocation, context},
};

/// 保留的终端通知：把调用分发给实现实例。
///
/// # 教案式说明
/// - **意图 (Why)**：实现调用本身也是链上的一步，前序通知因此可以统一地用 `proceed` 环绕它；
/// - **契约 (What)**：
///   - 总是位于链尾，不调用 `next`；
///   - 执行期间把当前调用发布到环境槽位，实现内部可通过
///     [`current_invocation`](crate::invocation::current_invocation) 读取；
///   - 实现返回的声明形态结果先转换为管线形态再交回链；
/// - **设计权衡 (Trade-offs)**：同步实现在分发步骤内直接执行，不会额外让出执行权。
#[derive(Debug, Default)]
pub struct ImplementationDispatch;

impl ImplementationDispatch {
    /// 以保留标识注册的通知类型。
    pub fn advice_type() -> AdviceType {
        AdviceType::instance(AdviceId::implementation_dispatch(), Arc::new(Self))
    }
}

#[async_trait]
impl Advice for ImplementationDispatch {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(IMPLEMENTATION_DISPATCH)
    }

    fn shape(&self) -> ShapeId {
        ShapeId::new("strand.implementation")
    }

    async fn handle(&self, invocation: &mut Invocation, _next: Next<'_>) -> Result<Payload, Fault> {
        let current = invocation.handle();
        context::publish(current, dispatch(invocation)).await
    }
}

async fn dispatch(invocation: &mut Invocation) -> Result<Payload, Fault> {
    invocation.ensure_dispatchable()?;
    let configuration = Arc::clone(invocation.configuration());
    let method = invocation.method().qualified_name();
    let no_implementation = || DispatchError::NoImplementation {
        method: method.clone(),
    };
    let invoker = configuration.invoker().ok_or_else(no_implementation)?;
    let target = invocation.target().cloned().ok_or_else(no_implementation)?;

    let declared = {
        let mut arguments = MethodArguments::new(&method, invocation.arguments_mut());
        invoker(&target, &mut arguments)?
    };
    let pipeline = configuration.converter().to_pipeline(declared)?;
    match pipeline.into_future().await? {
        ReturnValue::Ready(payload) => Ok(payload),
        ReturnValue::Pending(_) => Err(Fault::from(DispatchError::ReturnType {
            method,
            expected: configuration.converter().pipeline().to_string(),
        })),
    }
}
