//! 调用记录、取消令牌与环境上下文。

pub mod cancellation;
pub mod context;
pub mod record;

pub use cancellation::Cancellation;
pub use context::{
    Caller, CurrentInvocation, InvocationId, ProxyScope, ValueScope, current_invocation,
};
pub use record::{Invocation, InvocationState};
