//! 调用分发：参数视图、结果形态转换、实现分发步骤与代理入口。

pub mod arguments;
pub mod dispatcher;
pub mod implementation;
pub mod result;

pub use arguments::{MethodArguments, MethodInvoker};
pub use dispatcher::Dispatcher;
pub use implementation::ImplementationDispatch;
pub use result::{
    AsyncResult, Neutral, Payload, PipelineFuture, ResultConverter, ReturnValue, payload, unpack,
};
