//! # result 模块说明
//!
//! ## 角色定位（Why）
//! - 调用方声明的返回形态（同步值、无返回、异步值）与管线内部统一的异步结果形态不同，
//!   需要在管线两端做形态转换；
//! - 管线内部以 [`Payload`] 承载结果，`()` 由占位值 [`Neutral`] 代替。
//!
//! ## 转换规则（What）
//! - 形态相同：原样返回；
//! - 异步 → 异步：映射内部结果并递归转换；
//! - 异步 → 同步：在当前线程上驱动 future，挂起时以线程停靠等待唤醒；
//! - 同步 → 异步：包装为立即就绪的 future；
//! - `Void` 与 `Value(Neutral)` 视为同一形态。
//!
//! ## 风险提示（Trade-offs）
//! - 异步 → 同步会阻塞当前线程；在异步运行时的工作线程上调用同步契约会占用该线程直至完成。
//! - 驱动器不登记“已进入执行器”状态，同步实现内部再发起同步调用时各层各自停靠、互不冲突；
//! - 位于多线程 Tokio 运行时的工作线程上时，首次轮询未就绪即经 `block_in_place` 让出工作线程；
//!   单线程运行时无法让出，依赖该运行时定时器或 IO 驱动唤醒的链会一直等待。

use std::{
    any::{Any, TypeId},
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    thread::{self, Thread},
};

use futures::{
    FutureExt,
    future::{self, BoxFuture},
    task::{self as task_util, ArcWake},
};
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::{
    error::{DispatchError, Fault},
    method::ReturnShape,
};

/// 管线内部的类型擦除结果。
pub type Payload = Box<dyn Any + Send>;

/// 声明形态下的异步结果。
pub type AsyncResult<T> = BoxFuture<'static, Result<T, Fault>>;

/// 管线执行产生的 future。
pub type PipelineFuture = BoxFuture<'static, Result<Payload, Fault>>;

/// `()` 在管线中的占位值。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Neutral;

/// 将任意值装箱为 [`Payload`]，`()` 替换为 [`Neutral`]。
pub fn payload<T: Send + 'static>(value: T) -> Payload {
    let boxed: Payload = Box::new(value);
    if boxed.is::<()>() {
        Box::new(Neutral)
    } else {
        boxed
    }
}

/// 从 [`Payload`] 还原为 `T`；`T` 为 `()` 时接受 [`Neutral`]。
pub fn unpack<T: 'static>(payload: Payload) -> Result<T, Payload> {
    if TypeId::of::<T>() == TypeId::of::<()>() && payload.is::<Neutral>() {
        let unit: Box<dyn Any> = Box::new(());
        return unit.downcast::<T>().map(|value| *value).map_err(|_| payload);
    }
    payload.downcast::<T>().map(|value| *value)
}

/// 某一形态下的返回值。
///
/// # 教案式说明
/// - **意图 (Why)**：以一个枚举同时覆盖同步与异步返回，使转换器可以递归处理嵌套形态；
/// - **契约 (What)**：`Ready` 为已就绪的值；`Pending` 在完成后产出内层形态的返回值；
/// - **设计权衡 (Trade-offs)**：异步值一律装箱为 `BoxFuture`，以一次分配换取统一的类型。
pub enum ReturnValue {
    Ready(Payload),
    Pending(BoxFuture<'static, Result<ReturnValue, Fault>>),
}

impl ReturnValue {
    /// 已就绪的值。
    pub fn ready<T: Send + 'static>(value: T) -> Self {
        Self::Ready(payload(value))
    }

    /// 无返回值。
    pub fn void() -> Self {
        Self::Ready(Box::new(Neutral))
    }

    /// 包装产出 `T` 的 future。
    pub fn future<T, F>(future: F) -> Self
    where
        T: Send + 'static,
        F: Future<Output = Result<T, Fault>> + Send + 'static,
    {
        Self::Pending(future.map(|result| result.map(Self::ready)).boxed())
    }

    /// 转为产出内层返回值的 future。
    pub fn into_future(self) -> BoxFuture<'static, Result<ReturnValue, Fault>> {
        match self {
            Self::Ready(payload) => future::ready(Ok(Self::Ready(payload))).boxed(),
            Self::Pending(future) => future,
        }
    }

    /// 等待全部嵌套的异步层并还原为 `T`。
    pub async fn resolve<T: 'static>(self) -> Result<T, Fault> {
        let mut current = self;
        loop {
            match current {
                Self::Ready(payload) => {
                    return unpack::<T>(payload).map_err(|_| {
                        Fault::from(DispatchError::ReturnType {
                            method: String::from("<resolve>"),
                            expected: std::any::type_name::<T>().to_owned(),
                        })
                    });
                }
                Self::Pending(future) => current = future.await?,
            }
        }
    }

    /// 阻塞等待并还原为 `T`。
    pub fn wait<T: Send + 'static>(self) -> Result<T, Fault> {
        settle(self.resolve::<T>().boxed())
    }
}

impl fmt::Debug for ReturnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(_) => f.write_str("ReturnValue::Ready(..)"),
            Self::Pending(_) => f.write_str("ReturnValue::Pending(..)"),
        }
    }
}

/// 声明形态与管线形态之间的转换器。
#[derive(Clone, Debug)]
pub struct ResultConverter {
    method: String,
    declared: ReturnShape,
    pipeline: ReturnShape,
}

impl ResultConverter {
    /// 以声明形态创建转换器，管线形态由声明形态推导。
    pub fn new(method: impl Into<String>, declared: ReturnShape) -> Self {
        let pipeline = declared.pipeline();
        Self {
            method: method.into(),
            declared,
            pipeline,
        }
    }

    /// 声明形态。
    pub fn declared(&self) -> &ReturnShape {
        &self.declared
    }

    /// 管线形态。
    pub fn pipeline(&self) -> &ReturnShape {
        &self.pipeline
    }

    /// 声明形态 → 管线形态。
    pub fn to_pipeline(&self, value: ReturnValue) -> Result<ReturnValue, Fault> {
        convert(&self.method, value, &self.declared, &self.pipeline)
    }

    /// 管线形态 → 声明形态。
    pub fn to_declared(&self, value: ReturnValue) -> Result<ReturnValue, Fault> {
        convert(&self.method, value, &self.pipeline, &self.declared)
    }
}

/// 在两种形态之间转换返回值。
pub fn convert(
    method: &str,
    value: ReturnValue,
    from: &ReturnShape,
    to: &ReturnShape,
) -> Result<ReturnValue, Fault> {
    match (from, to) {
        (ReturnShape::Async { output: inner_from, .. }, ReturnShape::Async { output: inner_to, .. }) => {
            if from == to {
                return Ok(value);
            }
            let method = method.to_owned();
            let inner_from = (**inner_from).clone();
            let inner_to = (**inner_to).clone();
            Ok(ReturnValue::Pending(
                async move {
                    let inner = value.into_future().await?;
                    convert(&method, inner, &inner_from, &inner_to)
                }
                .boxed(),
            ))
        }
        (ReturnShape::Async { output, .. }, _) => {
            let inner = settle(value.into_future())?;
            convert(method, inner, output, to)
        }
        (_, ReturnShape::Async { output, .. }) => {
            let inner = convert(method, value, from, output)?;
            Ok(ReturnValue::Pending(future::ready(Ok(inner)).boxed()))
        }
        (_, _) => {
            if !from.same_as(to) {
                return Err(mismatch(method, to));
            }
            match value {
                ReturnValue::Ready(payload) => {
                    check(method, &payload, to)?;
                    Ok(ReturnValue::Ready(payload))
                }
                ReturnValue::Pending(pending) => {
                    let inner = settle(pending)?;
                    convert(method, inner, from, to)
                }
            }
        }
    }
}

/// 一个驱动器的唤醒信号。
///
/// 嵌套的驱动器停靠在同一线程上，线程的停靠许可只有一份；各自的 `notified` 标志保证
/// 外层的唤醒即使被内层的 `park` 消耗，外层恢复后也不会错过。
struct Signal {
    thread: Thread,
    notified: AtomicBool,
}

impl Signal {
    fn wait(&self) {
        while !self.notified.swap(false, Ordering::AcqRel) {
            thread::park();
        }
    }
}

impl ArcWake for Signal {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.notified.store(true, Ordering::Release);
        arc_self.thread.unpark();
    }
}

/// 在当前线程上同步取得 future 的结果。
///
/// # 教案式说明
/// - **意图 (Why)**：同步契约的实现可能再次经由代理发起同步调用，内外两层都要在同一线程上等待；
///   带重入检查的执行器会在内层直接失败；
/// - **契约 (What)**：唤醒器只置位信号并 `unpark` 当前线程，未就绪时停靠至信号置位后重新轮询；
/// - **设计权衡 (Trade-offs)**：首次轮询就绪时不做任何让出；之后若处于多线程 Tokio 运行时，
///   剩余的等待放进 `block_in_place`，避免停靠的工作线程拖住运行时上的其他任务。
fn settle<T>(mut future: BoxFuture<'static, T>) -> T {
    let signal = Arc::new(Signal {
        thread: thread::current(),
        notified: AtomicBool::new(false),
    });
    let waker = task_util::waker(Arc::clone(&signal));
    let mut context = Context::from_waker(&waker);
    if let Poll::Ready(output) = future.as_mut().poll(&mut context) {
        return output;
    }
    let on_worker = Handle::try_current()
        .is_ok_and(|handle| matches!(handle.runtime_flavor(), RuntimeFlavor::MultiThread));
    let mut park_until_ready = move || loop {
        signal.wait();
        if let Poll::Ready(output) = future.as_mut().poll(&mut context) {
            return output;
        }
    };
    if on_worker {
        tokio::task::block_in_place(park_until_ready)
    } else {
        park_until_ready()
    }
}

fn check(method: &str, payload: &Payload, shape: &ReturnShape) -> Result<(), Fault> {
    let actual = (**payload).type_id();
    let matches = match shape {
        ReturnShape::Void => actual == TypeId::of::<Neutral>(),
        ReturnShape::Value(expected) => actual == expected.id(),
        ReturnShape::Async { .. } => true,
    };
    if matches {
        Ok(())
    } else {
        Err(mismatch(method, shape))
    }
}

fn mismatch(method: &str, expected: &ReturnShape) -> Fault {
    Fault::from(DispatchError::ReturnType {
        method: method.to_owned(),
        expected: expected.to_string(),
    })
}
