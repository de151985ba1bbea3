use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// 协作式取消令牌。
///
/// # 教案式说明
/// - **意图 (Why)**：调用方以参数形式传入令牌，拦截管线需要在不改变参数类型的前提下
///   把“调用方取消”和“通知主动取消”合并为同一个令牌交给实现；
/// - **契约 (What)**：
///   - `cancel()` 只设置自身标记，首次成功时返回 `true`；
///   - `is_cancelled()` 在自身或任一关联的上游令牌被取消时为真；
///   - 克隆共享同一状态；
/// - **设计权衡 (Trade-offs)**：取消状态按需向上游轮询而非主动广播，
///   关联层级很浅（调用方令牌 → 合并令牌），轮询成本可以忽略。
#[derive(Clone, Default)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Default)]
struct CancellationState {
    flag: AtomicBool,
    upstream: Vec<Cancellation>,
}

impl Cancellation {
    /// 创建独立令牌。
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建关联令牌：任一上游取消时视为已取消。
    pub fn linked(upstream: Vec<Cancellation>) -> Self {
        Self {
            inner: Arc::new(CancellationState {
                flag: AtomicBool::new(false),
                upstream,
            }),
        }
    }

    /// 派生子令牌。
    pub fn child(&self) -> Self {
        Self::linked(vec![self.clone()])
    }

    /// 触发取消。
    pub fn cancel(&self) -> bool {
        self.inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 是否已取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
            || self.inner.upstream.iter().any(Cancellation::is_cancelled)
    }
}

impl fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellation")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linked_token_observes_upstream_but_not_vice_versa() {
        let caller = Cancellation::new();
        let combined = Cancellation::linked(vec![caller.clone()]);
        assert!(!combined.is_cancelled());

        assert!(combined.cancel());
        assert!(!combined.cancel());
        assert!(combined.is_cancelled());
        assert!(!caller.is_cancelled());

        let other = caller.child();
        caller.cancel();
        assert!(other.is_cancelled());
    }
}
