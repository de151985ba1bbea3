use core::fmt;

/// 服务生命周期。
///
/// # 教案式说明
/// - **意图 (Why)**：统一描述“实例在何处缓存、由谁释放”，避免调用方在工厂内部自行做缓存；
/// - **契约 (What)**：
///   - `Singleton`：在声明注册的容器内最多构造一次，子作用域共享同一实例，由声明容器释放；
///   - `Scoped`：每个作用域容器（发起解析的容器）各持有一份，作用域释放时一并释放；
///   - `Transient`：每次解析都重新构造，容器不追踪其释放；
/// - **设计权衡 (Trade-offs)**：作用域实例从祖先容器“克隆注册”到当前容器，
///   以空间换取查询路径上的无锁读取。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lifetime {
    /// 整个容器树共享。
    Singleton,
    /// 每个作用域一份。
    Scoped,
    /// 每次解析一份。
    Transient,
}

impl Lifetime {
    /// 以稳定字符串表示生命周期，供日志字段使用。
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Singleton => "singleton",
            Self::Scoped => "scoped",
            Self::Transient => "transient",
        }
    }

    /// 该生命周期的实例是否需要在容器中缓存。
    pub const fn is_cached(self) -> bool {
        !matches!(self, Self::Transient)
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
