//! # method 模块说明
//!
//! ## 角色定位（Why）
//! - 方法描述符是切点匹配、作用域命名与结果转换的共同输入；
//! - 方法在配置期被驻留为 [`MethodKey`]，之后的缓存与调用都只使用这个整数键。
//!
//! ## 设计要求（What）
//! - 描述符记录契约类型、方法名、参数（名称与类型）以及声明的返回形态；
//! - [`ReturnShape`] 区分无返回、同步值与异步值，异步值的内层形态可递归嵌套。

use std::fmt;

use strand_ioc::TypeKey;

use crate::dispatch::result::{AsyncResult, Neutral, PipelineFuture};

/// 驻留后的方法标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodKey(u32);

impl MethodKey {
    pub(crate) const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// 数值形式。
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// 返回形态。
///
/// # 教案式说明
/// - **意图 (Why)**：转换器只依据形态决定阻塞、包装还是映射，而不关心具体类型；
/// - **契约 (What)**：
///   - `Void`：无返回值，`()` 与 [`Neutral`] 都归入此形态；
///   - `Value`：同步返回的具体类型；
///   - `Async`：`handle` 为异步句柄类型，`output` 为完成后的内层形态；
/// - **设计权衡 (Trade-offs)**：形态比较包含句柄类型，两个异步形态即使内层一致，
///   句柄不同时也会经过一次映射。
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum ReturnShape {
    Void,
    Value(TypeKey),
    Async {
        handle: TypeKey,
        output: Box<ReturnShape>,
    },
}

impl ReturnShape {
    /// 同步返回 `T` 的形态；`T` 为 `()` 或 [`Neutral`] 时为 `Void`。
    pub fn value<T: 'static>() -> Self {
        let key = TypeKey::of::<T>();
        if key.is::<()>() || key.is::<Neutral>() {
            Self::Void
        } else {
            Self::Value(key)
        }
    }

    /// 以 [`AsyncResult<T>`] 异步返回 `T` 的形态。
    pub fn future<T: 'static>() -> Self {
        Self::Async {
            handle: TypeKey::of::<AsyncResult<T>>(),
            output: Box::new(Self::value::<T>()),
        }
    }

    /// 管线内部使用的形态：以 [`PipelineFuture`] 异步产出载荷。
    pub fn pipeline(&self) -> Self {
        Self::Async {
            handle: TypeKey::of::<PipelineFuture>(),
            output: Box::new(self.payload()),
        }
    }

    /// 剥去全部异步层后的结果形态。
    pub fn payload(&self) -> Self {
        match self {
            Self::Async { output, .. } => output.payload(),
            other => other.clone(),
        }
    }

    /// 形态对应的类型：`Void` 为 `()`，异步形态为句柄类型。
    pub fn type_key(&self) -> TypeKey {
        match self {
            Self::Void => TypeKey::of::<()>(),
            Self::Value(key) => *key,
            Self::Async { handle, .. } => *handle,
        }
    }

    /// 载荷类型：`Void` 为 [`Neutral`]。
    pub fn payload_key(&self) -> TypeKey {
        match self.payload() {
            Self::Value(key) => key,
            _ => TypeKey::of::<Neutral>(),
        }
    }

    /// 是否为异步形态。
    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async { .. })
    }

    /// 比较形态，`Void` 与 `Value(Neutral)` 视为相同。
    pub fn same_as(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }

    fn normalized(&self) -> Self {
        match self {
            Self::Value(key) if key.is::<Neutral>() || key.is::<()>() => Self::Void,
            Self::Async { handle, output } => Self::Async {
                handle: *handle,
                output: Box::new(output.normalized()),
            },
            other => other.clone(),
        }
    }
}

impl fmt::Display for ReturnShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => f.write_str("void"),
            Self::Value(key) => f.write_str(key.name()),
            Self::Async { output, .. } => write!(f, "async {output}"),
        }
    }
}

impl fmt::Debug for ReturnShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// 参数描述。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParameterDescriptor {
    name: &'static str,
    ty: TypeKey,
}

impl ParameterDescriptor {
    /// 参数名。
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 参数类型。
    pub fn ty(&self) -> TypeKey {
        self.ty
    }
}

/// 方法描述符。
///
/// ```rust
/// use strand_core::method::{MethodDescriptor, ReturnShape};
///
/// trait Calc: Send + Sync {
///     fn add(&self, a: i32, b: i32) -> i32;
/// }
///
/// let add = MethodDescriptor::new::<dyn Calc>("add")
///     .param::<i32>("a")
///     .param::<i32>("b")
///     .returns::<i32>();
/// assert_eq!(add.parameters().len(), 2);
/// assert_eq!(add.return_shape(), &ReturnShape::value::<i32>());
/// assert!(add.qualified_name().ends_with("Calc::add"));
/// ```
#[derive(Clone, Debug)]
pub struct MethodDescriptor {
    contract: TypeKey,
    name: &'static str,
    parameters: Vec<ParameterDescriptor>,
    returns: ReturnShape,
}

impl MethodDescriptor {
    /// 为契约 `C` 声明方法，默认无参数、无返回。
    pub fn new<C: ?Sized + 'static>(name: &'static str) -> Self {
        Self::for_contract(TypeKey::of::<C>(), name)
    }

    /// 以契约类型标识声明方法。
    pub fn for_contract(contract: TypeKey, name: &'static str) -> Self {
        Self {
            contract,
            name,
            parameters: Vec::new(),
            returns: ReturnShape::Void,
        }
    }

    /// 追加参数。
    pub fn param<T: 'static>(mut self, name: &'static str) -> Self {
        self.parameters.push(ParameterDescriptor {
            name,
            ty: TypeKey::of::<T>(),
        });
        self
    }

    /// 同步返回 `T`。
    pub fn returns<T: 'static>(mut self) -> Self {
        self.returns = ReturnShape::value::<T>();
        self
    }

    /// 以 [`AsyncResult<T>`] 异步返回 `T`。
    pub fn returns_future<T: 'static>(mut self) -> Self {
        self.returns = ReturnShape::future::<T>();
        self
    }

    /// 指定任意返回形态。
    pub fn returns_shape(mut self, shape: ReturnShape) -> Self {
        self.returns = shape;
        self
    }

    pub(crate) fn rebind(mut self, contract: TypeKey) -> Self {
        self.contract = contract;
        self
    }

    /// 契约类型。
    pub fn contract(&self) -> TypeKey {
        self.contract
    }

    /// 方法名。
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 参数列表。
    pub fn parameters(&self) -> &[ParameterDescriptor] {
        &self.parameters
    }

    /// 声明的返回形态。
    pub fn return_shape(&self) -> &ReturnShape {
        &self.returns
    }

    /// `契约::方法` 形式的限定名。
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.contract.name(), self.name)
    }
}
