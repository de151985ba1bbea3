use std::{any::Any, sync::Arc};

use strand_ioc::Instance;

use crate::{
    dispatch::result::{Payload, ReturnValue},
    error::{DispatchError, Fault},
};

/// 类型擦除的方法调用器：以实现实例与参数产出声明形态的返回值。
pub type MethodInvoker =
    Arc<dyn Fn(&Instance, &mut MethodArguments<'_>) -> Result<ReturnValue, Fault> + Send + Sync>;

/// `take` 取走参数后留在原位的标记。
struct Taken;

/// 实现分发步骤交给调用器的参数视图。
///
/// - **契约 (What)**：`take` 取走参数并在原位留下标记，再次读取该位置得到
///   [`DispatchError::ArgumentTaken`]；`get` 只借用，适合非 `Clone` 但只需读取的参数；
/// - **风险提示 (Trade-offs)**：重放后续步骤的通知（如重试）会把同一组参数再次交给调用器，
///   可能被重放的方法应以 `cloned`/`get` 读取参数。
pub struct MethodArguments<'a> {
    method: &'a str,
    values: &'a mut Vec<Payload>,
}

impl<'a> MethodArguments<'a> {
    pub(crate) fn new(method: &'a str, values: &'a mut Vec<Payload>) -> Self {
        Self { method, values }
    }

    /// 参数个数。
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// 是否没有参数。
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn mismatch<T>(&self, index: usize) -> DispatchError {
        if self.values.get(index).is_some_and(|value| value.is::<Taken>()) {
            return DispatchError::ArgumentTaken {
                method: self.method.to_owned(),
                index,
            };
        }
        DispatchError::ArgumentType {
            method: self.method.to_owned(),
            index,
            expected: std::any::type_name::<T>(),
        }
    }

    /// 借用指定位置的参数。
    pub fn get<T: Any>(&self, index: usize) -> Result<&T, DispatchError> {
        self.values
            .get(index)
            .and_then(|value| value.downcast_ref::<T>())
            .ok_or_else(|| self.mismatch::<T>(index))
    }

    /// 克隆指定位置的参数。
    pub fn cloned<T: Any + Clone>(&self, index: usize) -> Result<T, DispatchError> {
        self.get::<T>(index).cloned()
    }

    /// 取走指定位置的参数。
    pub fn take<T: Any>(&mut self, index: usize) -> Result<T, DispatchError> {
        if !self.values.get(index).is_some_and(|value| value.is::<T>()) {
            return Err(self.mismatch::<T>(index));
        }
        let value = std::mem::replace(&mut self.values[index], Box::new(Taken));
        value
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| self.mismatch::<T>(index))
    }
}

/// 以逗号分隔的表达式构造参数列表。
///
/// ```rust
/// use strand_core::arguments;
///
/// let values = arguments![2_i32, String::from("x")];
/// assert_eq!(values.len(), 2);
/// assert_eq!(values[0].downcast_ref::<i32>(), Some(&2));
/// ```
#[macro_export]
macro_rules! arguments {
    () => {
        ::std::vec::Vec::<$crate::dispatch::result::Payload>::new()
    };
    ($($value:expr),+ $(,)?) => {
        ::std::vec![$($crate::dispatch::result::payload($value)),+]
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arguments;

    #[test]
    fn taken_arguments_report_a_second_read() {
        let mut values = arguments![String::from("sku"), 3_u32];
        let mut arguments = MethodArguments::new("t::m", &mut values);

        assert_eq!(arguments.cloned::<u32>(1).unwrap(), 3);
        assert_eq!(arguments.cloned::<u32>(1).unwrap(), 3);
        assert_eq!(arguments.take::<String>(0).unwrap(), "sku");
        assert!(matches!(
            arguments.take::<String>(0),
            Err(DispatchError::ArgumentTaken { index: 0, .. })
        ));
        assert!(matches!(
            arguments.get::<u32>(0),
            Err(DispatchError::ArgumentTaken { index: 0, .. })
        ));
        assert!(matches!(
            arguments.get::<String>(1),
            Err(DispatchError::ArgumentType { index: 1, .. })
        ));
    }
}
