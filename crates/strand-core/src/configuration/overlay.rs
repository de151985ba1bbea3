//! # overlay 模块说明
//!
//! ## 角色定位（Why）
//! - 允许以 TOML 文件批量写入作用域值，部署环境无需改代码即可调整通知行为；
//! - 表结构与作用域树一一对应：`[global]`、`[module.<名>]`、`[contract."<契约类型名>"]`、
//!   `[method."<契约类型名>".<方法名>]`。
//!
//! ## 映射规则（What）
//! - 标量映射为 `bool`、`i64`、`f64`、`String`；字符串数组映射为 `Vec<String>`；
//! - 其余值（日期、表、混合数组）返回 [`ConfigurationError::UnsupportedValue`]；
//! - 契约表优先匹配已存在的契约节点，不存在时按类型名推导模块后创建。
//!
//! ## 风险提示（Trade-offs）
//! - 覆盖过程不是事务性的：中途失败时，已处理的表保持写入状态。

use std::{collections::BTreeMap, sync::Arc};

use serde::Deserialize;
use toml::{Table, Value};

use crate::{
    configuration::scope::{ConfigurationScope, ScopeTree, ScopeValue},
    error::ConfigurationError,
};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Overlay {
    global: Table,
    module: BTreeMap<String, Table>,
    contract: BTreeMap<String, Table>,
    method: BTreeMap<String, BTreeMap<String, Table>>,
}

impl ScopeTree {
    /// 应用 TOML 配置覆盖。
    pub fn apply_toml(&self, text: &str) -> Result<(), ConfigurationError> {
        let overlay: Overlay = toml::from_str(text)?;

        write_table(self.global(), &overlay.global)?;
        for (module, table) in &overlay.module {
            write_table(&self.module(module)?, table)?;
        }
        for (contract, table) in &overlay.contract {
            write_table(&self.contract_by_name(contract)?, table)?;
        }
        for (contract, methods) in &overlay.method {
            let contract_scope = self.contract_by_name(contract)?;
            for (method, table) in methods {
                write_table(&self.method(&contract_scope, method)?, table)?;
            }
        }
        Ok(())
    }
}

fn write_table(scope: &Arc<ConfigurationScope>, table: &Table) -> Result<(), ConfigurationError> {
    for (key, value) in table {
        let converted = convert(value).ok_or_else(|| ConfigurationError::UnsupportedValue {
            scope: scope.path(),
            key: key.clone(),
            found: value.type_str().to_owned(),
        })?;
        scope.set_raw(key.clone(), converted, false);
    }
    Ok(())
}

fn convert(value: &Value) -> Option<ScopeValue> {
    let converted: ScopeValue = match value {
        Value::Boolean(flag) => Arc::new(*flag),
        Value::Integer(number) => Arc::new(*number),
        Value::Float(number) => Arc::new(*number),
        Value::String(text) => Arc::new(text.clone()),
        Value::Array(items) => {
            let strings = items
                .iter()
                .map(|item| item.as_str().map(str::to_owned))
                .collect::<Option<Vec<String>>>()?;
            Arc::new(strings)
        }
        Value::Datetime(_) | Value::Table(_) => return None,
    };
    Some(converted)
}
