//! 费用估算
//!
//! 按模型名精确查找静态价格表（美元 / 百万 token）。
//! 缓存相关 token 不计入费用。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 单个模型价格（每百万 token）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

impl ModelPrice {
    pub const fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }
}

/// 内置价格表
const DEFAULT_PRICES: &[(&str, ModelPrice)] = &[
    // Anthropic
    ("claude-opus-4-6", ModelPrice::new(15.00, 75.00)),
    ("claude-opus-4-6-20250610", ModelPrice::new(15.00, 75.00)),
    ("claude-sonnet-4-5", ModelPrice::new(3.00, 15.00)),
    ("claude-sonnet-4-5-20250514", ModelPrice::new(3.00, 15.00)),
    ("claude-sonnet-4-5-20250929", ModelPrice::new(3.00, 15.00)),
    ("claude-haiku-4-5", ModelPrice::new(0.80, 4.00)),
    ("claude-haiku-4-5-20251001", ModelPrice::new(0.80, 4.00)),
    // Z.AI / GLM
    ("glm-4.7", ModelPrice::new(0.60, 0.60)),
    ("glm-4.7-flash", ModelPrice::new(0.06, 0.06)),
];

const TOKENS_PER_UNIT: f64 = 1_000_000.0;

/// 不可变价格表，进程启动时构建一次
#[derive(Debug, Clone)]
pub struct PriceTable {
    prices: HashMap<String, ModelPrice>,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            prices: DEFAULT_PRICES
                .iter()
                .map(|(model, price)| (model.to_string(), *price))
                .collect(),
        }
    }
}

impl PriceTable {
    /// 内置价格表叠加配置中的覆盖项
    pub fn with_overrides<I>(overrides: I) -> Self
    where
        I: IntoIterator<Item = (String, ModelPrice)>,
    {
        let mut table = Self::default();
        table.prices.extend(overrides);
        table
    }

    pub fn get(&self, model: &str) -> Option<ModelPrice> {
        self.prices.get(model).copied()
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    /// 估算费用；未知模型返回 `None`（与真实的 0 区分）
    pub fn estimate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Option<f64> {
        let price = self.get(model)?;
        Some(
            (input_tokens as f64 * price.input + output_tokens as f64 * price.output)
                / TOKENS_PER_UNIT,
        )
    }
}
