use serde_json::Value;

use crate::credits::types::DEFAULT_BALANCE_POINTER;

/// Finds a remaining-balance hint piggybacked on a feature response body.
#[derive(Debug, Clone)]
pub struct InlineExtractor {
    pointers: Vec<String>,
}

impl InlineExtractor {
    pub fn new(pointers: Vec<String>) -> Self {
        let pointers = pointers
            .into_iter()
            .map(|pointer| pointer.trim().to_string())
            .filter(|pointer| pointer.starts_with('/'))
            .collect::<Vec<_>>();

        if pointers.is_empty() {
            return Self::default();
        }
        Self { pointers }
    }

    /// First configured pointer that resolves to an integer wins. Integral
    /// floats (`12.0`) and numeric strings (`"12"`) count as integers.
    pub fn extract(&self, body: &Value) -> Option<i64> {
        self.pointers
            .iter()
            .filter_map(|pointer| body.pointer(pointer))
            .find_map(parse_balance_value)
    }

    pub fn pointers(&self) -> &[String] {
        &self.pointers
    }
}

impl Default for InlineExtractor {
    fn default() -> Self {
        Self {
            pointers: vec![DEFAULT_BALANCE_POINTER.to_string()],
        }
    }
}

pub(crate) fn parse_balance_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.fract() == 0.0 && float.abs() < i64::MAX as f64)
                .map(|float| float as i64)
        }),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}
