//! Device selectors: boolean predicates over a device spec.
//!
//! A request carries zero or more selectors combined by AND. The core
//! treats selectors as opaque; the production implementation compiles a
//! CEL expression against the device's attribute and capacity maps.

use std::sync::Arc;

use cel::{Context, Program};
use thiserror::Error;

use crate::device::DeviceSpec;

/// Name of the variable the device is exposed under in CEL expressions.
const DEVICE_VARIABLE: &str = "device";

/// Errors a selector can produce.
#[derive(Debug, Error)]
pub enum SelectorError {
    /// The expression did not compile. Surfaced at request construction as
    /// a validation failure.
    #[error("failed to compile selector {expression:?}: {reason}")]
    Compile {
        /// The offending expression.
        expression: String,
        /// Compiler diagnostic.
        reason: String,
    },

    /// The expression compiled but evaluation failed against a device.
    #[error("failed to evaluate selector {expression:?}: {reason}")]
    Evaluation {
        /// The offending expression.
        expression: String,
        /// Evaluator diagnostic.
        reason: String,
    },
}

/// A boolean match of a device spec. Implementations must be pure: the
/// allocator may evaluate the same selector many times in one pass.
pub trait DeviceSelector: Send + Sync {
    /// Whether the device matches.
    fn matches(&self, driver: &str, spec: &DeviceSpec) -> Result<bool, SelectorError>;
}

/// Evaluates every selector against the device; AND semantics, short
/// circuiting on the first non-match. Errors propagate.
pub fn match_all(
    selectors: &[Arc<dyn DeviceSelector>],
    driver: &str,
    spec: &DeviceSpec,
) -> Result<bool, SelectorError> {
    for selector in selectors {
        if !selector.matches(driver, spec)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// The production selector: one compiled CEL expression.
///
/// The expression sees a single `device` variable:
///
/// ```text
/// device.attributes["type"] == "gpu" && device.capacity["memory"] >= 40960
/// ```
///
/// with `device.driver`, `device.name`, `device.attributes` (typed values)
/// and `device.capacity` (amounts) populated from the spec.
#[derive(Debug)]
pub struct CelSelector {
    expression: String,
    program: Program,
}

impl CelSelector {
    /// Compiles the expression. Compile failure is a request-validation
    /// error for the caller.
    pub fn new(expression: impl Into<String>) -> Result<Self, SelectorError> {
        let expression = expression.into();
        let program = Program::compile(&expression).map_err(|e| SelectorError::Compile {
            expression: expression.clone(),
            reason: e.to_string(),
        })?;
        Ok(CelSelector {
            expression,
            program,
        })
    }

    /// The source expression this selector was compiled from.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn device_value(&self, driver: &str, spec: &DeviceSpec) -> serde_json::Value {
        let capacity: serde_json::Map<String, serde_json::Value> = spec
            .capacity
            .iter()
            .map(|(name, cap)| (name.clone(), serde_json::Value::from(cap.amount)))
            .collect();
        serde_json::json!({
            "driver": driver,
            "name": spec.name,
            "attributes": spec.attributes,
            "capacity": capacity,
        })
    }
}

impl DeviceSelector for CelSelector {
    fn matches(&self, driver: &str, spec: &DeviceSpec) -> Result<bool, SelectorError> {
        let evaluation_error = |reason: String| SelectorError::Evaluation {
            expression: self.expression.clone(),
            reason,
        };

        let mut context = Context::default();
        context
            .add_variable(DEVICE_VARIABLE, self.device_value(driver, spec))
            .map_err(|e| evaluation_error(e.to_string()))?;
        let value = self
            .program
            .execute(&context)
            .map_err(|e| evaluation_error(e.to_string()))?;
        match value {
            cel::Value::Bool(b) => Ok(b),
            other => Err(evaluation_error(format!(
                "expression produced {:?}, expected a boolean",
                other
            ))),
        }
    }
}
