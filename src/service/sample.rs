//! Sample services for checking that a daemon is reachable and dispatching.

use super::{parameter, Args, CallContext, Operation, Service, ServiceCatalog};
use crate::config::Parameters;
use crate::error::{LabError, Result};
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Duration;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

const ECHO_PREFIX: &str = "SERVER RECEIVED: ";

pub fn register(catalog: &mut ServiceCatalog) {
    catalog.register("sample.SampleService", |_| Ok(Box::new(SampleService::new())));
    catalog.register("sample.SelectiveSampleService", |params| {
        Ok(Box::new(SelectiveSampleService::from_parameters(params)?))
    });
}

fn next_instance_id() -> u64 {
    NEXT_INSTANCE.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Stateless arithmetic and echo operations.
pub struct SampleService {
    instance: u64,
}

impl SampleService {
    const OPERATIONS: &'static [Operation] = &[
        Operation {
            name: "echo",
            params: &["message"],
            returns: "string",
            summary: "Echo the message prefixed with \"SERVER RECEIVED: \"",
        },
        Operation {
            name: "delayed_echo",
            params: &["message", "seconds"],
            returns: "string",
            summary: "Echo after sleeping for the given number of seconds",
        },
        Operation {
            name: "add",
            params: &["*values"],
            returns: "number",
            summary: "Sum of all arguments",
        },
        Operation {
            name: "subtract",
            params: &["a", "b"],
            returns: "number",
            summary: "a - b",
        },
        Operation {
            name: "multiply",
            params: &["*values"],
            returns: "number",
            summary: "Product of all arguments",
        },
        Operation {
            name: "divide",
            params: &["num", "den"],
            returns: "number",
            summary: "num / den as a float",
        },
        Operation {
            name: "whoami",
            params: &[],
            returns: "string",
            summary: "Identifier of the instance that handled the call",
        },
    ];

    pub fn new() -> Self {
        let instance = next_instance_id();
        tracing::info!(instance, "SampleService created");
        Self { instance }
    }
}

impl Default for SampleService {
    fn default() -> Self {
        Self::new()
    }
}

/// Integer arithmetic while every operand is an integer and nothing overflows,
/// float arithmetic otherwise.
fn fold_numbers(
    values: &[&Value],
    init: i64,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value> {
    let numbers = values
        .iter()
        .map(|v| match v {
            Value::Number(n) => Ok(n.clone()),
            other => Err(LabError::InvalidArgument(format!(
                "expected a number, got {other}"
            ))),
        })
        .collect::<Result<Vec<Number>>>()?;

    let integral = numbers
        .iter()
        .try_fold(init, |acc, n| n.as_i64().and_then(|n| int_op(acc, n)));
    if let Some(total) = integral {
        return Ok(Value::from(total));
    }

    let total = numbers
        .iter()
        .fold(init as f64, |acc, n| float_op(acc, n.as_f64().unwrap_or(f64::NAN)));
    Ok(Value::from(total))
}

fn float_result(value: f64) -> Result<Value> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| LabError::InvalidArgument("result is not a finite number".into()))
}

impl Service for SampleService {
    fn operations(&self) -> &'static [Operation] {
        Self::OPERATIONS
    }

    fn call(&self, _ctx: &CallContext, operation: &str, args: Args<'_>) -> Result<Value> {
        match operation {
            "echo" => {
                let message: String = args.required(0, "message")?;
                Ok(Value::String(format!("{ECHO_PREFIX}{message}")))
            }
            "delayed_echo" => {
                let message: String = args.required(0, "message")?;
                let seconds: f64 = args.required(1, "seconds")?;
                if !seconds.is_finite() || seconds < 0.0 {
                    return Err(LabError::InvalidArgument(
                        "seconds must be a non-negative number".into(),
                    ));
                }
                std::thread::sleep(Duration::from_secs_f64(seconds));
                Ok(Value::String(format!("{ECHO_PREFIX}{message}")))
            }
            "add" => fold_numbers(&args.positional(), 0, i64::checked_add, |a, b| a + b),
            "multiply" => fold_numbers(&args.positional(), 1, i64::checked_mul, |a, b| a * b),
            "subtract" => {
                let a: Value = args.required(0, "a")?;
                let b: Value = args.required(1, "b")?;
                match (a.as_i64(), b.as_i64()) {
                    (Some(a), Some(b)) if a.checked_sub(b).is_some() => Ok(Value::from(a - b)),
                    _ => {
                        let (a, b) = (as_f64(&a, "a")?, as_f64(&b, "b")?);
                        float_result(a - b)
                    }
                }
            }
            "divide" => {
                let num: Value = args.required(0, "num")?;
                let den: Value = args.required(1, "den")?;
                let (num, den) = (as_f64(&num, "num")?, as_f64(&den, "den")?);
                if den == 0.0 {
                    return Err(LabError::InvalidArgument("division by zero".into()));
                }
                float_result(num / den)
            }
            "whoami" => Ok(Value::String(format!("OBJECT ID: {}", self.instance))),
            other => Err(LabError::UnknownObject(other.to_string())),
        }
    }

    fn close(&self) {
        tracing::info!(instance = self.instance, "SampleService closed");
    }
}

fn as_f64(value: &Value, name: &str) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| LabError::InvalidArgument(format!("argument '{name}' must be a number")))
}

/// A list of items with indexed access. Only the listed operations are exposed.
pub struct SelectiveSampleService {
    items: Mutex<Vec<Value>>,
}

impl SelectiveSampleService {
    const OPERATIONS: &'static [Operation] = &[
        Operation {
            name: "items",
            params: &[],
            returns: "list",
            summary: "Current item list",
        },
        Operation {
            name: "set_items",
            params: &["items"],
            returns: "null",
            summary: "Replace the item list",
        },
        Operation {
            name: "sort",
            params: &["reverse"],
            returns: "null",
            summary: "Sort items in place",
        },
        Operation {
            name: "item",
            params: &["index"],
            returns: "any",
            summary: "Item at index; negative indexes count from the end",
        },
        Operation {
            name: "set_item",
            params: &["index", "value"],
            returns: "null",
            summary: "Replace the item at index",
        },
    ];

    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }

    pub fn from_parameters(parameters: &Parameters) -> Result<Self> {
        let items: Vec<Value> = parameter(parameters, "items")?.unwrap_or_default();
        Ok(Self::new(items))
    }

    fn resolve_index(len: usize, index: i64) -> Result<usize> {
        let resolved = if index < 0 {
            i64::try_from(len).ok().map(|len| len + index)
        } else {
            Some(index)
        };
        resolved
            .and_then(|i| usize::try_from(i).ok())
            .filter(|i| *i < len)
            .ok_or_else(|| LabError::InvalidArgument(format!("index {index} out of range")))
    }
}

fn compare_items(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

impl Service for SelectiveSampleService {
    fn operations(&self) -> &'static [Operation] {
        Self::OPERATIONS
    }

    fn call(&self, _ctx: &CallContext, operation: &str, args: Args<'_>) -> Result<Value> {
        let mut items = self.items.lock().expect("items lock poisoned");
        match operation {
            "items" => Ok(Value::Array(items.clone())),
            "set_items" => {
                *items = args.required(0, "items")?;
                Ok(Value::Null)
            }
            "sort" => {
                let reverse: bool = args.optional(0, "reverse")?.unwrap_or(false);
                let comparable = items
                    .windows(2)
                    .all(|pair| compare_items(&pair[0], &pair[1]).is_some());
                if !comparable {
                    return Err(LabError::InvalidArgument(
                        "items are not mutually comparable".into(),
                    ));
                }
                items.sort_by(|a, b| compare_items(a, b).unwrap_or(Ordering::Equal));
                if reverse {
                    items.reverse();
                }
                Ok(Value::Null)
            }
            "item" => {
                let index: i64 = args.required(0, "index")?;
                let index = Self::resolve_index(items.len(), index)?;
                Ok(items[index].clone())
            }
            "set_item" => {
                let index: i64 = args.required(0, "index")?;
                let value: Value = args.required(1, "value")?;
                let index = Self::resolve_index(items.len(), index)?;
                items[index] = value;
                Ok(Value::Null)
            }
            other => Err(LabError::UnknownObject(other.to_string())),
        }
    }
}
