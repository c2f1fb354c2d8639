//! Conversion between engine values and host values
//!
//! Host values are `serde_json::Value`. Numbers that are integral and exactly
//! representable come back as JSON integers so `2 + 2` maps to `4`, not `4.0`.
//! Non-finite numbers map to null, matching `JSON.stringify`.

use serde_json::{Number, Value};

/// Nesting limit for arrays/objects in either direction
pub const MAX_DEPTH: usize = 64;

/// Array elements plus object entries one script result may hold
pub const MAX_ELEMENTS: usize = 100_000;

/// Largest integer a double represents exactly
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("value nests deeper than {0} levels")]
    TooDeep(usize),

    #[error("cannot convert {0} to a host value")]
    Unsupported(&'static str),

    #[error("string too long for the script engine")]
    StringTooLong,

    #[error("value holds more than {0} elements")]
    TooLarge(usize),
}

/// Elements left to map for one value
#[derive(Debug)]
#[cfg_attr(not(feature = "v8"), allow(dead_code))]
struct Budget {
    remaining: usize,
}

#[cfg_attr(not(feature = "v8"), allow(dead_code))]
impl Budget {
    fn new() -> Self {
        Self {
            remaining: MAX_ELEMENTS,
        }
    }

    /// Claim `count` elements up front, before any of them is visited
    fn take(&mut self, count: usize) -> Result<(), MappingError> {
        self.remaining = self
            .remaining
            .checked_sub(count)
            .ok_or(MappingError::TooLarge(MAX_ELEMENTS))?;
        Ok(())
    }
}

/// Map an engine number onto the narrowest JSON number
pub fn number_to_host(number: f64) -> Value {
    if !number.is_finite() {
        return Value::Null;
    }
    if number.fract() == 0.0 && number.abs() <= MAX_SAFE_INTEGER {
        return Value::from(number as i64);
    }
    Number::from_f64(number)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(feature = "v8")]
pub use self::v8_mapping::{from_v8, to_v8};

#[cfg(feature = "v8")]
mod v8_mapping {
    use super::{number_to_host, Budget, MappingError, MAX_DEPTH};
    use deno_core::v8;
    use serde_json::{Map, Value};

    /// Convert a script value into a host value
    pub fn from_v8<'s>(
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
    ) -> Result<Value, MappingError> {
        to_host(scope, value, 0, &mut Budget::new())
    }

    fn to_host<'s>(
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
        depth: usize,
        budget: &mut Budget,
    ) -> Result<Value, MappingError> {
        if depth > MAX_DEPTH {
            return Err(MappingError::TooDeep(MAX_DEPTH));
        }

        if value.is_null_or_undefined() {
            return Ok(Value::Null);
        }
        if value.is_boolean() {
            return Ok(Value::Bool(value.boolean_value(scope)));
        }
        if value.is_number() {
            let number = value.number_value(scope).unwrap_or(f64::NAN);
            return Ok(number_to_host(number));
        }
        if value.is_big_int() {
            let big = v8::Local::<v8::BigInt>::try_from(value)
                .map_err(|_| MappingError::Unsupported("bigint"))?;
            return match big.i64_value() {
                (n, true) => Ok(Value::from(n)),
                (_, false) => Err(MappingError::Unsupported("bigint outside i64 range")),
            };
        }
        if value.is_string() {
            return Ok(Value::String(value.to_rust_string_lossy(scope)));
        }
        if value.is_function() {
            return Err(MappingError::Unsupported("function"));
        }
        if value.is_symbol() {
            return Err(MappingError::Unsupported("symbol"));
        }

        if value.is_array() {
            let array = v8::Local::<v8::Array>::try_from(value)
                .map_err(|_| MappingError::Unsupported("array"))?;
            // The length is script-controlled; sparse arrays claim it all
            let length = array.length();
            budget.take(length as usize)?;
            let mut items = Vec::new();
            for index in 0..length {
                let item = match array.get_index(scope, index) {
                    Some(item) => item,
                    None => v8::undefined(scope).into(),
                };
                items.push(to_host(scope, item, depth + 1, budget)?);
            }
            return Ok(Value::Array(items));
        }

        if value.is_object() {
            let object = value
                .to_object(scope)
                .ok_or(MappingError::Unsupported("object"))?;
            let names = object
                .get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
                .ok_or(MappingError::Unsupported("object"))?;
            budget.take(names.length() as usize)?;
            let mut map = Map::new();
            for index in 0..names.length() {
                let Some(key) = names.get_index(scope, index) else {
                    continue;
                };
                let name = key.to_rust_string_lossy(scope);
                let item = match object.get(scope, key) {
                    Some(item) => item,
                    None => v8::undefined(scope).into(),
                };
                if item.is_function() || item.is_symbol() {
                    continue;
                }
                map.insert(name, to_host(scope, item, depth + 1, budget)?);
            }
            return Ok(Value::Object(map));
        }

        Err(MappingError::Unsupported("value"))
    }

    /// Convert a host value into a script value for injection
    pub fn to_v8<'s>(
        scope: &mut v8::HandleScope<'s>,
        value: &Value,
    ) -> Result<v8::Local<'s, v8::Value>, MappingError> {
        to_script(scope, value, 0)
    }

    fn to_script<'s>(
        scope: &mut v8::HandleScope<'s>,
        value: &Value,
        depth: usize,
    ) -> Result<v8::Local<'s, v8::Value>, MappingError> {
        if depth > MAX_DEPTH {
            return Err(MappingError::TooDeep(MAX_DEPTH));
        }

        let local: v8::Local<'s, v8::Value> = match value {
            Value::Null => v8::null(scope).into(),
            Value::Bool(b) => v8::Boolean::new(scope, *b).into(),
            Value::Number(n) => match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                Some(small) => v8::Integer::new(scope, small).into(),
                None => v8::Number::new(scope, n.as_f64().unwrap_or(f64::NAN)).into(),
            },
            Value::String(s) => v8::String::new(scope, s)
                .ok_or(MappingError::StringTooLong)?
                .into(),
            Value::Array(items) => {
                let array = v8::Array::new(scope, items.len() as i32);
                for (index, item) in items.iter().enumerate() {
                    let element = to_script(scope, item, depth + 1)?;
                    array.set_index(scope, index as u32, element);
                }
                array.into()
            }
            Value::Object(map) => {
                let object = v8::Object::new(scope);
                for (name, item) in map {
                    let key = v8::String::new(scope, name).ok_or(MappingError::StringTooLong)?;
                    let element = to_script(scope, item, depth + 1)?;
                    object.set(scope, key.into(), element);
                }
                object.into()
            }
        };
        Ok(local)
    }
}
