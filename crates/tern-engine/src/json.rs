//! JSON.parse / JSON.stringify on top of serde_json

use crate::error::{EngineResult, ErrorKind};
use crate::value::{ObjectId, RawValue, ValueKind};
use crate::vm::Vm;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};

/// Integral numbers below this magnitude serialize without a fraction
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

pub(crate) fn parse(vm: &Vm<'_>, realm: u32, text: &str) -> EngineResult<RawValue> {
    let value: Value = serde_json::from_str(text)
        .map_err(|err| vm.throw_error(ErrorKind::SyntaxError, format!("Unexpected token in JSON: {err}")))?;
    from_json(vm, realm, &value)
}

fn from_json(vm: &Vm<'_>, realm: u32, value: &Value) -> EngineResult<RawValue> {
    Ok(match value {
        Value::Null => RawValue::Null,
        Value::Bool(b) => RawValue::Boolean(*b),
        Value::Number(n) => RawValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        Value::String(s) => RawValue::string(s.as_str()),
        Value::Array(items) => {
            let elements = items
                .iter()
                .map(|item| from_json(vm, realm, item))
                .collect::<EngineResult<Vec<_>>>()?;
            RawValue::Object(vm.new_array(realm, elements)?)
        }
        Value::Object(map) => {
            let object = vm.new_object()?;
            for (key, value) in map {
                let value = from_json(vm, realm, value)?;
                vm.define(object, key, value);
            }
            RawValue::Object(object)
        }
    })
}

/// Serialize `value`; `None` when it has no JSON form.
///
/// `indent` selects pretty output with that many spaces per level.
pub(crate) fn stringify(vm: &Vm<'_>, value: &RawValue, indent: Option<usize>) -> EngineResult<Option<String>> {
    let Some(json) = to_json(vm, value, &mut Vec::new())? else {
        return Ok(None);
    };
    let text = match indent.filter(|width| *width > 0) {
        None => serde_json::to_string(&json),
        Some(width) => {
            let indent = " ".repeat(width);
            let mut out = Vec::new();
            let mut serializer =
                serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(indent.as_bytes()));
            json.serialize(&mut serializer)
                .map(|()| String::from_utf8_lossy(&out).into_owned())
        }
    };
    text.map(Some)
        .map_err(|err| vm.throw_error(ErrorKind::Error, err.to_string()))
}

fn number(n: f64) -> Value {
    if !n.is_finite() {
        Value::Null
    } else if n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

fn to_json(vm: &Vm<'_>, value: &RawValue, visiting: &mut Vec<ObjectId>) -> EngineResult<Option<Value>> {
    let id = match value {
        RawValue::Undefined => return Ok(None),
        RawValue::Null => return Ok(Some(Value::Null)),
        RawValue::Boolean(b) => return Ok(Some(Value::Bool(*b))),
        RawValue::Number(n) => return Ok(Some(number(*n))),
        RawValue::String(s) => return Ok(Some(Value::String(s.to_string()))),
        RawValue::Object(id) => *id,
    };
    let kind = vm.kind_of(value);
    if kind == ValueKind::Function {
        return Ok(None);
    }
    if visiting.contains(&id) {
        return Err(vm.throw_error(ErrorKind::TypeError, "Converting circular structure to JSON"));
    }
    visiting.push(id);
    let json = if kind == ValueKind::Array {
        let mut items = Vec::new();
        for element in vm.array_elements(value).unwrap_or_default() {
            items.push(to_json(vm, &element, visiting)?.unwrap_or(Value::Null));
        }
        Value::Array(items)
    } else {
        let mut map = Map::new();
        for key in vm.own_keys(id) {
            let property = vm.get(value, &key)?;
            if let Some(property) = to_json(vm, &property, visiting)? {
                map.insert(key.to_string(), property);
            }
        }
        Value::Object(map)
    };
    visiting.pop();
    Ok(Some(json))
}
