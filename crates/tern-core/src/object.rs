//! Property access on object values

use crate::error::{BridgeError, BridgeResult};
use crate::value::Value;
use std::ops::Deref;

/// A [`Value`] known to be an object (including arrays, functions and
/// promises).
#[derive(Clone, Debug)]
pub struct Object {
    value: Value,
}

impl Deref for Object {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.value
    }
}

impl From<Object> for Value {
    fn from(object: Object) -> Self {
        object.value
    }
}

impl Object {
    pub(crate) fn from_value(value: Value) -> Self {
        Self { value }
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn get(&self, key: &str) -> BridgeResult<Value> {
        let context = self.context();
        let _guard = context.guard()?;
        let object = self.raw()?;
        context.finish(context.raw().get(&object, key))
    }

    pub fn get_idx(&self, index: u32) -> BridgeResult<Value> {
        let context = self.context();
        let _guard = context.guard()?;
        let object = self.raw()?;
        context.finish(context.raw().get_index(&object, index))
    }

    /// Set `key` to `value`; `value` may come from any context of the isolate
    pub fn set(&self, key: &str, value: &Value) -> BridgeResult<()> {
        let context = self.context();
        let _guard = context.guard()?;
        let object = self.raw()?;
        let value = context.resolve(value)?;
        Ok(context.raw().set(&object, key, value)?)
    }

    pub fn set_idx(&self, index: u32, value: &Value) -> BridgeResult<()> {
        let context = self.context();
        let _guard = context.guard()?;
        let object = self.raw()?;
        let value = context.resolve(value)?;
        Ok(context.raw().set_index(&object, index, value)?)
    }

    pub fn has(&self, key: &str) -> BridgeResult<bool> {
        let context = self.context();
        let _guard = context.guard()?;
        let object = self.raw()?;
        Ok(context.raw().has(&object, key)?)
    }

    pub fn has_idx(&self, index: u32) -> BridgeResult<bool> {
        let context = self.context();
        let _guard = context.guard()?;
        let object = self.raw()?;
        Ok(context.raw().has_index(&object, index)?)
    }

    pub fn delete(&self, key: &str) -> BridgeResult<bool> {
        let context = self.context();
        let _guard = context.guard()?;
        let object = self.raw()?;
        Ok(context.raw().delete(&object, key)?)
    }

    pub fn delete_idx(&self, index: u32) -> BridgeResult<bool> {
        let context = self.context();
        let _guard = context.guard()?;
        let object = self.raw()?;
        Ok(context.raw().delete_index(&object, index)?)
    }

    /// Property key of `key` as scripts would compute it
    fn property_key(&self, key: &Value) -> BridgeResult<String> {
        let context = self.context();
        let key = context.resolve(key)?;
        Ok(context.raw().to_string(&key))
    }

    /// Get by a key value, converted with the engine's string conversion
    pub fn get_key(&self, key: &Value) -> BridgeResult<Value> {
        let context = self.context();
        let _guard = context.guard()?;
        let object = self.raw()?;
        let key = self.property_key(key)?;
        context.finish(context.raw().get(&object, &key))
    }

    pub fn set_key(&self, key: &Value, value: &Value) -> BridgeResult<()> {
        let context = self.context();
        let _guard = context.guard()?;
        let object = self.raw()?;
        let key = self.property_key(key)?;
        let value = context.resolve(value)?;
        Ok(context.raw().set(&object, &key, value)?)
    }

    pub fn has_key(&self, key: &Value) -> BridgeResult<bool> {
        let context = self.context();
        let _guard = context.guard()?;
        let object = self.raw()?;
        let key = self.property_key(key)?;
        Ok(context.raw().has(&object, &key)?)
    }

    pub fn delete_key(&self, key: &Value) -> BridgeResult<bool> {
        let context = self.context();
        let _guard = context.guard()?;
        let object = self.raw()?;
        let key = self.property_key(key)?;
        Ok(context.raw().delete(&object, &key)?)
    }

    /// Call the function stored under `name` with this object as `this`
    pub fn method_call(&self, name: &str, args: &[&Value]) -> BridgeResult<Value> {
        let context = self.context();
        let _guard = context.guard()?;
        let object = self.raw()?;
        let raw = context.raw();
        let method = raw.get(&object, name)?;
        let args = args
            .iter()
            .map(|arg| context.resolve(arg))
            .collect::<BridgeResult<Vec<_>>>()?;
        context.finish(raw.call(&method, &object, &args))
    }

    pub fn internal_field_count(&self) -> BridgeResult<usize> {
        let context = self.context();
        let _guard = context.guard()?;
        let object = self.raw()?;
        Ok(context.raw().internal_field_count(&object))
    }

    pub fn get_internal_field(&self, index: usize) -> BridgeResult<Value> {
        let context = self.context();
        let _guard = context.guard()?;
        let object = self.raw()?;
        match context.raw().internal_field(&object, index) {
            Some(value) => Ok(context.root(value)),
            None => Err(BridgeError::InternalFieldOutOfRange {
                index,
                count: context.raw().internal_field_count(&object),
            }),
        }
    }

    /// Store `value` in internal field `index`; `value` may come from any
    /// context of the isolate
    pub fn set_internal_field(&self, index: usize, value: &Value) -> BridgeResult<()> {
        let context = self.context();
        let _guard = context.guard()?;
        let object = self.raw()?;
        let value = context.resolve(value)?;
        if context.raw().set_internal_field(&object, index, value)? {
            Ok(())
        } else {
            Err(BridgeError::InternalFieldOutOfRange {
                index,
                count: context.raw().internal_field_count(&object),
            })
        }
    }

    /// Own enumerable property names in insertion order
    pub fn keys(&self) -> BridgeResult<Vec<String>> {
        let context = self.context();
        let _guard = context.guard()?;
        let object = self.raw()?;
        Ok(context.raw().own_keys(&object)?)
    }

    /// Array length, or the numeric `length` property of other objects
    pub fn length(&self) -> BridgeResult<usize> {
        let context = self.context();
        let _guard = context.guard()?;
        let object = self.raw()?;
        let raw = context.raw();
        if let Some(length) = raw.array_length(&object) {
            return Ok(length);
        }
        let length = raw.to_number(&raw.get(&object, "length")?);
        Ok(if length.is_finite() && length > 0.0 {
            length as usize
        } else {
            0
        })
    }
}
