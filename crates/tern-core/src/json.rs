//! JSON pass-through and serde conversion of values

use crate::context::Context;
use crate::error::BridgeResult;
use crate::value::Value;
use serde::Serialize;
use serde::de::DeserializeOwned;

impl Context {
    /// Parse `text` with the engine's `JSON.parse`
    pub fn json_parse(&self, text: &str) -> BridgeResult<Value> {
        let _guard = self.guard()?;
        self.finish(self.raw().json_parse(text))
    }

    /// Stringify with the engine's `JSON.stringify`. Values without a JSON
    /// form (undefined, functions) produce `"undefined"`.
    pub fn json_stringify(&self, value: &Value) -> BridgeResult<String> {
        let _guard = self.guard()?;
        let raw = self.resolve(value)?;
        Ok(self
            .raw()
            .json_stringify(&raw)?
            .unwrap_or_else(|| "undefined".to_string()))
    }

    /// Build an engine value from any serializable host value
    pub fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> BridgeResult<Value> {
        let text = serde_json::to_string(value)?;
        self.json_parse(&text)
    }
}

impl Value {
    /// Convert to a host type through its JSON form
    pub fn deserialize<T: DeserializeOwned>(&self) -> BridgeResult<T> {
        let text = self.context().json_stringify(self)?;
        Ok(serde_json::from_str(&text)?)
    }
}
