//! Object templates: an isolate-level blueprint for host-shaped objects

use crate::context::Context;
use crate::error::{BridgeError, BridgeResult};
use crate::function::FunctionTemplate;
use crate::isolate::Isolate;
use crate::object::Object;
use crate::value::Value;
use std::sync::Arc;
use tracing::trace;

/// What a template property is instantiated from
#[derive(Debug, Clone)]
pub enum TemplateValue {
    /// Copied into each instance through its JSON form
    Json(serde_json::Value),
    /// A fresh function of the instance's context
    Function(FunctionTemplate),
    /// A nested instance
    Object(ObjectTemplate),
}

impl From<serde_json::Value> for TemplateValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<&str> for TemplateValue {
    fn from(value: &str) -> Self {
        Self::Json(value.into())
    }
}

impl From<bool> for TemplateValue {
    fn from(value: bool) -> Self {
        Self::Json(value.into())
    }
}

impl From<i32> for TemplateValue {
    fn from(value: i32) -> Self {
        Self::Json(value.into())
    }
}

impl From<f64> for TemplateValue {
    fn from(value: f64) -> Self {
        Self::Json(value.into())
    }
}

impl From<FunctionTemplate> for TemplateValue {
    fn from(template: FunctionTemplate) -> Self {
        Self::Function(template)
    }
}

impl From<ObjectTemplate> for TemplateValue {
    fn from(template: ObjectTemplate) -> Self {
        Self::Object(template)
    }
}

/// Properties and an internal field count, instantiated into any context
/// of the isolate that created the template.
///
/// Internal fields hold values scripts cannot see; hosts use them to tie
/// an instance back to native state.
#[derive(Debug, Clone)]
pub struct ObjectTemplate {
    isolate: Isolate,
    internal_fields: usize,
    properties: Vec<(Arc<str>, TemplateValue)>,
}

impl ObjectTemplate {
    pub fn new(isolate: &Isolate) -> Self {
        Self {
            isolate: isolate.clone(),
            internal_fields: 0,
            properties: Vec::new(),
        }
    }

    /// Set property `name` on every future instance, replacing an earlier
    /// setting of the same name
    pub fn set(&mut self, name: &str, value: impl Into<TemplateValue>) {
        let value = value.into();
        match self.properties.iter_mut().find(|(key, _)| &**key == name) {
            Some((_, slot)) => *slot = value,
            None => self.properties.push((Arc::from(name), value)),
        }
    }

    pub fn set_internal_field_count(&mut self, count: usize) {
        self.internal_fields = count;
    }

    pub fn internal_field_count(&self) -> usize {
        self.internal_fields
    }

    /// Create an object in `context` with this template's properties and
    /// internal fields
    pub fn new_instance(&self, context: &Context) -> BridgeResult<Object> {
        if !context.isolate().ptr_eq(&self.isolate) {
            return Err(BridgeError::IsolateMismatch);
        }
        let _guard = context.guard()?;
        let raw = context.raw().new_object_with_internal_fields(self.internal_fields)?;
        let object = Object::from_value(context.root(raw));
        for (name, value) in &self.properties {
            let value: Value = match value {
                TemplateValue::Json(json) => context.serialize(json)?,
                TemplateValue::Function(template) => template.get_function(context)?.into(),
                TemplateValue::Object(template) => template.new_instance(context)?.into(),
            };
            object.set(name, &value)?;
        }
        trace!(
            context = context.id(),
            properties = self.properties.len(),
            internal_fields = self.internal_fields,
            "Instantiated object template"
        );
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instances_get_properties_and_functions() {
        let isolate = Isolate::new();
        let context = Context::new(&isolate).unwrap();
        let mut point = isolate.new_object_template();
        point.set("x", 1);
        point.set("label", "origin");
        point.set("x", 3);
        point.set(
            "double",
            isolate.new_function_template(|info| {
                let x = info.this().as_object().ok()?.get("x").ok()?.to_number().ok()?;
                info.context().number(x * 2.0).ok()
            }),
        );
        let mut meta = isolate.new_object_template();
        meta.set("tags", serde_json::json!(["a", "b"]));
        point.set("meta", meta);

        let instance = point.new_instance(&context).unwrap();
        context.global().unwrap().set("p", &instance).unwrap();
        assert_eq!(context.eval("p.x").unwrap().to_number().unwrap(), 3.0);
        assert_eq!(context.eval("p.label").unwrap().to_string().unwrap(), "origin");
        assert_eq!(context.eval("p.double()").unwrap().to_number().unwrap(), 6.0);
        assert_eq!(context.eval("p.meta.tags.join('-')").unwrap().to_string().unwrap(), "a-b");
        assert_eq!(context.eval("Object.keys(p).length").unwrap().to_number().unwrap(), 4.0);
    }

    #[test]
    fn test_internal_fields() {
        let isolate = Isolate::new();
        let context = Context::new(&isolate).unwrap();
        let mut template = ObjectTemplate::new(&isolate);
        template.set_internal_field_count(2);

        let instance = template.new_instance(&context).unwrap();
        assert_eq!(instance.internal_field_count().unwrap(), 2);
        assert!(instance.get_internal_field(0).unwrap().is_undefined().unwrap());

        let secret = context.string("native state").unwrap();
        instance.set_internal_field(1, &secret).unwrap();
        assert_eq!(
            instance.get_internal_field(1).unwrap().to_string().unwrap(),
            "native state"
        );
        assert!(matches!(
            instance.get_internal_field(2),
            Err(BridgeError::InternalFieldOutOfRange { index: 2, count: 2 })
        ));
        assert!(instance.set_internal_field(5, &secret).is_err());

        // Scripts see none of it
        context.global().unwrap().set("o", &instance).unwrap();
        assert_eq!(context.eval("Object.keys(o).length").unwrap().to_number().unwrap(), 0.0);
    }

    #[test]
    fn test_internal_field_keeps_object_alive() {
        let isolate = Isolate::new();
        let context = Context::new(&isolate).unwrap();
        let mut template = isolate.new_object_template();
        template.set_internal_field_count(1);
        let holder = template.new_instance(&context).unwrap();
        context
            .with_scope(|cx| {
                let payload = cx.eval("({kept: true})").unwrap();
                holder.set_internal_field(0, &payload).unwrap();
            })
            .unwrap();
        isolate.collect_garbage();
        let payload = holder.get_internal_field(0).unwrap().as_object().unwrap();
        assert!(payload.get("kept").unwrap().to_boolean().unwrap());
    }

    #[test]
    fn test_template_of_other_isolate() {
        let a = Isolate::new();
        let b = Isolate::new();
        let context = Context::new(&b).unwrap();
        assert!(matches!(
            a.new_object_template().new_instance(&context),
            Err(BridgeError::IsolateMismatch)
        ));
    }
}
