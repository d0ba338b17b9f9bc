//! The built-in `viewBag` component: a free-form property bag every page,
//! layout and partial carries.

use super::{Component, ComponentDetails};
use serde_json::{Map, Value};

#[derive(Debug, Default, Clone, Copy)]
pub struct ViewBag;

impl Component for ViewBag {
    fn details(&self) -> ComponentDetails {
        ComponentDetails::new("Unknown component", "Stores custom template data")
    }

    /// Templates read the bag's properties directly: `{{ viewBag.title }}`.
    fn template_value(&self, _alias: &str, properties: &Map<String, Value>) -> Value {
        Value::Object(properties.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exposes_properties_directly() {
        let props = json!({"title": "About"}).as_object().cloned().expect("object");
        assert_eq!(ViewBag.template_value("viewBag", &props), json!({"title": "About"}));
        assert!(ViewBag.define_properties().is_empty());
    }
}
