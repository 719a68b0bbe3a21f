//! Typed capability model.
//!
//! A device model carries a DTDL-like document: an array of interfaces, each with
//! an `@id`, optional `extends` and a `contents` list of telemetry, properties,
//! commands and component references. [`CapabilitySchema::parse`] turns that
//! document into plain structs once per model so the simulation engine never
//! touches loosely typed JSON.

use fleetsim_error::schema::SchemaError;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Value type declared by a telemetry field or property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Boolean,
    Date,
    DateTime,
    Double,
    Duration,
    Float,
    Geopoint,
    Integer,
    Long,
    String,
    Time,
    /// Object, enum, map or any schema the generator has no synthesizer for
    Unsupported,
}

impl ValueType {
    pub fn from_schema(schema: &str) -> Self {
        match schema.to_ascii_lowercase().as_str() {
            "boolean" => ValueType::Boolean,
            "date" => ValueType::Date,
            "datetime" => ValueType::DateTime,
            "double" => ValueType::Double,
            "duration" => ValueType::Duration,
            "float" => ValueType::Float,
            "geopoint" | "point" => ValueType::Geopoint,
            "integer" => ValueType::Integer,
            "long" => ValueType::Long,
            "string" => ValueType::String,
            "time" => ValueType::Time,
            _ => ValueType::Unsupported,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telemetry {
    pub name: String,
    pub value_type: ValueType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub value_type: ValueType,
    pub writable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    /// Synchronous commands are answered as direct methods, the rest arrive as cloud-to-device messages
    pub is_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Component {
    pub id: String,
    pub name: Option<String>,
    pub telemetry: Vec<Telemetry>,
    pub properties: Vec<Property>,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapabilitySchema {
    /// `@id` of the first interface in the document
    pub id: Option<String>,
    pub components: Vec<Component>,
}

impl CapabilitySchema {
    pub fn parse(document: &Value) -> Result<Self, SchemaError> {
        let interfaces: Vec<&Map<String, Value>> = match document {
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_object().ok_or_else(|| SchemaError::InvalidType {
                        field: "capabilityModel".to_string(),
                        reason: "every interface must be an object".to_string(),
                    })
                })
                .collect::<Result<_, _>>()?,
            Value::Object(obj) => vec![obj],
            Value::Null => Vec::new(),
            _ => {
                return Err(SchemaError::InvalidType {
                    field: "capabilityModel".to_string(),
                    reason: "expected an object or an array of interfaces".to_string(),
                })
            }
        };
        if interfaces.is_empty() {
            return Err(SchemaError::Empty);
        }

        let mut registry = HashMap::with_capacity(interfaces.len());
        for iface in &interfaces {
            registry.insert(required_str(iface, "@id", "interface")?, *iface);
        }

        let mut parser = Parser {
            registry,
            names: HashMap::new(),
            emitted: HashSet::new(),
            stack: Vec::new(),
            components: Vec::new(),
        };
        for iface in &interfaces {
            parser.visit(iface)?;
        }

        let Parser {
            names,
            mut components,
            ..
        } = parser;
        for component in components.iter_mut() {
            if let Some(name) = names.get(&component.id) {
                component.name = Some(name.clone());
            }
        }

        Ok(Self {
            id: interfaces
                .first()
                .and_then(|iface| iface.get("@id"))
                .and_then(Value::as_str)
                .map(str::to_string),
            components,
        })
    }

    pub fn telemetry(&self) -> impl Iterator<Item = &Telemetry> {
        self.components.iter().flat_map(|c| c.telemetry.iter())
    }

    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.components.iter().flat_map(|c| c.properties.iter())
    }

    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.components.iter().flat_map(|c| c.commands.iter())
    }

    #[inline]
    pub fn has_async_commands(&self) -> bool {
        self.commands().any(|c| !c.is_sync)
    }
}

struct Parser<'a> {
    registry: HashMap<String, &'a Map<String, Value>>,
    /// component interface id -> name given by the referencing content item
    names: HashMap<String, String>,
    emitted: HashSet<String>,
    stack: Vec<String>,
    components: Vec<Component>,
}

impl<'a> Parser<'a> {
    fn visit(&mut self, iface: &'a Map<String, Value>) -> Result<(), SchemaError> {
        let id = required_str(iface, "@id", "interface")?;
        if self.stack.contains(&id) {
            return Err(SchemaError::ExtendsCycle { id });
        }
        if self.emitted.contains(&id) {
            return Ok(());
        }
        self.stack.push(id.clone());

        if let Some(extends) = iface.get("extends") {
            let parents: Vec<&'a Value> = match extends {
                Value::Array(items) => items.iter().collect(),
                other => vec![other],
            };
            for parent in parents {
                let parent = self.resolve(parent, "extends")?;
                self.visit(parent)?;
            }
        }

        let mut component = Component {
            id: id.clone(),
            name: display_name(iface),
            ..Default::default()
        };
        if let Some(contents) = iface.get("contents") {
            let contents = contents.as_array().ok_or_else(|| SchemaError::InvalidType {
                field: "contents".to_string(),
                reason: format!("expected an array in interface `{id}`"),
            })?;
            for item in contents {
                self.content(item, &mut component)?;
            }
        }

        self.stack.pop();
        self.emitted.insert(id);
        self.components.push(component);
        Ok(())
    }

    fn content(
        &mut self,
        item: &'a Value,
        component: &mut Component,
    ) -> Result<(), SchemaError> {
        let obj = item.as_object().ok_or_else(|| SchemaError::InvalidType {
            field: "contents".to_string(),
            reason: "content items must be objects".to_string(),
        })?;
        let kind = content_kind(obj)?;
        let context = format!("{kind} of `{}`", component.id);

        match kind {
            ContentKind::Telemetry => component.telemetry.push(Telemetry {
                name: required_str(obj, "name", &context)?,
                value_type: schema_type(obj),
            }),
            ContentKind::Property => component.properties.push(Property {
                name: required_str(obj, "name", &context)?,
                value_type: schema_type(obj),
                writable: obj.get("writable").and_then(Value::as_bool).unwrap_or(false),
            }),
            ContentKind::Command => component.commands.push(Command {
                name: required_str(obj, "name", &context)?,
                is_sync: obj
                    .get("commandType")
                    .and_then(Value::as_str)
                    .map(|t| t.eq_ignore_ascii_case("synchronous"))
                    .unwrap_or(false),
            }),
            ContentKind::Component => {
                let name = required_str(obj, "name", &context)?;
                let schema = obj.get("schema").ok_or_else(|| SchemaError::MissingField {
                    field: "schema".to_string(),
                    context: context.clone(),
                })?;
                let target = self.resolve(schema, "schema")?;
                let target_id = required_str(target, "@id", "component schema")?;
                self.names.insert(target_id, name);
                self.visit(target)?;
            }
            ContentKind::Other => {}
        }
        Ok(())
    }

    /// Resolves an interface reference given either by id or inline.
    fn resolve(
        &self,
        reference: &'a Value,
        field: &str,
    ) -> Result<&'a Map<String, Value>, SchemaError> {
        match reference {
            Value::String(id) => self
                .registry
                .get(id)
                .copied()
                .ok_or_else(|| SchemaError::UnknownInterface { id: id.clone() }),
            Value::Object(obj) => Ok(obj),
            _ => Err(SchemaError::InvalidType {
                field: field.to_string(),
                reason: "expected an interface id or an inline interface".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentKind {
    Telemetry,
    Property,
    Command,
    Component,
    Other,
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContentKind::Telemetry => "telemetry",
            ContentKind::Property => "property",
            ContentKind::Command => "command",
            ContentKind::Component => "component",
            ContentKind::Other => "content",
        };
        f.write_str(s)
    }
}

fn content_kind(obj: &Map<String, Value>) -> Result<ContentKind, SchemaError> {
    let types: Vec<&str> = match obj.get("@type") {
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        Some(_) => {
            return Err(SchemaError::InvalidType {
                field: "@type".to_string(),
                reason: "expected a string or an array of strings".to_string(),
            })
        }
        None => {
            return Err(SchemaError::MissingField {
                field: "@type".to_string(),
                context: "content item".to_string(),
            })
        }
    };
    // semantic types such as ["Telemetry", "Temperature"] are allowed
    for t in types {
        let kind = match t.to_ascii_lowercase().as_str() {
            "telemetry" => ContentKind::Telemetry,
            "property" => ContentKind::Property,
            "command" => ContentKind::Command,
            "component" => ContentKind::Component,
            _ => continue,
        };
        return Ok(kind);
    }
    Ok(ContentKind::Other)
}

fn schema_type(obj: &Map<String, Value>) -> ValueType {
    obj.get("schema")
        .and_then(Value::as_str)
        .map(ValueType::from_schema)
        .unwrap_or(ValueType::Unsupported)
}

fn required_str(obj: &Map<String, Value>, field: &str, context: &str) -> Result<String, SchemaError> {
    match obj.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) | None => Err(SchemaError::MissingField {
            field: field.to_string(),
            context: context.to_string(),
        }),
        Some(_) => Err(SchemaError::InvalidType {
            field: field.to_string(),
            reason: format!("expected a string in {context}"),
        }),
    }
}

fn display_name(obj: &Map<String, Value>) -> Option<String> {
    match obj.get("displayName")? {
        Value::String(s) => Some(s.clone()),
        Value::Object(localized) => localized
            .get("en")
            .or_else(|| localized.values().next())
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn thermostat() -> Value {
        json!([
            {
                "@id": "dtmi:com:example:Thermostat;1",
                "@type": "Interface",
                "displayName": {"en": "Thermostat"},
                "extends": ["dtmi:com:example:Base;1"],
                "contents": [
                    {"@type": ["Telemetry", "Temperature"], "name": "temperature", "schema": "double"},
                    {"@type": "Telemetry", "name": "location", "schema": "geopoint"},
                    {"@type": "Property", "name": "targetTemperature", "schema": "double", "writable": true},
                    {"@type": "Property", "name": "serialNumber", "schema": "string"},
                    {"@type": "Command", "name": "reboot", "commandType": "synchronous"},
                    {"@type": "Command", "name": "getMaxMinReport"},
                    {"@type": "Component", "name": "deviceInfo", "schema": "dtmi:com:example:Info;1"}
                ]
            },
            {
                "@id": "dtmi:com:example:Base;1",
                "@type": "Interface",
                "contents": [{"@type": "Telemetry", "name": "uptime", "schema": "long"}]
            },
            {
                "@id": "dtmi:com:example:Info;1",
                "@type": "Interface",
                "contents": [
                    {"@type": "Property", "name": "manufacturer", "schema": "string"},
                    {"@type": "Telemetry", "name": "blob", "schema": {"@type": "Object"}}
                ]
            }
        ])
    }

    #[test]
    fn test_parse_thermostat() {
        let schema = CapabilitySchema::parse(&thermostat()).unwrap();
        assert_eq!(schema.id.as_deref(), Some("dtmi:com:example:Thermostat;1"));
        assert_eq!(schema.components.len(), 3);

        let names: Vec<_> = schema.telemetry().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"temperature"));
        assert!(names.contains(&"uptime"));
        assert!(names.contains(&"blob"));

        let blob = schema.telemetry().find(|t| t.name == "blob").unwrap();
        assert_eq!(blob.value_type, ValueType::Unsupported);
        let location = schema.telemetry().find(|t| t.name == "location").unwrap();
        assert_eq!(location.value_type, ValueType::Geopoint);

        let writable: Vec<_> = schema.properties().filter(|p| p.writable).collect();
        assert_eq!(writable.len(), 1);

        let reboot = schema.commands().find(|c| c.name == "reboot").unwrap();
        assert!(reboot.is_sync);
        assert!(schema.has_async_commands());

        let info = schema
            .components
            .iter()
            .find(|c| c.id == "dtmi:com:example:Info;1")
            .unwrap();
        assert_eq!(info.name.as_deref(), Some("deviceInfo"));
    }

    #[test]
    fn test_empty_document() {
        assert_eq!(CapabilitySchema::parse(&json!([])), Err(SchemaError::Empty));
        assert_eq!(CapabilitySchema::parse(&Value::Null), Err(SchemaError::Empty));
    }

    #[test]
    fn test_unknown_component_reference() {
        let doc = json!([{
            "@id": "a",
            "contents": [{"@type": "Component", "name": "x", "schema": "missing"}]
        }]);
        assert_eq!(
            CapabilitySchema::parse(&doc),
            Err(SchemaError::UnknownInterface { id: "missing".into() })
        );
    }

    #[test]
    fn test_extends_cycle_rejected() {
        let doc = json!([
            {"@id": "a", "extends": "b"},
            {"@id": "b", "extends": ["a"]}
        ]);
        assert!(matches!(
            CapabilitySchema::parse(&doc),
            Err(SchemaError::ExtendsCycle { .. })
        ));
    }

    #[test]
    fn test_missing_name() {
        let doc = json!({"@id": "a", "contents": [{"@type": "Telemetry", "schema": "double"}]});
        assert!(matches!(
            CapabilitySchema::parse(&doc),
            Err(SchemaError::MissingField { ref field, .. }) if field == "name"
        ));
    }
}
