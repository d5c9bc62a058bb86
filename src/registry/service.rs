//! Service descriptor types
//!
//! A [`Service`] is the only structured record the runtime publishes: who the
//! service is, where its instances live, and which endpoints it exposes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Shape hint for a request or response type
///
/// Derived once from the Rust type name at registration time; it describes,
/// it never validates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Short type name (e.g. `HelloRequest`)
    pub name: String,
    /// Fully qualified type name
    #[serde(rename = "type")]
    pub type_name: String,
    /// Nested field hints, if the producer supplied any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Schema>,
}

impl Schema {
    /// Create a schema hint
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    /// Schema hint for a Rust type
    pub fn of<T: ?Sized>() -> Self {
        let type_name = std::any::type_name::<T>();
        Self::new(short_type_name(type_name), type_name)
    }

    /// Add a nested field hint
    pub fn field(mut self, field: Schema) -> Self {
        self.fields.push(field);
        self
    }
}

/// Strip module paths, keeping generic arguments readable
fn short_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    let short = base.rsplit("::").next().unwrap_or(base);
    match full.find('<') {
        Some(idx) => format!("{}{}", short, &full[idx..]),
        None => short.to_string(),
    }
}

/// Discoverable description of one invokable method or topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// `Handler.Method` for handlers, the topic for subscribers
    pub name: String,
    /// Request shape hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Schema>,
    /// Response shape hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Schema>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Endpoint {
    /// Create an endpoint with no hints
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            request: None,
            response: None,
            metadata: HashMap::new(),
        }
    }

    /// Set the request hint
    pub fn request(mut self, schema: Schema) -> Self {
        self.request = Some(schema);
        self
    }

    /// Set the response hint
    pub fn response(mut self, schema: Schema) -> Self {
        self.response = Some(schema);
        self
    }

    /// Add a metadata entry
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One running instance of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique instance id
    pub id: String,
    /// Address callers dial
    pub address: String,
    /// Instance metadata (plugin names, user metadata)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Service descriptor published to a registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Service name
    pub name: String,
    /// Service version
    pub version: String,
    /// Service-level metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Every endpoint exposed by the service
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// Instances of the service
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Service {
    /// Create a descriptor with no endpoints or nodes
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            metadata: HashMap::new(),
            endpoints: Vec::new(),
            nodes: Vec::new(),
        }
    }

    /// Look up an endpoint by name
    pub fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    /// Look up a node by id
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct HelloRequest;

    #[test]
    fn test_schema_of() {
        let schema = Schema::of::<HelloRequest>();

        assert_eq!(schema.name, "HelloRequest");
        assert!(schema.type_name.ends_with("::HelloRequest"));
    }

    #[test]
    fn test_short_type_name_generics() {
        assert_eq!(short_type_name("alloc::vec::Vec<u8>"), "Vec<u8>");
        assert_eq!(short_type_name("u32"), "u32");
        assert_eq!(short_type_name("a::b::C"), "C");
    }

    #[test]
    fn test_service_json_shape() {
        let mut service = Service::new("greeter", "1.0.0");
        service.endpoints.push(
            Endpoint::new("Greeter.Hello")
                .request(Schema::new("HelloRequest", "demo::HelloRequest"))
                .meta("kind", "rpc"),
        );
        service.nodes.push(Node {
            id: "greeter-1".into(),
            address: "127.0.0.1:9000".into(),
            metadata: HashMap::new(),
        });

        let json = serde_json::to_value(&service).unwrap();
        assert_eq!(json["name"], "greeter");
        assert_eq!(json["endpoints"][0]["request"]["type"], "demo::HelloRequest");
        assert!(json["endpoints"][0].get("response").is_none());

        let back: Service = serde_json::from_value(json).unwrap();
        assert_eq!(back, service);
        assert!(back.endpoint("Greeter.Hello").is_some());
        assert!(back.node("greeter-1").is_some());
    }
}
