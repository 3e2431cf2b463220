use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::EndpointsAutomaton;

/// Namespace for the deterministic v5 ids derived from interface names and
/// endpoint strings. Must never change once data has been written.
const SCHEMA_UUID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x63, 0x9b, 0x9d, 0x52, 0x4a, 0xc4, 0x46, 0xa1, 0xb3, 0x7d, 0x2f, 0x4e, 0x8a, 0x3c, 0x11, 0xd9,
]);

/// Deterministic id of an `{interface_name, major}` pair.
pub fn interface_id(name: &str, major: i32) -> Uuid {
    endpoint_id(name, major, "")
}

/// Deterministic id of an endpoint inside an interface. Object-aggregation
/// rows use the empty endpoint string.
pub fn endpoint_id(interface_name: &str, major: i32, endpoint: &str) -> Uuid {
    let key = format!("{}:{}:{}", interface_name, major, endpoint);
    Uuid::new_v5(&SCHEMA_UUID_NAMESPACE, key.as_bytes())
}

/// Column name an object-aggregation key maps to: ASCII-lowercased, with
/// anything outside `[a-z0-9]` squashed to `_`.
pub fn endpoint_to_db_column_name(endpoint_segment: &str) -> String {
    endpoint_segment
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceType {
    Properties,
    Datastream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Individual,
    Object,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    Device,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    MultiInterfaceIndividualPropertiesDbtable,
    MultiInterfaceIndividualDatastreamDbtable,
    OneObjectDatastreamDbtable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    Unreliable,
    Guaranteed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    Discard,
    Stored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingType {
    Double,
    Integer,
    Boolean,
    LongInteger,
    String,
    BinaryBlob,
    DateTime,
    DoubleArray,
    IntegerArray,
    BooleanArray,
    LongIntegerArray,
    StringArray,
    BinaryBlobArray,
    DateTimeArray,
}

impl MappingType {
    /// Whether a decoded BSON leaf conforms to this mapping type.
    /// `DateTime` and `Binary` are the only accepted BSON struct types.
    pub fn conforms(&self, value: &bson::Bson) -> bool {
        use bson::Bson;

        match self {
            MappingType::Double => {
                matches!(value, Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_))
            }
            MappingType::Integer => matches!(value, Bson::Int32(_)),
            MappingType::Boolean => matches!(value, Bson::Boolean(_)),
            MappingType::LongInteger => matches!(value, Bson::Int64(_) | Bson::Int32(_)),
            MappingType::String => matches!(value, Bson::String(_)),
            MappingType::BinaryBlob => matches!(value, Bson::Binary(_)),
            MappingType::DateTime => matches!(value, Bson::DateTime(_)),
            MappingType::DoubleArray => Self::array_conforms(value, MappingType::Double),
            MappingType::IntegerArray => Self::array_conforms(value, MappingType::Integer),
            MappingType::BooleanArray => Self::array_conforms(value, MappingType::Boolean),
            MappingType::LongIntegerArray => Self::array_conforms(value, MappingType::LongInteger),
            MappingType::StringArray => Self::array_conforms(value, MappingType::String),
            MappingType::BinaryBlobArray => Self::array_conforms(value, MappingType::BinaryBlob),
            MappingType::DateTimeArray => Self::array_conforms(value, MappingType::DateTime),
        }
    }

    fn array_conforms(value: &bson::Bson, item: MappingType) -> bool {
        match value {
            bson::Bson::Array(items) => items.iter().all(|v| item.conforms(v)),
            _ => false,
        }
    }
}

/// A compiled endpoint of an interface.
#[derive(Debug, Clone, PartialEq)]
pub struct Mapping {
    pub endpoint_id: Uuid,
    pub interface_id: Uuid,
    pub endpoint: String,
    pub value_type: MappingType,
    pub reliability: Reliability,
    pub retention: Retention,
    pub allow_unset: bool,
    pub explicit_timestamp: bool,
}

impl Mapping {
    /// The last segment of the endpoint template, i.e. the key an
    /// object-aggregated publish uses for this mapping.
    pub fn last_segment(&self) -> &str {
        self.endpoint.rsplit('/').next().unwrap_or("")
    }
}

/// A loaded interface schema, as cached inside a device actor.
#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    pub interface_id: Uuid,
    pub name: String,
    pub major_version: i32,
    pub minor_version: i32,
    pub interface_type: InterfaceType,
    pub aggregation: Aggregation,
    pub ownership: Ownership,
    pub storage: String,
    pub storage_type: StorageType,
    pub automaton: EndpointsAutomaton,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_deterministic() {
        let a = interface_id("com.example.Sensors", 1);
        let b = interface_id("com.example.Sensors", 1);
        assert_eq!(a, b);
        assert_ne!(a, interface_id("com.example.Sensors", 2));

        let e = endpoint_id("com.example.Sensors", 1, "/rooms/%{room}/temp");
        assert_ne!(e, a);
        // object-aggregation row id is the interface id
        assert_eq!(endpoint_id("com.example.Sensors", 1, ""), a);
    }

    #[test]
    fn column_name_squashing() {
        assert_eq!(endpoint_to_db_column_name("temp"), "temp");
        assert_eq!(endpoint_to_db_column_name("myValue"), "myvalue");
        assert_eq!(endpoint_to_db_column_name("the-value.2"), "the_value_2");
    }

    #[test]
    fn scalar_conformance() {
        use bson::Bson;

        assert!(MappingType::Double.conforms(&Bson::Double(0.5)));
        assert!(MappingType::Double.conforms(&Bson::Int32(3)));
        assert!(!MappingType::Integer.conforms(&Bson::Double(0.5)));
        assert!(MappingType::LongInteger.conforms(&Bson::Int64(1 << 40)));
        assert!(MappingType::String.conforms(&Bson::String("x".into())));
        assert!(!MappingType::Boolean.conforms(&Bson::Int32(1)));
        assert!(MappingType::DateTime.conforms(&Bson::DateTime(bson::DateTime::from_millis(10))));
    }

    #[test]
    fn array_conformance() {
        use bson::Bson;

        let ok = Bson::Array(vec![Bson::Int32(1), Bson::Int32(2)]);
        let bad = Bson::Array(vec![Bson::Int32(1), Bson::String("2".into())]);
        assert!(MappingType::IntegerArray.conforms(&ok));
        assert!(!MappingType::IntegerArray.conforms(&bad));
        assert!(!MappingType::IntegerArray.conforms(&Bson::Int32(1)));
    }

    #[test]
    fn last_segment() {
        let mapping = Mapping {
            endpoint_id: endpoint_id("com.X", 1, "/a/%{b}/value"),
            interface_id: interface_id("com.X", 1),
            endpoint: "/a/%{b}/value".to_string(),
            value_type: MappingType::Double,
            reliability: Reliability::Unreliable,
            retention: Retention::Discard,
            allow_unset: false,
            explicit_timestamp: false,
        };
        assert_eq!(mapping.last_segment(), "value");
    }
}
