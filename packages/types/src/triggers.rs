use bson::Bson;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{path_segments, DeviceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataTriggerEvent {
    IncomingData,
    ValueChange,
    ValueChangeApplied,
    PathCreated,
    PathRemoved,
    ValueStored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceTriggerEvent {
    Connected,
    Disconnected,
    EmptyCacheReceived,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntrospectionTriggerEvent {
    IncomingIntrospection,
    InterfaceAdded,
    InterfaceMinorUpdated,
    InterfaceRemoved,
}

/// Interface selector inside a compiled trigger key: a concrete
/// `interface_id` or the any-interface sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceMatch {
    Any,
    Id(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueMatchOperator {
    Any,
    EqualTo,
    NotEqualTo,
    GreaterThan,
    GreaterOrEqualTo,
    LessThan,
    LessOrEqualTo,
}

impl ValueMatchOperator {
    /// Evaluates `value <op> known`. Ordering operators only apply to
    /// numeric values; a type mismatch never matches.
    pub fn matches(&self, value: Option<&Bson>, known: Option<&Bson>) -> bool {
        let (value, known) = match (self, value, known) {
            (ValueMatchOperator::Any, _, _) => return true,
            (_, Some(value), Some(known)) => (value, known),
            _ => return false,
        };

        match self {
            ValueMatchOperator::Any => true,
            ValueMatchOperator::EqualTo => value == known,
            ValueMatchOperator::NotEqualTo => value != known,
            ValueMatchOperator::GreaterThan => cmp_numeric(value, known, |o| o > 0.0),
            ValueMatchOperator::GreaterOrEqualTo => cmp_numeric(value, known, |o| o >= 0.0),
            ValueMatchOperator::LessThan => cmp_numeric(value, known, |o| o < 0.0),
            ValueMatchOperator::LessOrEqualTo => cmp_numeric(value, known, |o| o <= 0.0),
        }
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Double(v) => Some(*v),
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        _ => None,
    }
}

fn cmp_numeric(value: &Bson, known: &Bson, pred: impl Fn(f64) -> bool) -> bool {
    match (as_f64(value), as_f64(known)) {
        (Some(a), Some(b)) => pred(a - b),
        _ => false,
    }
}

/// Where a fired trigger is delivered. Only AMQP targets exist today.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerTarget {
    pub simple_trigger_id: Uuid,
    pub parent_trigger_id: Uuid,
    pub routing_key: String,
    pub static_headers: Vec<(String, String)>,
}

/// A compiled data trigger as held in a device actor's dispatch table.
#[derive(Debug, Clone)]
pub struct DataTrigger {
    pub event: DataTriggerEvent,
    pub interface_match: InterfaceMatch,
    /// `None` is the any-endpoint sentinel; tokens with an empty segment
    /// (`"/a//c"` compiles to `["a", "", "c"]`) match any single segment.
    pub path_match_tokens: Option<Vec<String>>,
    pub value_match_operator: ValueMatchOperator,
    pub known_value: Option<Bson>,
    pub targets: Vec<TriggerTarget>,
}

impl DataTrigger {
    /// Two triggers are congruent when they match the same events on the
    /// same paths and values; congruent triggers are merged to one table
    /// entry with the union of their targets.
    pub fn are_congruent(&self, other: &DataTrigger) -> bool {
        self.event == other.event
            && self.interface_match == other.interface_match
            && self.path_match_tokens == other.path_match_tokens
            && self.value_match_operator == other.value_match_operator
            && self.known_value == other.known_value
    }

    pub fn path_matches(&self, path: &str) -> bool {
        let tokens = match &self.path_match_tokens {
            None => return true,
            Some(tokens) => tokens,
        };
        let segments = path_segments(path);
        tokens.len() == segments.len()
            && tokens
                .iter()
                .zip(segments)
                .all(|(token, segment)| token.is_empty() || token == segment)
    }

    pub fn matches(&self, path: &str, value: Option<&Bson>) -> bool {
        self.path_matches(path)
            && self
                .value_match_operator
                .matches(value, self.known_value.as_ref())
    }
}

/// Compiles a match path to tokens: `%{param}` and `*` segments become the
/// single-segment wildcard (the empty token).
pub fn compile_match_path(match_path: &str) -> Vec<String> {
    path_segments(match_path)
        .into_iter()
        .map(|segment| {
            if segment == "*" || (segment.starts_with("%{") && segment.ends_with('}')) {
                String::new()
            } else {
                segment.to_string()
            }
        })
        .collect()
}

/// The stored (and RPC-installed) form of a simple trigger, before it is
/// compiled against the loaded interfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimpleTriggerConfig {
    Data {
        on: DataTriggerEvent,
        /// `*` selects any interface.
        interface_name: String,
        interface_major: i32,
        /// `/*` selects any endpoint.
        match_path: String,
        value_match_operator: ValueMatchOperator,
        known_value: Option<Bson>,
    },
    Device {
        on: DeviceTriggerEvent,
    },
    Introspection {
        on: IntrospectionTriggerEvent,
        interface_name: Option<String>,
    },
}

/// What a stored simple trigger is attached to; the queries layer looks
/// triggers up by object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerObject {
    Device(DeviceId),
    AnyDevice,
    Interface(Uuid),
    AnyInterface,
}

/// One row of the `simple_triggers` table.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleTriggerRow {
    pub config: SimpleTriggerConfig,
    pub target: TriggerTarget,
}
