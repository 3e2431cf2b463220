//! The compiled trigger tables of one device actor: keyed dispatch tables
//! for data, device, and introspection triggers, plus the volatile entries
//! installed at runtime.

use std::collections::HashMap;

use bson::Bson;
use uuid::Uuid;

use dup_types::{
    triggers::{
        compile_match_path, DataTrigger, DataTriggerEvent, DeviceTriggerEvent, InterfaceMatch,
        IntrospectionTriggerEvent, SimpleTriggerConfig, TriggerTarget,
    },
    Aggregation, Mapping,
};

use super::error::VolatileTriggerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointMatch {
    Any,
    Id(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataTriggerKey {
    pub event: DataTriggerEvent,
    pub interface: InterfaceMatch,
    pub endpoint: EndpointMatch,
}

/// What the installer needs to know about a named interface to compile a
/// data trigger against it.
pub struct InterfaceTriggerContext<'a> {
    pub interface_id: Uuid,
    pub aggregation: Aggregation,
    pub mappings: Vec<&'a Mapping>,
}

#[derive(Debug, Clone)]
pub struct VolatileTrigger {
    pub id: Uuid,
    pub config: SimpleTriggerConfig,
    pub target: TriggerTarget,
}

#[derive(Default)]
pub struct TriggerTables {
    data: HashMap<DataTriggerKey, Vec<DataTrigger>>,
    device: HashMap<DeviceTriggerEvent, Vec<TriggerTarget>>,
    introspection: HashMap<(IntrospectionTriggerEvent, Option<String>), Vec<TriggerTarget>>,
    pub volatile: Vec<VolatileTrigger>,
}

/// Finds the endpoint a compiled match path lands on. A wildcard token
/// matches any endpoint segment, and a template segment accepts any token.
pub fn resolve_match_endpoint<'a>(
    mappings: impl IntoIterator<Item = &'a Mapping>,
    tokens: &[String],
) -> Option<Uuid> {
    mappings.into_iter().find_map(|mapping| {
        let segments: Vec<&str> = dup_types::path_segments(&mapping.endpoint);
        if segments.len() != tokens.len() {
            return None;
        }
        let compatible = tokens.iter().zip(segments).all(|(token, segment)| {
            token.is_empty()
                || (segment.starts_with("%{") && segment.ends_with('}'))
                || token == segment
        });
        compatible.then_some(mapping.endpoint_id)
    })
}

fn push_target(targets: &mut Vec<TriggerTarget>, target: TriggerTarget) {
    if !targets
        .iter()
        .any(|t| t.simple_trigger_id == target.simple_trigger_id)
    {
        targets.push(target);
    }
}

impl TriggerTables {
    /// Installs one trigger. `context` resolves the named interface for
    /// data triggers; `None` when the interface is unknown to this device.
    pub fn install(
        &mut self,
        config: &SimpleTriggerConfig,
        target: TriggerTarget,
        context: Option<InterfaceTriggerContext<'_>>,
    ) -> Result<(), VolatileTriggerError> {
        match config {
            SimpleTriggerConfig::Device { on } => {
                push_target(self.device.entry(*on).or_default(), target);
                Ok(())
            }
            SimpleTriggerConfig::Introspection { on, interface_name } => {
                push_target(
                    self.introspection
                        .entry((*on, interface_name.clone()))
                        .or_default(),
                    target,
                );
                Ok(())
            }
            SimpleTriggerConfig::Data {
                on,
                interface_name,
                match_path,
                value_match_operator,
                known_value,
                ..
            } => {
                let (interface_match, endpoint_match, tokens) = if interface_name == "*" {
                    (InterfaceMatch::Any, EndpointMatch::Any, None)
                } else {
                    let context = context.ok_or(VolatileTriggerError::InterfaceNotFound)?;
                    if match_path == "/*" {
                        (
                            InterfaceMatch::Id(context.interface_id),
                            EndpointMatch::Any,
                            None,
                        )
                    } else {
                        if context.aggregation != Aggregation::Individual {
                            return Err(VolatileTriggerError::ObjectAggregation);
                        }
                        let tokens = compile_match_path(match_path);
                        let endpoint_id = resolve_match_endpoint(context.mappings, &tokens)
                            .ok_or(VolatileTriggerError::InvalidMatchPath)?;
                        (
                            InterfaceMatch::Id(context.interface_id),
                            EndpointMatch::Id(endpoint_id),
                            Some(tokens),
                        )
                    }
                };

                let key = DataTriggerKey {
                    event: *on,
                    interface: interface_match,
                    endpoint: endpoint_match,
                };
                let trigger = DataTrigger {
                    event: *on,
                    interface_match,
                    path_match_tokens: tokens,
                    value_match_operator: *value_match_operator,
                    known_value: known_value.clone(),
                    targets: vec![target],
                };
                self.merge_data_trigger(key, trigger);
                Ok(())
            }
        }
    }

    /// Congruent triggers collapse to one entry with the union of targets.
    fn merge_data_trigger(&mut self, key: DataTriggerKey, trigger: DataTrigger) {
        let entry = self.data.entry(key).or_default();
        match entry.iter_mut().find(|t| t.are_congruent(&trigger)) {
            Some(existing) => {
                for target in trigger.targets {
                    push_target(&mut existing.targets, target);
                }
            }
            None => entry.push(trigger),
        }
    }

    /// Removes a trigger everywhere it was compiled, by target identity.
    pub fn remove_target(&mut self, simple_trigger_id: Uuid) {
        self.device
            .retain(|_, targets| {
                targets.retain(|t| t.simple_trigger_id != simple_trigger_id);
                !targets.is_empty()
            });
        self.introspection.retain(|_, targets| {
            targets.retain(|t| t.simple_trigger_id != simple_trigger_id);
            !targets.is_empty()
        });
        self.data.retain(|_, triggers| {
            triggers.retain_mut(|trigger| {
                trigger
                    .targets
                    .retain(|t| t.simple_trigger_id != simple_trigger_id);
                !trigger.targets.is_empty()
            });
            !triggers.is_empty()
        });
    }

    /// Drops everything keyed by a forgotten interface.
    pub fn forget_interface(&mut self, interface_id: Uuid) {
        self.data
            .retain(|key, _| key.interface != InterfaceMatch::Id(interface_id));
    }

    /// Drops the tables that are refreshed from storage on the device
    /// triggers lifespan: lifecycle, introspection, and any-interface data
    /// triggers. Interface-keyed data triggers follow the interface cache.
    pub fn clear_refreshable(&mut self) {
        self.device.clear();
        self.introspection.clear();
        self.data
            .retain(|key, _| key.interface != InterfaceMatch::Any);
    }

    /// All targets of data triggers matching this event, in the fixed
    /// precedence order: any-interface, any-endpoint, endpoint-specific.
    pub fn data_targets(
        &self,
        event: DataTriggerEvent,
        interface_id: Uuid,
        endpoint_id: Option<Uuid>,
        path: &str,
        value: Option<&Bson>,
    ) -> Vec<TriggerTarget> {
        let mut targets = Vec::new();
        for key in self.lookup_keys(event, interface_id, endpoint_id) {
            if let Some(triggers) = self.data.get(&key) {
                for trigger in triggers {
                    if trigger.matches(path, value) {
                        for target in &trigger.targets {
                            push_target(&mut targets, target.clone());
                        }
                    }
                }
            }
        }
        targets
    }

    /// Whether any trigger would fire for this event and path, regardless
    /// of the value operator. Used to decide whether the previous value is
    /// worth a read.
    pub fn has_data_triggers(
        &self,
        event: DataTriggerEvent,
        interface_id: Uuid,
        endpoint_id: Option<Uuid>,
        path: &str,
    ) -> bool {
        self.lookup_keys(event, interface_id, endpoint_id)
            .into_iter()
            .filter_map(|key| self.data.get(&key))
            .any(|triggers| triggers.iter().any(|t| t.path_matches(path)))
    }

    fn lookup_keys(
        &self,
        event: DataTriggerEvent,
        interface_id: Uuid,
        endpoint_id: Option<Uuid>,
    ) -> Vec<DataTriggerKey> {
        let mut keys = vec![
            DataTriggerKey {
                event,
                interface: InterfaceMatch::Any,
                endpoint: EndpointMatch::Any,
            },
            DataTriggerKey {
                event,
                interface: InterfaceMatch::Id(interface_id),
                endpoint: EndpointMatch::Any,
            },
        ];
        if let Some(endpoint_id) = endpoint_id {
            keys.push(DataTriggerKey {
                event,
                interface: InterfaceMatch::Id(interface_id),
                endpoint: EndpointMatch::Id(endpoint_id),
            });
        }
        keys
    }

    pub fn device_targets(&self, event: DeviceTriggerEvent) -> Vec<TriggerTarget> {
        self.device.get(&event).cloned().unwrap_or_default()
    }

    pub fn introspection_targets(
        &self,
        event: IntrospectionTriggerEvent,
        interface_name: Option<&str>,
    ) -> Vec<TriggerTarget> {
        let mut targets = self
            .introspection
            .get(&(event, None))
            .cloned()
            .unwrap_or_default();
        if let Some(name) = interface_name {
            if let Some(named) = self.introspection.get(&(event, Some(name.to_string()))) {
                for target in named {
                    push_target(&mut targets, target.clone());
                }
            }
        }
        targets
    }
}
