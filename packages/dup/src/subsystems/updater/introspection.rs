//! Introspection handling: parse the declared interface list, diff it
//! against the previous one, emit the lifecycle events, and keep the
//! device row and local caches coherent.

use std::collections::HashMap;

use dup_types::{triggers::IntrospectionTriggerEvent, Timestamp};

use crate::apis::vmq::VmqPlugin;
use crate::payload::parse_introspection;
use crate::queries::Queries;
use crate::subsystems::events::EventsPublisher;
use crate::subsystems::tracker::MessageId;

use super::error::{MessageViolation, UpdaterError};
use super::DataUpdater;

/// Diff of two sorted `{name, major}` lists.
fn diff_sorted(
    previous: &[(String, i32)],
    current: &[(String, i32)],
) -> (Vec<(String, i32)>, Vec<(String, i32)>) {
    let mut added = Vec::new();
    let mut removed = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < previous.len() && j < current.len() {
        match previous[i].cmp(&current[j]) {
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => {
                removed.push(previous[i].clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                added.push(current[j].clone());
                j += 1;
            }
        }
    }
    removed.extend_from_slice(&previous[i..]);
    added.extend_from_slice(&current[j..]);

    (added, removed)
}

impl<Q, P, V> DataUpdater<Q, P, V>
where
    Q: Queries,
    P: EventsPublisher,
    V: VmqPlugin,
{
    pub(super) async fn handle_introspection(
        &mut self,
        payload: &[u8],
        message_id: MessageId,
        timestamp: Timestamp,
    ) -> Result<(), UpdaterError> {
        let entries = match parse_introspection(payload) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!("invalid introspection: {}", err);
                return self
                    .handle_violation(
                        MessageViolation::InvalidIntrospection,
                        message_id,
                        timestamp,
                        HashMap::new(),
                        true,
                    )
                    .await;
            }
        };

        // payload is known valid utf-8 once parsed
        let introspection_string = String::from_utf8_lossy(payload).into_owned();
        let targets = self
            .triggers
            .introspection_targets(IntrospectionTriggerEvent::IncomingIntrospection, None);
        if !targets.is_empty() {
            self.triggers_handler
                .incoming_introspection(
                    &targets,
                    &self.realm,
                    self.device_id,
                    &introspection_string,
                    timestamp.as_millis(),
                )
                .await?;
        }

        let new_introspection: HashMap<String, i32> = entries
            .iter()
            .map(|e| (e.name.clone(), e.major))
            .collect();
        let new_minors: HashMap<String, i32> = entries
            .iter()
            .map(|e| (e.name.clone(), e.minor))
            .collect();

        let mut previous_pairs: Vec<(String, i32)> = self
            .introspection
            .iter()
            .map(|(name, major)| (name.clone(), *major))
            .collect();
        previous_pairs.sort();
        let mut current_pairs: Vec<(String, i32)> = new_introspection
            .iter()
            .map(|(name, major)| (name.clone(), *major))
            .collect();
        current_pairs.sort();

        let (added, removed) = diff_sorted(&previous_pairs, &current_pairs);

        for (name, major) in &added {
            let minor = new_minors.get(name).copied().unwrap_or(0);
            tracing::info!("device added interface {} v{}.{}", name, major, minor);

            let targets = self
                .triggers
                .introspection_targets(IntrospectionTriggerEvent::InterfaceAdded, Some(name));
            if !targets.is_empty() {
                self.triggers_handler
                    .interface_added(
                        &targets,
                        &self.realm,
                        self.device_id,
                        name,
                        *major,
                        minor,
                        timestamp.as_millis(),
                    )
                    .await?;
            }

            if *major == 0 {
                self.queries
                    .register_device_with_interface(&self.realm, self.device_id, name, 0)
                    .await?;
            }
        }

        for (name, major) in &removed {
            tracing::info!("device removed interface {} v{}", name, major);

            let targets = self
                .triggers
                .introspection_targets(IntrospectionTriggerEvent::InterfaceRemoved, Some(name));
            if !targets.is_empty() {
                self.triggers_handler
                    .interface_removed(
                        &targets,
                        &self.realm,
                        self.device_id,
                        name,
                        *major,
                        timestamp.as_millis(),
                    )
                    .await?;
            }

            if *major == 0 {
                self.queries
                    .unregister_device_with_interface(&self.realm, self.device_id, name, 0)
                    .await?;
            }
        }

        // same major on both sides but a different minor
        for (name, new_minor) in &new_minors {
            let same_major = self.introspection.get(name) == new_introspection.get(name);
            let old_minor = self.introspection_minor.get(name).copied();
            if same_major && old_minor.is_some() && old_minor != Some(*new_minor) {
                let major = new_introspection.get(name).copied().unwrap_or(0);
                let targets = self.triggers.introspection_targets(
                    IntrospectionTriggerEvent::InterfaceMinorUpdated,
                    Some(name),
                );
                if !targets.is_empty() {
                    self.triggers_handler
                        .interface_minor_updated(
                            &targets,
                            &self.realm,
                            self.device_id,
                            name,
                            major,
                            old_minor.unwrap_or(0),
                            *new_minor,
                            timestamp.as_millis(),
                        )
                        .await?;
                }
            }
        }

        let removed_with_minors: HashMap<(String, i32), i32> = removed
            .iter()
            .map(|(name, major)| {
                let minor = self.introspection_minor.get(name).copied().unwrap_or(0);
                ((name.clone(), *major), minor)
            })
            .collect();
        let readded_names: Vec<String> = added.iter().map(|(name, _)| name.clone()).collect();

        self.queries
            .update_device_introspection(
                &self.realm,
                self.device_id,
                &new_introspection,
                &new_minors,
                &removed_with_minors,
                &readded_names,
            )
            .await?;

        let removed_names: Vec<String> = removed.iter().map(|(name, _)| name.clone()).collect();
        self.forget_interfaces(&removed_names);
        self.paths_cache.clear();

        self.introspection = new_introspection;
        self.introspection_minor = new_minors;

        self.tracker.ack(message_id).await?;
        self.metrics.total_processed_messages.add(1, &[]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::diff_sorted;

    fn pairs(input: &[(&str, i32)]) -> Vec<(String, i32)> {
        input.iter().map(|(n, m)| (n.to_string(), *m)).collect()
    }

    #[test]
    fn diff_finds_insertions_and_deletions() {
        let previous = pairs(&[("a", 1), ("b", 2)]);
        let current = pairs(&[("a", 1), ("c", 1)]);
        let (added, removed) = diff_sorted(&previous, &current);
        assert_eq!(added, pairs(&[("c", 1)]));
        assert_eq!(removed, pairs(&[("b", 2)]));
    }

    #[test]
    fn major_bump_is_a_remove_plus_add() {
        let previous = pairs(&[("a", 1)]);
        let current = pairs(&[("a", 2)]);
        let (added, removed) = diff_sorted(&previous, &current);
        assert_eq!(added, pairs(&[("a", 2)]));
        assert_eq!(removed, pairs(&[("a", 1)]));
    }

    #[test]
    fn identical_lists_diff_empty() {
        let list = pairs(&[("a", 1), ("b", 1)]);
        let (added, removed) = diff_sorted(&list, &list);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }
}
