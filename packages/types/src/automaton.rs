use std::collections::BTreeMap;
use uuid::Uuid;

/// Outcome of resolving a published path against an interface's endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedPath {
    /// The path lands exactly on one endpoint.
    Exact(Uuid),
    /// The path stops above the leaves; these are all the endpoints below
    /// it (the object-aggregation case).
    Guessed(Vec<Uuid>),
    NotFound,
}

#[derive(Debug, Clone, Default)]
struct Node {
    endpoint: Option<Uuid>,
    literal: BTreeMap<String, Node>,
    /// `%{param}` template segment, matching any single path segment.
    param: Option<Box<Node>>,
}

/// Trie over the endpoint templates of one interface. Template segments of
/// the form `%{name}` match any single concrete segment.
#[derive(Debug, Clone, Default)]
pub struct EndpointsAutomaton {
    root: Node,
}

fn is_param(segment: &str) -> bool {
    segment.starts_with("%{") && segment.ends_with('}')
}

/// Splits `/a/b/c` into `["a", "b", "c"]`. The empty path has no segments.
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

impl EndpointsAutomaton {
    pub fn from_endpoints<'a>(endpoints: impl IntoIterator<Item = (&'a str, Uuid)>) -> Self {
        let mut root = Node::default();
        for (endpoint, id) in endpoints {
            let mut node = &mut root;
            for segment in path_segments(endpoint) {
                node = if is_param(segment) {
                    node.param.get_or_insert_with(Default::default)
                } else {
                    node.literal.entry(segment.to_string()).or_default()
                };
            }
            node.endpoint = Some(id);
        }
        EndpointsAutomaton { root }
    }

    pub fn resolve_path(&self, path: &str) -> ResolvedPath {
        // A path may descend both a literal and a param edge, so we track
        // the whole reachable set per consumed segment.
        let mut nodes = vec![&self.root];
        for segment in path_segments(path) {
            let mut next = Vec::new();
            for node in nodes {
                if let Some(child) = node.literal.get(segment) {
                    next.push(child);
                }
                if let Some(child) = node.param.as_deref() {
                    next.push(child);
                }
            }
            if next.is_empty() {
                return ResolvedPath::NotFound;
            }
            nodes = next;
        }

        if let Some(id) = nodes.iter().find_map(|n| n.endpoint) {
            return ResolvedPath::Exact(id);
        }

        let mut guessed = Vec::new();
        for node in nodes {
            collect_leaves(node, &mut guessed);
        }
        if guessed.is_empty() {
            ResolvedPath::NotFound
        } else {
            ResolvedPath::Guessed(guessed)
        }
    }
}

fn collect_leaves(node: &Node, out: &mut Vec<Uuid>) {
    if let Some(id) = node.endpoint {
        out.push(id);
    }
    for child in node.literal.values() {
        collect_leaves(child, out);
    }
    if let Some(child) = node.param.as_deref() {
        collect_leaves(child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn automaton() -> EndpointsAutomaton {
        EndpointsAutomaton::from_endpoints([
            ("/time/from", Uuid::from_u128(1)),
            ("/time/to", Uuid::from_u128(2)),
            ("/%{sensor}/value", Uuid::from_u128(3)),
            ("/%{sensor}/otherValue", Uuid::from_u128(4)),
        ])
    }

    #[test]
    fn exact_literal() {
        assert_eq!(
            automaton().resolve_path("/time/from"),
            ResolvedPath::Exact(Uuid::from_u128(1))
        );
    }

    #[test]
    fn exact_parametric() {
        assert_eq!(
            automaton().resolve_path("/foobar/value"),
            ResolvedPath::Exact(Uuid::from_u128(3))
        );
    }

    #[test]
    fn literal_wins_over_param_guess() {
        // "/time" reaches both the literal subtree and the param subtree;
        // an exact hit would win, but here we only guess.
        let guessed = match automaton().resolve_path("/time") {
            ResolvedPath::Guessed(ids) => ids,
            other => panic!("expected guess, got {:?}", other),
        };
        assert!(guessed.contains(&Uuid::from_u128(1)));
        assert!(guessed.contains(&Uuid::from_u128(2)));
    }

    #[test]
    fn object_guess() {
        let automaton = EndpointsAutomaton::from_endpoints([
            ("/a/x", Uuid::from_u128(10)),
            ("/a/y", Uuid::from_u128(11)),
        ]);
        assert_eq!(
            automaton.resolve_path("/a"),
            ResolvedPath::Guessed(vec![Uuid::from_u128(10), Uuid::from_u128(11)])
        );
    }

    #[test]
    fn not_found() {
        assert_eq!(automaton().resolve_path("/nope/nope/nope"), ResolvedPath::NotFound);
        assert_eq!(
            automaton().resolve_path("/time/from/extra"),
            ResolvedPath::NotFound
        );
    }
}
