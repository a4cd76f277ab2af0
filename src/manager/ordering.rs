//! Dependency-respecting startup order.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Result of resolving the dependency graph.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct StartupPlan {
    /// Every agent exactly once. Agents in `cyclic` come last, in registration order.
    pub order: Vec<String>,
    /// Agents that are part of a cycle or depend on one.
    pub cyclic: Vec<String>,
    /// `(agent, dependency)` pairs naming an agent that is not registered.
    pub missing: Vec<(String, String)>,
}

impl StartupPlan {
    pub fn has_cycle(&self) -> bool {
        !self.cyclic.is_empty()
    }

    pub fn is_cyclic(&self, agent_id: &str) -> bool {
        self.cyclic.iter().any(|id| id == agent_id)
    }

    /// Reverse of the startup order.
    pub fn shutdown_order(&self) -> Vec<String> {
        self.order.iter().rev().cloned().collect()
    }
}

struct Node<'a> {
    id: &'a str,
    /// Indices of registered agents that depend on this one.
    dependents: Vec<usize>,
    pending: usize,
}

/// Kahn's algorithm over `(agent, dependencies)` pairs given in registration order.
///
/// Ties are broken first-ready-first-out, seeded in registration order, so the
/// result is deterministic. Dependencies on unknown ids do not block ordering;
/// they are reported in `missing` and fail the dependency check at start.
pub fn resolve<'a, I>(agents: I) -> StartupPlan
where
    I: IntoIterator<Item = (&'a str, &'a [String])>,
{
    let agents: Vec<(&str, &[String])> = agents.into_iter().collect();
    let index: HashMap<&str, usize> = agents
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (*id, i))
        .collect();

    let mut nodes: Vec<Node> = agents
        .iter()
        .map(|(id, _)| Node {
            id: *id,
            dependents: Vec::new(),
            pending: 0,
        })
        .collect();
    let mut missing = Vec::new();

    for (i, (id, dependencies)) in agents.iter().enumerate() {
        let mut seen: Vec<usize> = Vec::with_capacity(dependencies.len());
        for dependency in dependencies.iter() {
            match index.get(dependency.as_str()) {
                Some(&j) if !seen.contains(&j) => {
                    seen.push(j);
                    nodes[j].dependents.push(i);
                    nodes[i].pending += 1;
                }
                Some(_) => {}
                None => missing.push((id.to_string(), dependency.clone())),
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..nodes.len()).filter(|&i| nodes[i].pending == 0).collect();
    let mut placed = vec![false; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(i) = ready.pop_front() {
        placed[i] = true;
        order.push(nodes[i].id.to_string());
        for k in 0..nodes[i].dependents.len() {
            let dependent = nodes[i].dependents[k];
            nodes[dependent].pending -= 1;
            if nodes[dependent].pending == 0 {
                ready.push_back(dependent);
            }
        }
    }

    let cyclic: Vec<String> = nodes
        .iter()
        .zip(&placed)
        .filter(|(_, placed)| !**placed)
        .map(|(node, _)| node.id.to_string())
        .collect();
    order.extend(cyclic.iter().cloned());

    StartupPlan {
        order,
        cyclic,
        missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(agents: &[(&str, Vec<&str>)]) -> StartupPlan {
        let owned: Vec<(String, Vec<String>)> = agents
            .iter()
            .map(|(id, deps)| (id.to_string(), deps.iter().map(|d| d.to_string()).collect()))
            .collect();
        resolve(owned.iter().map(|(id, deps)| (id.as_str(), deps.as_slice())))
    }

    fn position(plan: &StartupPlan, id: &str) -> usize {
        plan.order.iter().position(|x| x == id).unwrap()
    }

    #[test]
    fn test_dependency_first() {
        let plan = plan(&[("B", vec!["A"]), ("A", vec![])]);
        assert_eq!(plan.order, vec!["A", "B"]);
        assert_eq!(plan.shutdown_order(), vec!["B", "A"]);
        assert!(!plan.has_cycle());
    }

    #[test]
    fn test_dag_respects_every_edge() {
        let agents: &[(&str, Vec<&str>)] = &[
            ("email", vec!["chat", "context"]),
            ("calendar", vec!["email"]),
            ("chat", vec!["context"]),
            ("context", vec![]),
            ("weather", vec![]),
            ("news", vec!["weather", "chat"]),
        ];
        let plan = plan(agents);

        assert_eq!(plan.order.len(), agents.len());
        for (id, deps) in agents {
            for dep in deps.iter() {
                assert!(position(&plan, dep) < position(&plan, id), "{} before {}", dep, id);
            }
        }
    }

    #[test]
    fn test_ties_follow_registration_order() {
        let plan = plan(&[("c", vec![]), ("a", vec![]), ("b", vec![])]);
        assert_eq!(plan.order, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_cycle_appended_not_dropped() {
        let plan = plan(&[("x", vec!["y"]), ("y", vec!["x"]), ("z", vec![]), ("w", vec!["x"])]);

        assert_eq!(plan.order, vec!["z", "x", "y", "w"]);
        assert_eq!(plan.cyclic, vec!["x", "y", "w"]);
        assert!(plan.is_cyclic("w"));
        assert!(!plan.is_cyclic("z"));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let plan = plan(&[("loop", vec!["loop"])]);
        assert_eq!(plan.cyclic, vec!["loop"]);
    }

    #[test]
    fn test_missing_dependency_reported() {
        let plan = plan(&[("a", vec!["ghost"]), ("b", vec!["a", "a"])]);

        assert_eq!(plan.order, vec!["a", "b"]);
        assert_eq!(plan.missing, vec![("a".to_string(), "ghost".to_string())]);
        assert!(!plan.has_cycle());
    }
}
