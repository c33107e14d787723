//! Compiled step graph: an index arena with precomputed edges.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::EngineError;
use crate::models::workflow::{StepKind, StepSpec, WorkflowDefinition};

#[derive(Debug, Clone)]
pub struct StepGraph {
    steps: Vec<StepSpec>,
    index: HashMap<String, usize>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl StepGraph {
    /// Validate the definition and build the graph.
    pub fn compile(definition: &WorkflowDefinition) -> Result<Self, EngineError> {
        if definition.id.trim().is_empty() {
            return Err(invalid("workflow id must not be empty"));
        }
        if definition.steps.is_empty() {
            return Err(invalid("workflow has no steps"));
        }
        if definition.max_parallelism == Some(0) {
            return Err(invalid("max_parallelism must be at least 1"));
        }

        let mut index = HashMap::with_capacity(definition.steps.len());
        for (i, step) in definition.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(invalid(&format!("step #{} has an empty id", i + 1)));
            }
            if index.insert(step.id.clone(), i).is_some() {
                return Err(invalid(&format!("duplicate step id '{}'", step.id)));
            }
        }

        let mut deps = vec![Vec::new(); definition.steps.len()];
        let mut dependents = vec![Vec::new(); definition.steps.len()];
        for (i, step) in definition.steps.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(invalid(&format!("step '{}' depends on itself", step.id)));
                }
                let &d = index.get(dep).ok_or_else(|| {
                    invalid(&format!("step '{}' depends on unknown step '{}'", step.id, dep))
                })?;
                if seen.insert(d) {
                    deps[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        let graph = Self {
            steps: definition.steps.clone(),
            index,
            deps,
            dependents,
        };
        graph.check_acyclic()?;
        for i in 0..graph.steps.len() {
            graph.check_step(i)?;
        }
        Ok(graph)
    }

    /// Kahn's algorithm; any node left unvisited sits on a cycle.
    fn check_acyclic(&self) -> Result<(), EngineError> {
        let mut remaining: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..self.steps.len()).filter(|&i| remaining[i] == 0).collect();
        let mut visited = 0;
        while let Some(i) = queue.pop_front() {
            visited += 1;
            for &d in &self.dependents[i] {
                remaining[d] -= 1;
                if remaining[d] == 0 {
                    queue.push_back(d);
                }
            }
        }
        if visited == self.steps.len() {
            return Ok(());
        }
        let mut cyclic: Vec<&str> = (0..self.steps.len())
            .filter(|&i| remaining[i] > 0)
            .map(|i| self.steps[i].id.as_str())
            .collect();
        cyclic.sort_unstable();
        Err(invalid(&format!("dependency cycle among steps: {}", cyclic.join(", "))))
    }

    fn check_step(&self, i: usize) -> Result<(), EngineError> {
        let step = &self.steps[i];
        match &step.kind {
            StepKind::ToolCall { tool, .. } if tool.trim().is_empty() => {
                Err(invalid(&format!("tool_call step '{}' names no tool", step.id)))
            }
            StepKind::Join if self.deps[i].is_empty() => {
                Err(invalid(&format!("join step '{}' has no upstream steps", step.id)))
            }
            StepKind::Branch { condition, when_true, when_false } => {
                let Some(&cond) = self.index.get(&condition.step) else {
                    return Err(invalid(&format!(
                        "branch '{}' tests unknown step '{}'",
                        step.id, condition.step
                    )));
                };
                if !self.deps[i].contains(&cond) {
                    return Err(invalid(&format!(
                        "branch '{}' must depend on '{}', the step it tests",
                        step.id, condition.step
                    )));
                }
                for target in when_true.iter().chain(when_false) {
                    let t = self.index.get(target).copied().filter(|t| self.deps[*t].contains(&i));
                    let Some(t) = t else {
                        return Err(invalid(&format!(
                            "branch '{}' target '{}' is not one of its dependents",
                            step.id, target
                        )));
                    };
                    if self.steps[t].is_join() {
                        return Err(invalid(&format!(
                            "branch '{}' target '{}' is a join",
                            step.id, target
                        )));
                    }
                }
                if let Some(both) = when_true.iter().find(|t| when_false.contains(t)) {
                    return Err(invalid(&format!(
                        "branch '{}' lists '{}' under both outcomes",
                        step.id, both
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, i: usize) -> &StepSpec {
        &self.steps[i]
    }

    pub fn index_of(&self, step_id: &str) -> Option<usize> {
        self.index.get(step_id).copied()
    }

    pub fn deps(&self, i: usize) -> &[usize] {
        &self.deps[i]
    }

    pub fn dependents(&self, i: usize) -> &[usize] {
        &self.dependents[i]
    }

    /// Steps with no dependencies, in definition order.
    pub fn roots(&self) -> Vec<usize> {
        (0..self.steps.len()).filter(|&i| self.deps[i].is_empty()).collect()
    }
}

fn invalid(message: &str) -> EngineError {
    EngineError::Validation(format!("Invalid workflow: {}", message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(yaml: &str) -> Result<StepGraph, EngineError> {
        StepGraph::compile(&WorkflowDefinition::from_yaml(yaml).unwrap())
    }

    fn assert_invalid(yaml: &str, needle: &str) {
        match compile(yaml) {
            Err(EngineError::Validation(msg)) => {
                assert!(msg.contains(needle), "'{}' does not mention '{}'", msg, needle)
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected '{}' to be rejected", needle),
        }
    }

    #[test]
    fn test_diamond_edges() {
        let graph = compile(
            r#"
id: diamond
name: diamond
steps:
  - { id: a, kind: agent_call }
  - { id: b, kind: agent_call, depends_on: [a] }
  - { id: c, kind: agent_call, depends_on: [a] }
  - { id: d, kind: join, depends_on: [b, c] }
"#,
        )
        .unwrap();
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.roots(), vec![0]);
        assert_eq!(graph.dependents(0), &[1, 2]);
        assert_eq!(graph.deps(3), &[1, 2]);
        assert_eq!(graph.index_of("c"), Some(2));
    }

    #[test]
    fn test_rejects_cycles_and_unknown_deps() {
        assert_invalid(
            r#"
id: w
name: w
steps:
  - { id: a, kind: agent_call, depends_on: [c] }
  - { id: b, kind: agent_call, depends_on: [a] }
  - { id: c, kind: agent_call, depends_on: [b] }
"#,
            "cycle among steps: a, b, c",
        );
        assert_invalid(
            r#"
id: w
name: w
steps:
  - { id: a, kind: agent_call, depends_on: [ghost] }
"#,
            "unknown step 'ghost'",
        );
        assert_invalid(
            r#"
id: w
name: w
steps:
  - { id: a, kind: agent_call, depends_on: [a] }
"#,
            "depends on itself",
        );
        assert_invalid(
            r#"
id: w
name: w
steps:
  - { id: a, kind: agent_call }
  - { id: a, kind: agent_call }
"#,
            "duplicate step id 'a'",
        );
    }

    #[test]
    fn test_rejects_malformed_steps() {
        assert_invalid(
            r#"
id: w
name: w
steps:
  - { id: j, kind: join }
"#,
            "has no upstream",
        );
        assert_invalid(
            r#"
id: w
name: w
steps:
  - { id: t, kind: tool_call, tool: "" }
"#,
            "names no tool",
        );
        assert_invalid(
            r#"
id: w
name: w
steps:
  - { id: a, kind: agent_call }
  - { id: b, kind: agent_call }
  - id: br
    kind: branch
    depends_on: [a]
    condition: { step: b }
"#,
            "must depend on 'b'",
        );
        assert_invalid(
            r#"
id: w
name: w
steps:
  - { id: a, kind: agent_call }
  - id: br
    kind: branch
    depends_on: [a]
    condition: { step: a }
    when_true: [x]
  - { id: x, kind: agent_call, depends_on: [a] }
"#,
            "target 'x' is not one of its dependents",
        );
        assert_invalid(
            r#"
id: w
name: w
max_parallelism: 0
steps:
  - { id: a, kind: agent_call }
"#,
            "max_parallelism",
        );
    }
}
