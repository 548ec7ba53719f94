//! Flame graph tree built by stacktrace and span merges.

use std::fmt;

const ROOT: usize = 0;

#[derive(Debug, Clone)]
struct Node {
    name: String,
    children: Vec<usize>,
    self_value: u64,
    total: u64,
}

/// Call tree keyed by function name, stored in an arena. Node 0 is a nameless root.
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                name: String::new(),
                children: Vec::new(),
                self_value: 0,
                total: 0,
            }],
        }
    }

    fn child(&mut self, parent: usize, name: &str) -> usize {
        if let Some(&c) = self.nodes[parent]
            .children
            .iter()
            .find(|&&c| self.nodes[c].name == name)
        {
            return c;
        }
        let id = self.nodes.len();
        self.nodes.push(Node {
            name: name.to_string(),
            children: Vec::new(),
            self_value: 0,
            total: 0,
        });
        self.nodes[parent].children.push(id);
        id
    }

    /// Adds `value` along `stack`, root frame first.
    pub fn insert_stack<S: AsRef<str>>(&mut self, stack: &[S], value: u64) {
        if value == 0 {
            return;
        }
        let mut node = ROOT;
        self.nodes[ROOT].total += value;
        for frame in stack {
            node = self.child(node, frame.as_ref());
            self.nodes[node].total += value;
        }
        self.nodes[node].self_value += value;
    }

    pub fn merge(&mut self, other: &Tree) {
        for (stack, value) in other.stacks() {
            self.insert_stack(&stack, value);
        }
    }

    pub fn total(&self) -> u64 {
        self.nodes[ROOT].total
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Total value of the node at `path` (root frame first).
    pub fn node_total(&self, path: &[&str]) -> Option<u64> {
        let mut node = ROOT;
        for name in path {
            node = *self.nodes[node]
                .children
                .iter()
                .find(|&&c| self.nodes[c].name == *name)?;
        }
        Some(self.nodes[node].total)
    }

    /// Every stack with a non-zero self value, root frame first, in depth-first order.
    pub fn stacks(&self) -> Vec<(Vec<&str>, u64)> {
        let mut out = Vec::new();
        let mut path: Vec<&str> = Vec::new();
        // (node, depth); children pushed in reverse so they pop in insertion order
        let mut stack: Vec<(usize, usize)> = self.nodes[ROOT]
            .children
            .iter()
            .rev()
            .map(|&c| (c, 0))
            .collect();
        while let Some((node, depth)) = stack.pop() {
            path.truncate(depth);
            path.push(&self.nodes[node].name);
            if self.nodes[node].self_value > 0 {
                out.push((path.clone(), self.nodes[node].self_value));
            }
            stack.extend(self.nodes[node].children.iter().rev().map(|&c| (c, depth + 1)));
        }
        out
    }

    /// Collapsed-stack lines (`a;b;c value`), sorted.
    pub fn collapsed(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .stacks()
            .into_iter()
            .map(|(stack, v)| format!("{} {}", stack.join(";"), v))
            .collect();
        lines.sort();
        lines
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.collapsed() {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}
