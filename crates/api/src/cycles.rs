// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Feedback-cycle detection over port-granularity vertices.
//!
//! Every port `(node, port)` is a vertex. Edges are the links plus an implicit
//! edge from each input port to each output port of the same node. Strongly
//! connected components are found with Kosaraju–Sharir:
//!
//! 1. post-order DFS over the reversed relation;
//! 2. DFS over the original relation, seeded in reverse post-order;
//! 3. a link is cyclic when both endpoints share a component of more than one vertex.
//!
//! Both passes use explicit stacks so deep graphs cannot overflow the call stack.

use crate::network::{LinkId, Node};
use nodeflow_core::PortDirection;
use std::collections::{HashMap, HashSet};

const UNASSIGNED: usize = usize::MAX;

/// Links whose endpoints lie on a common cycle.
///
/// Links naming unknown ports are ignored.
pub fn cyclic_links<'a, N, L>(nodes: N, links: L) -> HashSet<LinkId>
where
    N: IntoIterator<Item = &'a Node>,
    L: IntoIterator<Item = &'a LinkId>,
{
    let mut index: HashMap<(&str, &str), usize> = HashMap::new();
    let mut forward: Vec<Vec<usize>> = Vec::new();

    for node in nodes {
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for port in &node.ports {
            let vertex = forward.len();
            forward.push(Vec::new());
            index.insert((node.id.as_str(), port.id.as_str()), vertex);
            match port.direction {
                PortDirection::Input => inputs.push(vertex),
                PortDirection::Output => outputs.push(vertex),
            }
        }
        for &input in &inputs {
            forward[input].extend_from_slice(&outputs);
        }
    }

    let edges: Vec<(&LinkId, usize, usize)> = links
        .into_iter()
        .filter_map(|link| {
            let from = *index.get(&(&*link.from_node, &*link.from_port))?;
            let to = *index.get(&(&*link.to_node, &*link.to_port))?;
            Some((link, from, to))
        })
        .collect();
    for &(_, from, to) in &edges {
        forward[from].push(to);
    }

    let mut reverse = vec![Vec::new(); forward.len()];
    for (from, targets) in forward.iter().enumerate() {
        for &to in targets {
            reverse[to].push(from);
        }
    }

    let order = post_order(&reverse);
    let (component, sizes) = assign_components(&forward, &order);

    edges
        .into_iter()
        .filter(|&(_, from, to)| component[from] == component[to] && sizes[component[from]] > 1)
        .map(|(link, _, _)| link.clone())
        .collect()
}

/// Post-order of an iterative DFS covering every vertex.
fn post_order(adjacency: &[Vec<usize>]) -> Vec<usize> {
    let mut visited = vec![false; adjacency.len()];
    let mut order = Vec::with_capacity(adjacency.len());
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in 0..adjacency.len() {
        if visited[root] {
            continue;
        }
        visited[root] = true;
        stack.push((root, 0));

        while let Some(top) = stack.last_mut() {
            let (vertex, next) = *top;
            if let Some(&target) = adjacency[vertex].get(next) {
                top.1 += 1;
                if !visited[target] {
                    visited[target] = true;
                    stack.push((target, 0));
                }
            } else {
                order.push(vertex);
                stack.pop();
            }
        }
    }
    order
}

/// Component id per vertex and the size of each component.
fn assign_components(adjacency: &[Vec<usize>], order: &[usize]) -> (Vec<usize>, Vec<usize>) {
    let mut component = vec![UNASSIGNED; adjacency.len()];
    let mut sizes = Vec::new();
    let mut stack = Vec::new();

    for &root in order.iter().rev() {
        if component[root] != UNASSIGNED {
            continue;
        }
        let id = sizes.len();
        let mut size = 0;
        component[root] = id;
        stack.push(root);
        while let Some(vertex) = stack.pop() {
            size += 1;
            for &target in &adjacency[vertex] {
                if component[target] == UNASSIGNED {
                    component[target] = id;
                    stack.push(target);
                }
            }
        }
        sizes.push(size);
    }
    (component, sizes)
}
