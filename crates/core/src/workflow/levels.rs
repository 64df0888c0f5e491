use super::dag::WorkflowGraph;
use crate::error::GraphError;
use std::collections::HashMap;

/// Group steps into execution levels (Kahn's algorithm, kept wave by wave
/// instead of flattened).
///
/// Every level is the maximal set of steps whose dependencies were all
/// scheduled in strictly earlier levels; members of one level are free to run
/// concurrently. Steps still unscheduled once the ready set drains form a
/// cycle and the plan is rejected.
pub fn execution_levels(graph: &WorkflowGraph) -> Result<Vec<Vec<String>>, GraphError> {
    let mut remaining: HashMap<String, usize> = graph
        .step_names()
        .into_iter()
        .map(|name| {
            let unresolved = graph.dependencies_of(&name).len();
            (name, unresolved)
        })
        .collect();

    let mut ready: Vec<String> = graph
        .step_names()
        .into_iter()
        .filter(|name| remaining[name] == 0)
        .collect();

    let mut levels = Vec::new();
    let mut scheduled = 0usize;

    while !ready.is_empty() {
        let wave = ready;
        ready = Vec::new();

        for name in &wave {
            for dependent in graph.dependents_of(name) {
                let unresolved = remaining
                    .get_mut(&dependent)
                    .expect("dependent missing from graph");
                *unresolved -= 1;
                if *unresolved == 0 {
                    ready.push(dependent);
                }
            }
        }

        // Keep the next wave in authored order; the order carries no
        // execution meaning but makes plans and tests deterministic.
        ready.sort_by_key(|name| graph.position(name));

        scheduled += wave.len();
        levels.push(wave);
    }

    if scheduled != graph.len() {
        return Err(GraphError::CycleDetected(graph.len() - scheduled));
    }

    Ok(levels)
}
