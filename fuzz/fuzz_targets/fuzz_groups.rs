#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Any graph that loads can be ordered and segmented without panicking.
    if let Ok(graph) = serde_json::from_slice::<leveler_ir::ComputeGraph>(data) {
        let _ = graph.topological_order();
        let _ = leveler_opt::find_layer_groups(&graph);
    }
});
