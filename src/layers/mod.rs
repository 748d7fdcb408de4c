// Investigation layers, cheapest first. The orchestrator gates between them.
pub mod extract;   // L1 — feature extraction over history reads
pub mod ensemble;  // L2 — weighted rule ensemble
pub mod graph;     // L3 — fraud-ring connectivity
pub mod anomaly;   // L4 — behavioral sequence deviation
pub mod reasoner;  // L5 — LLM assessment of borderline cases
