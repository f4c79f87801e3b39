mod graph;

pub use graph::{InputValue, NodeId, NodeLink, WorkflowGraph, WorkflowNode};
