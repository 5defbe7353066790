mod node;

pub use node::{NodeRecord, NodeStatus, Role};
