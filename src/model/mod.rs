pub mod graph;
pub mod object;

pub use graph::*;
pub use object::*;
