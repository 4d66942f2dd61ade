mod port_sequence;

pub use port_sequence::*;
