pub mod core;
pub mod marks;
pub mod remarks;
pub mod weights;
