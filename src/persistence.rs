pub mod collections;
pub mod memory;
pub mod model;
pub mod repo;
pub mod runs;
pub mod store;
