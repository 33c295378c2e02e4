pub mod api;
pub mod model;
pub mod parser;
pub mod service;
