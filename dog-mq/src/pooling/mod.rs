//! Pool registry, weighted selection and the queue catalog.

pub mod catalog;
pub mod registry;
pub mod select;

pub use catalog::Catalog;
pub use registry::PoolRegistry;
