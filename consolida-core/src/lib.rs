//! Core types and consolidation services for the consolida CNPJ registry importer.

/// Waste-generator classification of establishments.
pub mod classify;
/// Tunables of the import, classification, and geocoding passes.
pub mod config;
/// Column layouts and row decoding.
pub mod decode;
/// Batch staging against the store.
pub mod engine;
/// Geocoding of establishment addresses.
pub mod geocode;
/// Snapshot folder discovery.
pub mod locator;
/// Record-level merge policy.
pub mod merge;
/// Domain models and identifiers shared by all adapters.
pub mod model;
/// Traits describing the store and geocoder interfaces.
pub mod ports;
/// Chunked, restartable extract reader.
pub mod reader;
/// Reference (dimension) tables.
pub mod reference;
/// File-name and layout registry.
pub mod registry;
/// Consolidation reports.
pub mod report;
/// High-level service facade used by clients.
pub mod service;

#[cfg(test)]
mod testing;

pub use classify::*;
pub use config::*;
pub use engine::*;
pub use geocode::*;
pub use locator::*;
pub use merge::*;
pub use model::*;
pub use ports::*;
pub use reader::*;
pub use reference::*;
pub use registry::*;
pub use report::*;
pub use service::*;
