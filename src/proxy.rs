//! Proxy-system detection and real-author resolution for webhook messages.

pub mod classifier;
pub mod heuristics;

pub use classifier::{AuthorAssociation, ProxyClassification, ProxyClassifier, ResolvedAuthor};
pub use heuristics::{MarkerHeuristic, ProxyHeuristic, ProxySignal};
