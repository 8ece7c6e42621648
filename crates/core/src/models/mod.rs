//! Domain models shared by the pipeline and the query layer

pub mod catalog;
pub mod interaction;
pub mod project;

pub use catalog::CatalogItem;
pub use interaction::{Purchase, Recommendation};
pub use project::{FileKind, FileLocation, Project, ProjectState, ProjectTransition};
