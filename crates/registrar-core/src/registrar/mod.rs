//! Registration directory

mod registry;

pub use registry::{ExtensionCatalog, RegistrationDirectory, RegistrationOutcome};
