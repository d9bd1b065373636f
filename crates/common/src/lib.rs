// courier-common: wire protocol and shared types for the Courier workspace

pub mod protocol;
pub mod types;
pub mod validation;
