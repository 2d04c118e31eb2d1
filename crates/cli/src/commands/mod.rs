//! CLI command implementations

pub mod inspect;
pub mod prerun;
pub mod replay;
pub mod template;
