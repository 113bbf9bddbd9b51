//! Utils module - logging bootstrap and text helpers

pub mod logging;
pub mod sanitize;
pub mod string;
