// Library interface for warmsh
// The two binaries and the integration tests build on these modules

pub mod daemon;
pub mod error;
pub mod logging;
pub mod shell;
pub mod signal;
pub mod terminal;
