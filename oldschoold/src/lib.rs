pub mod agent;
pub mod logging;
pub mod sync;
