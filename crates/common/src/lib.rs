pub mod plate_tasks;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
