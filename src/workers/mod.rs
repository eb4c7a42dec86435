pub mod log_purger;
pub mod prober;
pub mod status_writer;
pub mod syncer;

pub use log_purger::LogPurger;
pub use prober::Prober;
pub use status_writer::StatusWriter;
pub use syncer::Syncer;
