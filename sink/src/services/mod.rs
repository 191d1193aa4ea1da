pub mod ledger;
pub mod mapper;

pub use ledger::Ledger;
pub use mapper::{map_message, normalize_header_name, MappingOutcome};
