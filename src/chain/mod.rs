//! Chain state: block index, acceptance engine, orphan pool, persistence,
//! tip notifications.

pub mod chainstate;
pub mod index;
pub mod notify;
pub mod orphans;
pub mod store;

pub use chainstate::{AcceptOutcome, ChainstateManager, HeaderInfo, TipInfo};
pub use notify::TipChange;
