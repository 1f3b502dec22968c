//! Generic extraction engine for oripa/gacha catalog pages: render a listing,
//! pull product-like records out of it, drop what the sink already knows, and
//! upsert the rest. Everything site-specific lives in a declarative
//! [`profile::SiteProfile`]; the engine is one pipeline shared by all sites.

pub mod dedup;
pub mod error;
pub mod extract;
pub mod profile;
pub mod report;
pub mod run;
pub mod session;
pub mod sink;

pub use error::EngineError;
pub use extract::{RawItem, Record};
pub use profile::SiteProfile;
pub use run::RunOutcome;
