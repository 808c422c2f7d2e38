pub mod aggregator;
pub mod committee;
pub mod config;
pub mod core;
pub mod error;
pub mod helper;
pub mod mempool;
pub mod message;
pub mod proposer;
pub mod qc;
pub mod store;
pub mod synchronizer;
pub mod timer;

pub use aggregator::*;
pub use committee::*;
pub use config::*;
pub use error::*;
pub use helper::*;
pub use mempool::*;
pub use message::*;
pub use proposer::*;
pub use qc::*;
pub use self::core::*;
pub use store::*;
pub use synchronizer::*;
pub use timer::*;

pub const CHANNEL_CAPACITY: usize = 1_000;
