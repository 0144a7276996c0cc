mod compress;
mod engine;
mod error;
pub mod index;
mod memory;
#[cfg(feature = "redis")]
mod redis;
mod scorer;
mod traits;

pub use engine::{
    CacheDirectives, CacheEngine, CacheHit, EngineStats, LookupOutcome, LookupTiers, MatchKind,
    Provenance, RequestContext,
};
pub use error::{CacheError, CacheResult};
pub use memory::MemoryHotStore;
#[cfg(feature = "redis")]
pub use redis::RedisHotStore;
pub use scorer::{GuardrailRejection, ScoreBreakdown};
pub use traits::HotStore;
