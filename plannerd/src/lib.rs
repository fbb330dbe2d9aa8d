pub mod daemon;
pub mod storage;
pub mod sync;
pub mod token_provider;
