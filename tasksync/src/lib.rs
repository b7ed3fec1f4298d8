pub mod config;
pub mod hasher;
pub mod model;
pub mod provider;
pub mod storage;
pub mod sync;
pub mod task_store;
