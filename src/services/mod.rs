// Services module for ZipCase
// Stores, queues, orchestrators, workers, and operational plumbing

pub mod alerts;
pub mod case_search;
pub mod case_store;
pub mod credential_store;
pub mod database;
pub mod export;
pub mod name_search;
pub mod name_search_store;
pub mod queue;
pub mod session;
pub mod status;
pub mod workers;
