pub mod batch;
pub mod cli;
pub mod config;
pub mod ddl;
pub mod event;
pub mod pipeline;
pub mod schema;
pub mod sequencer;
pub mod source;
pub mod storage;
pub mod transform;
pub mod web;
