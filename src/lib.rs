pub mod audit;
pub mod config;
pub mod kpi;
pub mod pipeline;
pub mod quality;
pub mod query;
pub mod source;
pub mod storage;
pub mod table;
