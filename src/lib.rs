pub mod app;
pub mod archive;
pub mod config;
pub mod domain;
pub mod error;
pub mod gbif;
pub mod geohash;
pub mod output;
pub mod pool;
pub mod rank;
pub mod records;
pub mod reference;
pub mod remote;
pub mod sink;
pub mod table;
pub mod throttle;
