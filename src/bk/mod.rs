pub mod backup;
pub mod build_info;
pub mod cli;
pub mod config;
pub mod controller;
pub mod disk;
pub mod drift;
pub mod exec;
pub mod guard;
pub mod health;
pub mod journal;
pub mod maintenance;
pub mod model;
pub mod report;
pub mod retention;
