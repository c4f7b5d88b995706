pub mod app;
pub mod control;
pub mod domain;
pub mod infra;
pub mod support;
