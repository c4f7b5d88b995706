pub mod args;
pub mod config;
pub mod constants;
pub mod logging;
pub mod ports;
pub mod rate;
pub mod run;

#[cfg(test)]
mod config_tests;
#[cfg(test)]
pub(crate) mod test_dir;
