pub mod alerts;
pub mod dispatcher;
pub mod events;
pub mod history;
pub mod hub;
pub mod store;

#[cfg(test)]
mod dispatcher_tests;
#[cfg(test)]
mod history_tests;
