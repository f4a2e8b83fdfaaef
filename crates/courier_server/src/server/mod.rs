#![forbid(unsafe_code)]

pub mod admin;
pub mod auth;
pub mod cluster;
pub mod connection;
pub mod delivery;
pub mod fanout;
pub mod health;
pub mod hub;
pub mod outbound;
pub mod registry;
pub mod store;

#[cfg(test)]
mod test_support;


#[cfg(test)]
mod cluster_tests;

#[cfg(test)]
mod connection_tests;

#[cfg(test)]
mod fanout_tests;

#[cfg(test)]
mod keepalive_tests;

#[cfg(test)]
mod registry_tests;
