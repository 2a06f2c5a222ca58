//! Application services: table gateway, monitoring and the persistence seams.

pub mod error;
pub mod gateway;
pub mod monitor;
pub mod repos;
