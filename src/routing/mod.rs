//! Request routing: per-(chain, route) endpoint selection.

pub mod load_balancer;

pub use load_balancer::{BalancerService, EndpointSnapshot, Strategy};
