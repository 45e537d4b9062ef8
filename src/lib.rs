//! Shared FireHydrant webhook registration and incident event dispatch.
//!
//! Many subscribers share one upstream webhook per provider account. The
//! [`reconciler`] keeps that registration's scope covering every compatible
//! subscriber; each inbound delivery is authenticated by [`verification`],
//! then run through every attached subscriber's [`filter`] by [`dispatch`].

pub mod config;
pub mod delivery_log;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod http_server;
pub mod reconciler;
pub mod rpc;
pub mod store;
pub mod types;
pub mod upstream;
pub mod verification;
