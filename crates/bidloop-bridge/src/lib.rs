//! # Settlement bridge
//!
//! Value leaves the platform as [`PendingTransfer`](bidloop_core::PendingTransfer)
//! rows in an outbox. [`SettlementTransport`] drains the outbox through a
//! [`TransferGateway`], the only piece that talks to the payment network.
//!
//! ```text
//!   enqueue ──► pending ──claim──► processing ──gateway ok──► completed
//!                  ▲                    │
//!                  └──── retry < max ◄──┤ gateway error / timeout
//!                                       └──── retry ≥ max ──► failed
//!
//!   completed | failed ──(retention elapsed)──► archive
//! ```

pub mod gateway;
pub mod transport;

pub use gateway::{DryRunGateway, GatewayError, HttpGateway, HttpGatewayConfig, TransferGateway, TransferRequest};
pub use transport::{BatchReport, SettlementSettings, SettlementTransport, TransportStats};
