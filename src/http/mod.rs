//! HTTP wire adapter: REST routes mirroring the filesystem contract.
//!
//! Success is `200` (`206` for ranged downloads); failures answer `500`
//! with a JSON body carrying the stable error code, the same table the
//! TCP protocol uses.

pub mod client;
pub mod server;

pub use client::HttpFs;
pub use server::router;

use serde::{Deserialize, Serialize};

/// JSON error body: `{"errorCode": N}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "errorCode")]
    pub error_code: u32,
}
