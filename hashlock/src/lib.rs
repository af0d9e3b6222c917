// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod adapter;
pub mod config;
pub mod correlator;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod node;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod types;

#[cfg(test)]
pub mod test_utils;

#[cfg(test)]
mod e2e_tests;

/// Retry an RPC-shaped future with exponential backoff until it succeeds or
/// `max_elapsed_time` runs out. Every error is treated as transient here;
/// callers that must bail on specific errors handle them before reaching
/// this macro.
#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        // Starts at 400ms and doubles (with jitter) up to a one-minute
        // ceiling until the elapsed budget is spent.
        let backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(60),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                match $func.await {
                    Ok(v) => Ok(Ok(v)),
                    Err(e) => {
                        tracing::debug!("retrying after error: {:?}", e);
                        Err(backoff::Error::transient(e))
                    }
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}
