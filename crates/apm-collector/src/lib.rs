// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! In-process collection and delivery core of the APM agent.
//!
//! Producers register [`apm_model::SourceInfo`] records with the
//! [`correlation::CorrelationEngine`]; consumers match against them to join fragments
//! across process and thread boundaries. Completed fragments go to the
//! [`reporter::Reporter`], which buffers them, flushes on size or on a timer, and
//! ships batches to a [`service::CollectorService`] off the producer's path.

pub mod buffer;
pub mod config;
pub mod correlation;
pub mod error;
pub mod executor;
pub mod reporter;
pub mod scheduler;
pub mod service;
pub mod state;
