// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Data model shared by producers, the correlation engine and the reporter.
//!
//! A [`SourceInfo`] caches the producer half of a correlated pair until the consumer
//! half arrives; a [`Fragment`] is the locally observed slice of a transaction that is
//! eventually batched and shipped. Records that cross process boundaries use the
//! versioned binary layout in [`codec`].

pub mod codec;
pub mod endpoint;
pub mod fragment;
pub mod property;
pub mod source_info;

pub use codec::{CodecError, Record};
pub use endpoint::{Direction, EndpointRef};
pub use fragment::{CorrelationLink, CorrelationScope, Fragment};
pub use property::{Property, PropertyType};
pub use source_info::SourceInfo;
