// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError, Record};

/// Whether the event was observed receiving (`In`) or sending (`Out`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    In,
    Out,
}

/// Network or service endpoint associated with a captured event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRef {
    pub address: String,
    pub direction: Direction,
}

impl EndpointRef {
    pub fn new(address: impl Into<String>, direction: Direction) -> Self {
        Self {
            address: address.into(),
            direction,
        }
    }

    pub fn inbound(address: impl Into<String>) -> Self {
        Self::new(address, Direction::In)
    }

    pub fn outbound(address: impl Into<String>) -> Self {
        Self::new(address, Direction::Out)
    }
}

impl fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::In => write!(f, "<- {}", self.address),
            Direction::Out => write!(f, "-> {}", self.address),
        }
    }
}

impl Record for EndpointRef {
    const NAME: &'static str = "EndpointRef";
    const VERSION: i32 = 1;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32(Self::VERSION);
        codec::put_string(buf, Some(&self.address));
        codec::put_bool(buf, self.direction == Direction::Out);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        match codec::get_version(buf)? {
            1 => {
                let address = codec::get_required_string(buf, "endpoint address")?;
                let direction = if codec::get_bool(buf, "endpoint direction")? {
                    Direction::Out
                } else {
                    Direction::In
                };
                Ok(Self { address, direction })
            }
            found => Err(CodecError::UnsupportedVersion {
                record: Self::NAME,
                found,
            }),
        }
    }
}
