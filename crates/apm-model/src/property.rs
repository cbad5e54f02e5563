// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError, Record};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropertyType {
    #[default]
    Text,
    Long,
    Double,
    Boolean,
}

impl PropertyType {
    fn tag(self) -> u8 {
        match self {
            Self::Text => 0,
            Self::Long => 1,
            Self::Double => 2,
            Self::Boolean => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(Self::Text),
            1 => Ok(Self::Long),
            2 => Ok(Self::Double),
            3 => Ok(Self::Boolean),
            tag => Err(CodecError::InvalidTag {
                field: "property type",
                tag,
            }),
        }
    }
}

/// Name/value pair attached to an event, used for filtering and as correlation hints.
///
/// Values are kept in their textual form together with the type they were captured as.
/// Two properties are the same property when name and value match; the type does not
/// take part in equality, so the same value reported twice collapses in a set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    name: String,
    value: String,
    #[serde(rename = "type", default)]
    kind: PropertyType,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<String>, kind: PropertyType) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            kind,
        }
    }

    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, value, PropertyType::Text)
    }

    pub fn long(name: impl Into<String>, value: i64) -> Self {
        Self::new(name, value.to_string(), PropertyType::Long)
    }

    pub fn double(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, value.to_string(), PropertyType::Double)
    }

    pub fn boolean(name: impl Into<String>, value: bool) -> Self {
        Self::new(name, value.to_string(), PropertyType::Boolean)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn kind(&self) -> PropertyType {
        self.kind
    }

    pub fn as_long(&self) -> Option<i64> {
        match self.kind {
            PropertyType::Long => self.value.parse().ok(),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self.kind {
            PropertyType::Long | PropertyType::Double => self.value.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.kind {
            PropertyType::Boolean => self.value.parse().ok(),
            _ => None,
        }
    }
}

impl PartialEq for Property {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value
    }
}

impl Eq for Property {}

impl Hash for Property {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.value.hash(state);
    }
}

impl PartialOrd for Property {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Property {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.value.cmp(&other.value))
    }
}

impl Record for Property {
    const NAME: &'static str = "Property";
    const VERSION: i32 = 1;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32(Self::VERSION);
        codec::put_string(buf, Some(&self.name));
        codec::put_string(buf, Some(&self.value));
        buf.put_u8(self.kind.tag());
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        match codec::get_version(buf)? {
            1 => {
                let name = codec::get_required_string(buf, "property name")?;
                let value = codec::get_required_string(buf, "property value")?;
                let tag = codec::get_u8(buf)?;
                Ok(Self {
                    name,
                    value,
                    kind: PropertyType::from_tag(tag)?,
                })
            }
            found => Err(CodecError::UnsupportedVersion {
                record: Self::NAME,
                found,
            }),
        }
    }
}
