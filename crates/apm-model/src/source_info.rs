// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer-side events cached while they wait for their consumers.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError, Record};
use crate::endpoint::EndpointRef;
use crate::property::Property;

/// Cached record of a producer event (a message send, an outbound request) awaiting
/// correlation with one or more consumer events.
///
/// `Clone` is cheap: the property set lives behind an [`Arc`] and copies share it. The
/// set can only be changed through [`SourceInfo::add_property`] and
/// [`SourceInfo::set_properties`], which copy it first when it is shared, so a record
/// that has already been handed to the correlation engine is never changed through one
/// of its copies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    /// Correlation identifier of the producer invocation. Unique within the
    /// correlation window only.
    pub id: String,
    pub endpoint: Option<EndpointRef>,
    /// Start time in epoch milliseconds.
    pub timestamp: u64,
    /// Elapsed time in milliseconds; only final once the producing span completes.
    pub duration: u64,
    /// Fragment the producer event belongs to.
    pub fragment_id: String,
    pub host_name: Option<String>,
    pub host_address: Option<String>,
    /// Set when the event fans out to several consumers (pub/sub). Such records are
    /// kept for matching until they are retired or expire.
    pub multiple_consumers: bool,
    #[serde(default)]
    properties: Arc<BTreeSet<Property>>,
}

impl SourceInfo {
    pub fn new(id: impl Into<String>, fragment_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fragment_id: fragment_id.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: EndpointRef) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_host(mut self, host_name: impl Into<String>, host_address: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self.host_address = Some(host_address.into());
        self
    }

    #[must_use]
    pub fn with_multiple_consumers(mut self, multiple_consumers: bool) -> Self {
        self.multiple_consumers = multiple_consumers;
        self
    }

    #[must_use]
    pub fn with_property(mut self, property: Property) -> Self {
        self.add_property(property);
        self
    }

    pub fn properties(&self) -> &BTreeSet<Property> {
        &self.properties
    }

    /// Adds a property, returning false if an equal one was already present.
    pub fn add_property(&mut self, property: Property) -> bool {
        if self.properties.contains(&property) {
            return false;
        }
        Arc::make_mut(&mut self.properties).insert(property)
    }

    pub fn set_properties(&mut self, properties: impl IntoIterator<Item = Property>) {
        self.properties = Arc::new(properties.into_iter().collect());
    }

    /// Whether this record and `other` still share one property set.
    pub fn shares_properties_with(&self, other: &SourceInfo) -> bool {
        Arc::ptr_eq(&self.properties, &other.properties)
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.iter().any(|p| p.name() == name)
    }

    /// All values recorded under `name`.
    pub fn properties_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Property> {
        self.properties.iter().filter(move |p| p.name() == name)
    }

    fn decode_v1<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let id = codec::get_required_string(buf, "id")?;
        let endpoint = codec::get_optional::<EndpointRef, _>(buf)?;
        let timestamp = codec::get_u64(buf)?;
        let duration = codec::get_u64(buf)?;
        let fragment_id = codec::get_required_string(buf, "fragment id")?;
        let host_name = codec::get_string(buf)?;
        let host_address = codec::get_string(buf)?;
        let multiple_consumers = codec::get_bool(buf, "multiple consumers")?;

        let count = codec::get_count(buf)?;
        let mut properties = BTreeSet::new();
        for _ in 0..count {
            properties.insert(Property::decode(buf)?);
        }

        Ok(Self {
            id,
            endpoint,
            timestamp,
            duration,
            fragment_id,
            host_name,
            host_address,
            multiple_consumers,
            properties: Arc::new(properties),
        })
    }
}

impl Record for SourceInfo {
    const NAME: &'static str = "SourceInfo";
    const VERSION: i32 = 1;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32(Self::VERSION);
        codec::put_string(buf, Some(&self.id));
        codec::put_optional(buf, self.endpoint.as_ref());
        buf.put_u64(self.timestamp);
        buf.put_u64(self.duration);
        codec::put_string(buf, Some(&self.fragment_id));
        codec::put_string(buf, self.host_name.as_deref());
        codec::put_string(buf, self.host_address.as_deref());
        codec::put_bool(buf, self.multiple_consumers);
        codec::put_count(buf, self.properties.len());
        for property in self.properties.iter() {
            property.encode(buf);
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        match codec::get_version(buf)? {
            1 => Self::decode_v1(buf),
            found => Err(CodecError::UnsupportedVersion {
                record: Self::NAME,
                found,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Direction;
    use proptest::prelude::*;

    fn populated() -> SourceInfo {
        SourceInfo::new("corr-1", "frag-1")
            .with_endpoint(EndpointRef::outbound("jms://orders"))
            .with_timestamp(1_700_000_000_000)
            .with_host("web-1", "10.0.0.5")
            .with_property(Property::text("customer", "acme"))
            .with_property(Property::long("items", 3))
    }

    #[test]
    fn test_clone_shares_properties() {
        let original = populated();
        let copy = original.clone();

        assert!(copy.shares_properties_with(&original));
        assert_eq!(copy, original);
    }

    #[test]
    fn test_mutating_a_copy_leaves_the_original_untouched() {
        let original = populated();
        let mut copy = original.clone();

        assert!(copy.add_property(Property::text("region", "eu")));

        assert!(!copy.shares_properties_with(&original));
        assert!(!original.has_property("region"));
        assert_eq!(original.properties().len(), 2);
        assert_eq!(copy.properties().len(), 3);
    }

    #[test]
    fn test_duplicate_property_does_not_unshare() {
        let original = populated();
        let mut copy = original.clone();

        assert!(!copy.add_property(Property::text("customer", "acme")));
        assert!(copy.shares_properties_with(&original));
    }

    #[test]
    fn test_multi_valued_properties() {
        let source = SourceInfo::new("id", "frag")
            .with_property(Property::text("tag", "a"))
            .with_property(Property::text("tag", "b"))
            .with_property(Property::text("other", "c"));

        assert!(source.has_property("tag"));
        assert!(!source.has_property("missing"));
        let values: Vec<&str> = source.properties_named("tag").map(|p| p.value()).collect();
        assert_eq!(values, vec!["a", "b"]);
    }

    #[test]
    fn test_round_trip_with_all_fields() {
        let source = populated().with_multiple_consumers(true);
        let decoded = SourceInfo::from_bytes(&source.to_bytes()).unwrap();
        assert_eq!(decoded, source);
    }

    #[test]
    fn test_round_trip_without_optional_fields() {
        let source = SourceInfo::new("corr-2", "frag-2");
        let decoded = SourceInfo::from_bytes(&source.to_bytes()).unwrap();

        assert_eq!(decoded, source);
        assert!(decoded.endpoint.is_none());
        assert!(decoded.host_name.is_none());
        assert!(decoded.properties().is_empty());
        assert!(!decoded.multiple_consumers);
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut bytes = populated().to_bytes().to_vec();
        bytes[..4].copy_from_slice(&2i32.to_be_bytes());

        assert_eq!(
            SourceInfo::from_bytes(&bytes).unwrap_err(),
            CodecError::UnsupportedVersion {
                record: "SourceInfo",
                found: 2
            }
        );
    }

    #[test]
    fn test_nested_endpoint_version_is_checked() {
        let source = SourceInfo::new("a", "b").with_endpoint(EndpointRef::inbound("x"));
        let mut bytes = source.to_bytes().to_vec();
        // version(4) + id length(4) + "a"(1) + presence(1), then the endpoint version
        bytes[10..14].copy_from_slice(&7i32.to_be_bytes());

        assert_eq!(
            SourceInfo::from_bytes(&bytes).unwrap_err(),
            CodecError::UnsupportedVersion {
                record: "EndpointRef",
                found: 7
            }
        );
    }

    #[test]
    fn test_truncated_record_is_rejected() {
        let bytes = populated().to_bytes();
        let err = SourceInfo::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let mut bytes = populated().to_bytes().to_vec();
        bytes.push(0);
        assert_eq!(
            SourceInfo::from_bytes(&bytes).unwrap_err(),
            CodecError::TrailingBytes(1)
        );
    }

    #[test]
    fn test_null_id_is_rejected() {
        let mut bytes = SourceInfo::new("", "frag").to_bytes().to_vec();
        bytes[4..8].copy_from_slice(&(-1i32).to_be_bytes());
        assert_eq!(
            SourceInfo::from_bytes(&bytes).unwrap_err(),
            CodecError::MissingField("id")
        );
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(populated()).unwrap();
        assert_eq!(json["fragmentId"], "frag-1");
        assert_eq!(json["multipleConsumers"], false);
        assert_eq!(json["endpoint"]["direction"], "OUT");
        assert_eq!(json["properties"].as_array().unwrap().len(), 2);
    }

    fn arb_source() -> impl Strategy<Value = SourceInfo> {
        (
            "[a-z0-9-]{1,16}",
            "[a-z0-9-]{1,16}",
            proptest::option::of(("[a-z:/.]{0,24}", any::<bool>())),
            any::<u64>(),
            any::<u64>(),
            proptest::option::of("\\PC{0,12}"),
            proptest::option::of("[0-9.]{0,15}"),
            any::<bool>(),
            proptest::collection::vec(("[a-z]{1,6}", "\\PC{0,8}"), 0..5),
        )
            .prop_map(
                |(id, fragment_id, endpoint, timestamp, duration, host, addr, multi, props)| {
                    let mut source = SourceInfo::new(id, fragment_id);
                    source.endpoint = endpoint.map(|(address, out)| {
                        EndpointRef::new(address, if out { Direction::Out } else { Direction::In })
                    });
                    source.timestamp = timestamp;
                    source.duration = duration;
                    source.host_name = host;
                    source.host_address = addr;
                    source.multiple_consumers = multi;
                    source.set_properties(props.into_iter().map(|(n, v)| Property::text(n, v)));
                    source
                },
            )
    }

    proptest! {
        #[test]
        fn prop_encoding_is_lossless(source in arb_source()) {
            let decoded = SourceInfo::from_bytes(&source.to_bytes()).unwrap();
            prop_assert_eq!(decoded, source);
        }
    }
}
