use crate::error::{Result, TsError};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;

/// A tag/length framed descriptor, kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// descriptor_tag
    pub tag: u8,
    /// Descriptor payload after the length byte.
    pub data: Bytes,
}

/// Splits a descriptor loop into its descriptors.
///
/// A descriptor whose declared length runs past the end of the loop is an
/// error; the descriptors before it are lost with it.
pub fn parse_descriptors(data: &[u8]) -> Result<Vec<Descriptor>> {
    let mut descriptors = Vec::new();
    let mut pos = 0;

    while pos + 2 <= data.len() {
        let tag = data[pos];
        let length = data[pos + 1] as usize;
        pos += 2;

        if pos + length > data.len() {
            return Err(TsError::InvalidData(format!(
                "descriptor 0x{:02x} declares {} bytes, {} left",
                tag,
                length,
                data.len() - pos
            )));
        }

        descriptors.push(Descriptor {
            tag,
            data: Bytes::copy_from_slice(&data[pos..pos + length]),
        });
        pos += length;
    }

    Ok(descriptors)
}

/// Result of running a descriptor through a [`DescriptorRegistry`].
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedDescriptor {
    /// Output of a registered decoder, as name/value pairs.
    Fields {
        /// Name the decoder was registered under.
        name: &'static str,
        /// Decoded name/value pairs.
        fields: Vec<(&'static str, String)>,
    },
    /// No decoder is registered for the tag, or the decoder rejected it.
    Opaque(Descriptor),
}

type DecodeFn = dyn Fn(&[u8]) -> Result<Vec<(&'static str, String)>> + Send + Sync;

/// Maps descriptor tags to decoder functions.
///
/// The long tail of descriptor semantics lives outside this crate; callers
/// register what they understand and everything else stays opaque.
#[derive(Default)]
pub struct DescriptorRegistry {
    decoders: HashMap<u8, (&'static str, Box<DecodeFn>)>,
}

impl DescriptorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `decoder` for `tag`, replacing any earlier registration.
    pub fn register<F>(&mut self, tag: u8, name: &'static str, decoder: F)
    where
        F: Fn(&[u8]) -> Result<Vec<(&'static str, String)>> + Send + Sync + 'static,
    {
        self.decoders.insert(tag, (name, Box::new(decoder)));
    }

    /// Whether a decoder exists for `tag`.
    pub fn is_registered(&self, tag: u8) -> bool {
        self.decoders.contains_key(&tag)
    }

    /// Runs the decoder for the descriptor tag, falling back to opaque bytes.
    pub fn decode(&self, descriptor: &Descriptor) -> DecodedDescriptor {
        match self.decoders.get(&descriptor.tag) {
            Some((name, decoder)) => match decoder(&descriptor.data) {
                Ok(fields) => DecodedDescriptor::Fields { name, fields },
                Err(e) => {
                    log::warn!("descriptor 0x{:02x} ({}) failed to decode: {}", descriptor.tag, name, e);
                    DecodedDescriptor::Opaque(descriptor.clone())
                }
            },
            None => DecodedDescriptor::Opaque(descriptor.clone()),
        }
    }
}

impl fmt::Debug for DescriptorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.decoders.keys().copied().collect();
        tags.sort_unstable();
        f.debug_struct("DescriptorRegistry").field("tags", &tags).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_descriptors() {
        let data = [0x0a, 0x02, 0x65, 0x6e, 0x52, 0x01, 0x07];
        let descriptors = parse_descriptors(&data).unwrap();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].tag, 0x0a);
        assert_eq!(&descriptors[0].data[..], b"en");
        assert_eq!(descriptors[1].data[..], [0x07]);

        assert!(parse_descriptors(&[0x0a, 0x05, 0x00]).is_err());
    }

    #[test]
    fn test_registry_dispatch() {
        let mut registry = DescriptorRegistry::new();
        registry.register(0x52, "stream_identifier", |data| {
            let tag = data
                .first()
                .ok_or_else(|| TsError::InvalidData("empty stream_identifier".into()))?;
            Ok(vec![("component_tag", tag.to_string())])
        });

        let known = Descriptor { tag: 0x52, data: Bytes::from_static(&[0x07]) };
        assert_eq!(
            registry.decode(&known),
            DecodedDescriptor::Fields {
                name: "stream_identifier",
                fields: vec![("component_tag", "7".to_string())],
            }
        );

        let broken = Descriptor { tag: 0x52, data: Bytes::new() };
        assert_eq!(registry.decode(&broken), DecodedDescriptor::Opaque(broken.clone()));

        let unknown = Descriptor { tag: 0x99, data: Bytes::from_static(b"xyz") };
        assert_eq!(registry.decode(&unknown), DecodedDescriptor::Opaque(unknown.clone()));
    }
}
