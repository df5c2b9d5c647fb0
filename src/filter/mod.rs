//! # Transport Filter Chain
//!
//! Filters are byte transformers stacked between the application and the
//! raw transport. The chain `[F0, F1, .., Fn]` keeps `F0` closest to the
//! application and `Fn` closest to the wire: outgoing data is transformed
//! `F0 -> Fn`, incoming data `Fn -> F0`. Every filter carries a stable
//! numeric id used during negotiation, so both ends of a connection can
//! agree on an identical stack before any filtered traffic flows.
//!
//! A filter may emit zero or more bytes for any given input: compression
//! buffers input until a flush point, an HTTP envelope holds bytes until a
//! full header has arrived. The chain driver therefore runs on an explicit
//! work queue: each completed transform enqueues its output for the next
//! stage instead of calling into it, so arbitrarily long synchronous
//! completion cascades unwind in a loop with fixed stack depth.

pub mod compress;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::buffer::ByteBuffer;
use crate::error::Result;

/// Stable filter identifier, negotiated over the wire.
pub type FilterId = u32;

/// Well-known filter ids.
pub mod filter_ids {
    use super::FilterId;

    pub const IDENTITY: FilterId = 1;
    pub const ZLIB_STATELESS: FilterId = 2;
    pub const ZLIB_STATEFUL: FilterId = 3;
    /// Reserved for a TLS record layer supplied by the application.
    pub const TLS: FilterId = 4;
    pub const HTTP_FRAME: FilterId = 5;
    pub const HTTP_CONNECT: FilterId = 6;
}

/// A byte transformer in the chain.
///
/// `write` moves application bytes toward the transport, `read` moves wire
/// bytes toward the application. Both may buffer internally and emit
/// nothing; both may emit more than they consumed. `reset` returns the
/// filter to its initial state when a connection is reused.
pub trait Filter: Send {
    fn filter_id(&self) -> FilterId;

    fn write(&mut self, input: &[ByteBuffer], out: &mut Vec<ByteBuffer>) -> Result<()>;

    fn read(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()>;

    fn reset(&mut self) {}
}

/// Creates filter instances for a negotiated id. Server sessions
/// instantiate from the registry when a client requests a filter stack;
/// clients instantiate their requested ids the same way.
pub trait FilterFactory: Send + Sync {
    fn filter_id(&self) -> FilterId;

    fn create_filter(&self) -> Box<dyn Filter>;
}

/// Registry of filter factories, shared through the runtime.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    factories: HashMap<FilterId, Arc<dyn FilterFactory>>,
}

impl FilterRegistry {
    /// Registry pre-loaded with the bundled filters.
    pub fn with_defaults() -> Self {
        let mut registry = FilterRegistry::default();
        registry.register(Arc::new(IdentityFilterFactory));
        registry.register(Arc::new(compress::ZlibStatelessFilterFactory));
        registry.register(Arc::new(compress::ZlibStatefulFilterFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn FilterFactory>) {
        self.factories.insert(factory.filter_id(), factory);
    }

    pub fn contains(&self, id: FilterId) -> bool {
        self.factories.contains_key(&id)
    }

    pub fn create(&self, id: FilterId) -> Option<Box<dyn Filter>> {
        self.factories.get(&id).map(|f| f.create_filter())
    }

    /// Instantiates a full stack, preserving order. `None` if any id is
    /// unknown.
    pub fn create_stack(&self, ids: &[FilterId]) -> Option<Vec<Box<dyn Filter>>> {
        ids.iter().map(|id| self.create(*id)).collect()
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.factories.keys().collect();
        ids.sort();
        f.debug_struct("FilterRegistry").field("ids", &ids).finish()
    }
}

/// One step of pending work inside the read driver: bytes about to enter
/// the filter at `next_index - 1`, or to surface to the application when
/// `next_index` is zero.
struct Step {
    next_index: usize,
    data: Vec<u8>,
}

/// The ordered filter stack of one connection.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filters(filters: Vec<Box<dyn Filter>>) -> Self {
        FilterChain { filters }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn ids(&self) -> Vec<FilterId> {
        self.filters.iter().map(|f| f.filter_id()).collect()
    }

    /// Replaces the stack, e.g. after transport filter negotiation.
    pub fn install(&mut self, filters: Vec<Box<dyn Filter>>) {
        self.filters = filters;
    }

    /// Appends a filter at the transport end of the chain.
    pub fn push_outermost(&mut self, filter: Box<dyn Filter>) {
        self.filters.push(filter);
    }

    /// Detaches the `n` outermost filters, preserving their order.
    pub fn take_outermost(&mut self, n: usize) -> Vec<Box<dyn Filter>> {
        let keep = self.filters.len().saturating_sub(n);
        self.filters.split_off(keep)
    }

    pub fn reset(&mut self) {
        for f in &mut self.filters {
            f.reset();
        }
    }

    /// Runs outgoing buffers through the chain, application end first.
    pub fn write_through(&mut self, input: Vec<ByteBuffer>) -> Result<Vec<ByteBuffer>> {
        let mut current = input;
        for filter in self.filters.iter_mut() {
            let mut next = Vec::new();
            filter.write(&current, &mut next)?;
            current = next;
        }
        Ok(current)
    }

    /// Runs incoming wire bytes through the chain, transport end first,
    /// appending whatever surfaces at the application end to `out`.
    ///
    /// The driver is a queue loop: a stage that completes synchronously
    /// enqueues the next step rather than recursing into it, so the stack
    /// depth stays fixed no matter how many stages fire back-to-back.
    pub fn read_through(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if self.filters.is_empty() {
            out.extend_from_slice(input);
            return Ok(());
        }
        let mut pending: VecDeque<Step> = VecDeque::new();
        pending.push_back(Step {
            next_index: self.filters.len(),
            data: input.to_vec(),
        });
        while let Some(step) = pending.pop_front() {
            if step.next_index == 0 {
                out.extend_from_slice(&step.data);
                continue;
            }
            let filter = &mut self.filters[step.next_index - 1];
            let mut produced = Vec::new();
            filter.read(&step.data, &mut produced)?;
            if !produced.is_empty() {
                pending.push_back(Step {
                    next_index: step.next_index - 1,
                    data: produced,
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain").field("ids", &self.ids()).finish()
    }
}

/// The no-op filter. Useful as a negotiation placeholder and in tests.
pub struct IdentityFilter;

impl Filter for IdentityFilter {
    fn filter_id(&self) -> FilterId {
        filter_ids::IDENTITY
    }

    fn write(&mut self, input: &[ByteBuffer], out: &mut Vec<ByteBuffer>) -> Result<()> {
        out.extend_from_slice(input);
        Ok(())
    }

    fn read(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(input);
        Ok(())
    }
}

pub struct IdentityFilterFactory;

impl FilterFactory for IdentityFilterFactory {
    fn filter_id(&self) -> FilterId {
        filter_ids::IDENTITY
    }

    fn create_filter(&self) -> Box<dyn Filter> {
        Box::new(IdentityFilter)
    }
}

/// Wire messages of the `RequestTransportFilters` built-in.
pub mod negotiation {
    use serde::{Deserialize, Serialize};

    use super::FilterId;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct FilterRequest {
        pub filter_ids: Vec<FilterId>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct FilterAck {
        pub filter_ids: Vec<FilterId>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Doubles every byte on write, halves on read. Exercises a filter
    /// whose output length differs from its input length.
    struct DoublingFilter;

    impl Filter for DoublingFilter {
        fn filter_id(&self) -> FilterId {
            100
        }

        fn write(&mut self, input: &[ByteBuffer], out: &mut Vec<ByteBuffer>) -> Result<()> {
            let mut bytes = Vec::new();
            for buf in input {
                for b in buf.as_slice() {
                    bytes.push(*b);
                    bytes.push(*b);
                }
            }
            out.push(ByteBuffer::from_vec(bytes));
            Ok(())
        }

        fn read(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
            for pair in input.chunks(2) {
                out.push(pair[0]);
            }
            Ok(())
        }
    }

    /// XORs with a constant in both directions.
    struct XorFilter(u8);

    impl Filter for XorFilter {
        fn filter_id(&self) -> FilterId {
            101
        }

        fn write(&mut self, input: &[ByteBuffer], out: &mut Vec<ByteBuffer>) -> Result<()> {
            let mut bytes = Vec::new();
            for buf in input {
                bytes.extend(buf.as_slice().iter().map(|b| b ^ self.0));
            }
            out.push(ByteBuffer::from_vec(bytes));
            Ok(())
        }

        fn read(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
            out.extend(input.iter().map(|b| b ^ self.0));
            Ok(())
        }
    }

    #[test]
    fn chain_composes_write_down_and_read_up() {
        let mut chain = FilterChain::with_filters(vec![
            Box::new(DoublingFilter),
            Box::new(XorFilter(0x5A)),
        ]);

        let wire = chain
            .write_through(vec![ByteBuffer::from_vec(vec![1, 2, 3])])
            .unwrap();
        let wire_bytes = crate::buffer::concat(&wire);
        // Doubled first, then XORed.
        assert_eq!(
            wire_bytes.as_slice(),
            &[1 ^ 0x5A, 1 ^ 0x5A, 2 ^ 0x5A, 2 ^ 0x5A, 3 ^ 0x5A, 3 ^ 0x5A]
        );

        let mut decoded = Vec::new();
        chain.read_through(wire_bytes.as_slice(), &mut decoded).unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);
    }

    #[test]
    fn empty_chain_is_identity() {
        let mut chain = FilterChain::new();
        let out = chain
            .write_through(vec![ByteBuffer::from_vec(vec![7, 8])])
            .unwrap();
        assert_eq!(crate::buffer::concat(&out).as_slice(), &[7, 8]);
        let mut decoded = Vec::new();
        chain.read_through(&[7, 8], &mut decoded).unwrap();
        assert_eq!(decoded, vec![7, 8]);
    }

    #[test]
    fn registry_creates_known_stacks_only() {
        let registry = FilterRegistry::with_defaults();
        assert!(registry.contains(filter_ids::IDENTITY));
        assert!(registry.contains(filter_ids::ZLIB_STATEFUL));
        assert!(registry
            .create_stack(&[filter_ids::IDENTITY, filter_ids::ZLIB_STATELESS])
            .is_some());
        assert!(registry.create_stack(&[filter_ids::TLS]).is_none());
    }
}
