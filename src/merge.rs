//! K-way merge of per-part block streams into one stream ordered by (series id, timestamp).

use crate::block::{Block, BlockDescriptor};
use crate::error::PartError;
use crate::fadvis::Fadvis;
use crate::part::Part;
use crate::seq_reader::SeqReaders;
use crate::wrapper::PartRef;

use std::cmp::Ordering;
use std::collections::binary_heap::PeekMut;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// A cursor over one part's block descriptors.
pub trait PartBlockIter {
    fn part_id(&self) -> u64;

    /// Moves to the next block. `Ok(false)` means clean exhaustion.
    fn advance(&mut self) -> Result<bool, PartError>;

    /// The block the last successful [`advance`](Self::advance) moved to.
    fn current(&self) -> &BlockDescriptor;

    /// Decodes the current block's payload.
    fn load_block_data(&mut self) -> Result<Block, PartError>;
}

/// [`PartBlockIter`] over a published part. Holds a reference on the part for its lifetime.
#[derive(Debug)]
pub struct PartMergeIter {
    part: Arc<Part>,
    readers: SeqReaders,
    next: usize,
    current: Option<BlockDescriptor>,
    // Declared last so the readers close before the reference is dropped.
    _ref: PartRef,
}

impl PartMergeIter {
    pub fn new(part_ref: PartRef, fadvis: &Fadvis) -> Result<Self, PartError> {
        let part = part_ref
            .part()
            .ok_or_else(|| PartError::Internal(format!("{} was already released", *part_ref)))?;
        let readers = SeqReaders::open(&part, fadvis)?;
        Ok(Self {
            part,
            readers,
            next: 0,
            current: None,
            _ref: part_ref,
        })
    }
}

impl PartBlockIter for PartMergeIter {
    fn part_id(&self) -> u64 {
        self.part.id()
    }

    fn advance(&mut self) -> Result<bool, PartError> {
        let Some(d) = self.part.descriptors().get(self.next).copied() else {
            return Ok(false);
        };
        if let Some(prev) = &self.current {
            if prev.key() > d.key() {
                return Err(PartError::corruption(
                    self.part.path().unwrap_or(std::path::Path::new("")),
                    format!(
                        "Block #{} of {} is out of order: {:?} after {:?}",
                        self.next,
                        self.part,
                        d.key(),
                        prev.key()
                    ),
                ));
            }
        }
        self.current = Some(d);
        self.next += 1;
        Ok(true)
    }

    fn current(&self) -> &BlockDescriptor {
        const NONE: BlockDescriptor = BlockDescriptor {
            series_id: 0,
            min_timestamp: 0,
            max_timestamp: 0,
            count: 0,
            primary: crate::block::DataRange { offset: 0, size: 0 },
            timestamps: crate::block::DataRange { offset: 0, size: 0 },
        };
        self.current.as_ref().unwrap_or(&NONE)
    }

    fn load_block_data(&mut self) -> Result<Block, PartError> {
        let Some(d) = self.current else {
            return Err(PartError::Internal(
                "load_block_data called before advance".to_string(),
            ));
        };
        self.readers.load_block(&d)
    }
}

struct HeapEntry<I> {
    iter: I,
    input: usize,
}

impl<I: PartBlockIter> HeapEntry<I> {
    fn key(&self) -> (u64, i64, usize) {
        let (sid, ts) = self.iter.current().key();
        (sid, ts, self.input)
    }
}

impl<I: PartBlockIter> PartialEq for HeapEntry<I> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<I: PartBlockIter> Eq for HeapEntry<I> {}

impl<I: PartBlockIter> PartialOrd for HeapEntry<I> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<I: PartBlockIter> Ord for HeapEntry<I> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap.
        other.key().cmp(&self.key())
    }
}

/// Pull-based merge over N part iterators.
///
/// Holds at most one pending block per input and never decodes payloads unless
/// [`load_block_data`](Self::load_block_data) is called. Equal keys come out in input order.
pub struct MergeReader<I: PartBlockIter = PartMergeIter> {
    heap: BinaryHeap<HeapEntry<I>>,
    next_noop: bool,
    done: bool,
    // Sequential column readers cannot rewind, so each block decodes once.
    loaded: bool,
}

impl<I: PartBlockIter> MergeReader<I> {
    /// Positions every input on its first block. Inputs with no blocks are dropped;
    /// an input that fails here fails the whole merge.
    pub fn new(iters: impl IntoIterator<Item = I>) -> Result<Self, PartError> {
        let mut heap = BinaryHeap::new();
        for (input, mut iter) in iters.into_iter().enumerate() {
            match iter.advance() {
                Ok(true) => heap.push(HeapEntry { iter, input }),
                Ok(false) => {}
                Err(e) => {
                    return Err(PartError::Merge {
                        part_id: iter.part_id(),
                        source: Box::new(e),
                    })
                }
            }
        }
        let next_noop = !heap.is_empty();
        Ok(Self {
            heap,
            next_noop,
            done: !next_noop,
            loaded: false,
        })
    }

    /// Moves to the next block in global order. `Ok(None)` is end of stream.
    ///
    /// After an error the reader is finished and keeps returning `Ok(None)`.
    pub fn next_block(&mut self) -> Result<Option<&BlockDescriptor>, PartError> {
        if self.done {
            return Ok(None);
        }
        self.loaded = false;
        if self.next_noop {
            self.next_noop = false;
            return Ok(self.heap.peek().map(|e| e.iter.current()));
        }

        let step = match self.heap.peek_mut() {
            None => None,
            Some(mut head) => match head.iter.advance() {
                Ok(true) => Some(Ok(())),
                Ok(false) => {
                    PeekMut::pop(head);
                    Some(Ok(()))
                }
                Err(e) => Some(Err((head.iter.part_id(), e))),
            },
        };
        match step {
            None => {
                self.done = true;
                return Ok(None);
            }
            Some(Err((part_id, e))) => {
                self.done = true;
                self.heap.clear();
                return Err(PartError::Merge {
                    part_id,
                    source: Box::new(e),
                });
            }
            Some(Ok(())) => {}
        }

        match self.heap.peek() {
            Some(e) => Ok(Some(e.iter.current())),
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    /// The block last returned by [`next_block`](Self::next_block).
    pub fn current(&self) -> Option<&BlockDescriptor> {
        if self.done || self.next_noop {
            return None;
        }
        self.heap.peek().map(|e| e.iter.current())
    }

    /// Part id of the current block.
    pub fn current_part_id(&self) -> Option<u64> {
        self.current()?;
        self.heap.peek().map(|e| e.iter.part_id())
    }

    /// Decodes the current block. Each block can be loaded once; a second call before
    /// [`next_block`](Self::next_block) is an `Internal` error and leaves the reader usable.
    pub fn load_block_data(&mut self) -> Result<Block, PartError> {
        if self.done || self.next_noop {
            return Err(PartError::Internal(
                "no current block to load".to_string(),
            ));
        }
        if self.loaded {
            return Err(PartError::Internal(
                "current block was already loaded".to_string(),
            ));
        }
        let Some(mut head) = self.heap.peek_mut() else {
            return Err(PartError::Internal(
                "no current block to load".to_string(),
            ));
        };
        let part_id = head.iter.part_id();
        self.loaded = true;
        head.iter
            .load_block_data()
            .map_err(|e| PartError::Merge {
                part_id,
                source: Box::new(e),
            })
    }

    /// Number of inputs that still have blocks.
    pub fn live_inputs(&self) -> usize {
        self.heap.len()
    }
}
