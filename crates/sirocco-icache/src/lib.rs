//! Decoded-instruction cache for an interpreting processor model.
//!
//! An interpreter pays the decode cost once per instruction, not once per execution:
//! decoded forms live in blocks keyed by the aligned base of the program counter,
//! hashed into a fixed array of bucket chains. The cache never frees memory. A flush
//! (after self-modifying code or a disputed fetch region) marks every block
//! uninitialized and resets its slots to the not-yet-decoded state in place; the next
//! lookup of any base reclaims an uninitialized block from its chain before growing it.
//!
//! References into the cache ([`InsnRef`]) are plain indices and stay dereferenceable
//! across a flush, but a flush resets what they point at. A processor model holding
//! live references (current, previous, stalled, loop-end instructions) must capture
//! their *addresses* before flushing and re-resolve each one with
//! [`InsnCache::lookup_or_create`] afterwards; the cache does not track outstanding
//! references.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InsnCacheError {
    #[error("{what} ({value}) is not a power of two")]
    NotPowerOfTwo { what: &'static str, value: usize },
}

/// Cache geometry.
#[derive(Debug, Clone, Copy)]
pub struct InsnCacheConfig {
    /// Bucket count of the block hash; power of two.
    pub nb_buckets: usize,
    /// Slots per block; power of two.
    pub block_size: usize,
    /// log2 of the instruction granularity in bytes (1 for an ISA with 16-bit
    /// compressed encodings, 2 for fixed 32-bit).
    pub pc_bits: u32,
}

impl Default for InsnCacheConfig {
    fn default() -> Self {
        Self {
            nb_buckets: 4096,
            block_size: 256,
            pc_bits: 1,
        }
    }
}

/// Reference to one instruction slot. Stable until the next flush; after a flush it
/// must be re-resolved by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InsnRef {
    block: u32,
    slot: u32,
}

/// One instruction slot: the address it stands for and, once the interpreter has
/// decoded it, the decoded form.
#[derive(Debug)]
pub struct InsnSlot<D> {
    pub addr: u64,
    pub decoded: Option<D>,
}

#[derive(Debug)]
struct Block {
    base: u64,
    is_init: bool,
    next: Option<u32>,
}

/// Block-structured decoded-instruction cache, generic over the decoded form `D`.
#[derive(Debug)]
pub struct InsnCache<D> {
    buckets: Vec<Option<u32>>,
    blocks: Vec<Block>,
    /// Flat slot arena; block `i` owns `slots[i * block_size ..][.. block_size]`.
    slots: Vec<InsnSlot<D>>,
    block_size: usize,
    pc_bits: u32,
    base_mask: u64,
    bucket_mask: u64,
    slot_mask: u64,
}

impl<D> InsnCache<D> {
    pub fn new(cfg: InsnCacheConfig) -> Result<Self, InsnCacheError> {
        if !cfg.nb_buckets.is_power_of_two() {
            return Err(InsnCacheError::NotPowerOfTwo {
                what: "nb_buckets",
                value: cfg.nb_buckets,
            });
        }
        if !cfg.block_size.is_power_of_two() {
            return Err(InsnCacheError::NotPowerOfTwo {
                what: "block_size",
                value: cfg.block_size,
            });
        }
        Ok(Self {
            buckets: vec![None; cfg.nb_buckets],
            blocks: Vec::new(),
            slots: Vec::new(),
            block_size: cfg.block_size,
            pc_bits: cfg.pc_bits,
            base_mask: ((cfg.block_size as u64) << cfg.pc_bits) - 1,
            bucket_mask: (cfg.nb_buckets - 1) as u64,
            slot_mask: (cfg.block_size - 1) as u64,
        })
    }

    /// Resolves `pc` to its slot, materializing the owning block if needed.
    ///
    /// The hot path is a hit on an initialized block. On a miss the chain's first
    /// uninitialized block (left by a flush) is reclaimed before any allocation; a
    /// brand-new block is prepended to its bucket. Either way every slot of the block
    /// is (re)initialized to the not-yet-decoded state tagged with its address.
    pub fn lookup_or_create(&mut self, pc: u64) -> InsnRef {
        let base = pc & !self.base_mask;
        let slot = ((pc >> self.pc_bits) & self.slot_mask) as u32;
        // Bases are block-span aligned, so spans wider than the bucket count leave
        // part of the bucket array unused. Harmless: chains just get longer.
        let bucket = (base & self.bucket_mask) as usize;

        let mut first_free = None;
        let mut cur = self.buckets[bucket];
        while let Some(b) = cur {
            let block = &self.blocks[b as usize];
            if block.is_init {
                if block.base == base {
                    return InsnRef { block: b, slot };
                }
            } else if first_free.is_none() {
                first_free = Some(b);
            }
            cur = block.next;
        }

        let b = match first_free {
            Some(b) => b,
            None => {
                let b = self.blocks.len() as u32;
                self.blocks.push(Block {
                    base,
                    is_init: false,
                    next: self.buckets[bucket],
                });
                self.slots.extend((0..self.block_size).map(|_| InsnSlot {
                    addr: 0,
                    decoded: None,
                }));
                self.buckets[bucket] = Some(b);
                b
            }
        };
        self.init_block(b, base);
        InsnRef { block: b, slot }
    }

    pub fn get(&self, insn: InsnRef) -> &InsnSlot<D> {
        &self.slots[self.slot_index(insn)]
    }

    pub fn get_mut(&mut self, insn: InsnRef) -> &mut InsnSlot<D> {
        let index = self.slot_index(insn);
        &mut self.slots[index]
    }

    /// Resets every block in place: all slots back to not-yet-decoded, all blocks
    /// marked uninitialized and reclaimable. No memory is freed.
    ///
    /// Outstanding [`InsnRef`]s must be re-resolved by address after this; see the
    /// crate docs.
    pub fn flush_all(&mut self) {
        for block in &mut self.blocks {
            block.is_init = false;
        }
        for slot in &mut self.slots {
            slot.decoded = None;
        }
    }

    /// Number of blocks ever materialized. Flushing does not shrink it.
    pub fn nb_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn init_block(&mut self, b: u32, base: u64) {
        let block = &mut self.blocks[b as usize];
        block.base = base;
        block.is_init = true;
        let start = b as usize * self.block_size;
        for (i, slot) in self.slots[start..start + self.block_size]
            .iter_mut()
            .enumerate()
        {
            slot.addr = base + ((i as u64) << self.pc_bits);
            slot.decoded = None;
        }
    }

    #[inline]
    fn slot_index(&self, insn: InsnRef) -> usize {
        insn.block as usize * self.block_size + insn.slot as usize
    }
}
