use std::collections::VecDeque;
use std::ops::{Index, IndexMut};

/// Number of command words a channel can stream before the command must be complete:
/// header, local address, external address (two words when addresses are 64-bit), and
/// for 2D transfers one line-length word and one stride word.
pub const MAX_CMD_WORDS: usize = 6;

/// Transfer size in bytes, low bits of the header word.
pub const CMD_LEN_MASK: u32 = 0x1_ffff;
/// Direction: set reads from the external bus into local memory, clear writes out.
pub const CMD_TYPE_EXT2LOC: u32 = 1 << 17;
/// Incrementing-address mode.
pub const CMD_INC: u32 = 1 << 18;
/// The transfer is two-dimensional on its external side.
pub const CMD_2D: u32 = 1 << 19;
/// Raise the channel event line when the counter drains.
pub const CMD_EVENT_ENABLE: u32 = 1 << 20;
/// Raise the channel irq line when the counter drains.
pub const CMD_IRQ_ENABLE: u32 = 1 << 21;
/// Signal every channel on completion, not just the issuing one.
pub const CMD_BROADCAST: u32 = 1 << 22;

/// Index of a command slot in the controller's [`CmdPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct CmdId(pub(crate) u32);

impl CmdId {
    #[inline]
    pub(crate) fn idx(self) -> usize {
        self.0 as usize
    }
}

/// One block transfer, streamed word by word into a channel and then carried through
/// the global queues until both its read and write sides drain.
///
/// `source`/`dest` are the live cursors; the `*_chunk` fields remember the start of the
/// current 2D line so a completed line can jump by `stride` instead of staying
/// contiguous. The external side of a 2D transfer is strided (reads stride `source`,
/// writes stride `dest`); the local side always advances linearly.
#[derive(Debug, Default)]
pub(crate) struct DmaCmd {
    pub(crate) step: usize,
    content: [u32; MAX_CMD_WORDS],

    pub(crate) size: u32,
    pub(crate) loc2ext: bool,
    pub(crate) incr: bool,
    pub(crate) is_2d: bool,
    pub(crate) raise_irq: bool,
    pub(crate) raise_event: bool,
    pub(crate) broadcast: bool,
    pub(crate) counter: usize,

    pub(crate) source: u64,
    pub(crate) dest: u64,
    pub(crate) size_to_read: u32,
    pub(crate) size_to_write: u32,
    pub(crate) line_size_to_read: u32,
    pub(crate) length: u32,
    pub(crate) stride: u32,
    pub(crate) source_chunk: u64,
    pub(crate) dest_chunk: u64,
}

impl DmaCmd {
    /// Consumes one streamed register word. Returns true when the command is fully
    /// assembled; `step` resets so the slot can be reused for the next command.
    pub(crate) fn push_word(&mut self, word: u32, is_64: bool) -> bool {
        self.content[self.step] = word;
        self.step += 1;

        if self.step == 1 {
            self.size = word & CMD_LEN_MASK;
            self.size_to_read = self.size;
            self.size_to_write = self.size;
            self.loc2ext = word & CMD_TYPE_EXT2LOC == 0;
            self.incr = word & CMD_INC != 0;
            self.is_2d = word & CMD_2D != 0;
            self.raise_event = word & CMD_EVENT_ENABLE != 0;
            self.raise_irq = word & CMD_IRQ_ENABLE != 0;
            self.broadcast = word & CMD_BROADCAST != 0;
            return false;
        }

        if (self.step == 3 && !is_64) || (self.step == 4 && is_64) {
            let loc = self.content[1] as u64;
            let ext = if is_64 {
                self.content[2] as u64 | (self.content[3] as u64) << 32
            } else {
                self.content[2] as u64
            };
            if self.loc2ext {
                self.source = loc;
                self.dest = ext;
            } else {
                self.source = ext;
                self.dest = loc;
            }
            if !self.is_2d {
                self.step = 0;
                return true;
            }
            return false;
        }

        if (self.step == 5 && !is_64) || (self.step == 6 && is_64) {
            let (length, stride) = if is_64 {
                (self.content[4], self.content[5])
            } else {
                (self.content[3], self.content[4])
            };
            self.length = length;
            self.stride = stride;
            self.line_size_to_read = length;
            self.source_chunk = self.source;
            self.dest_chunk = self.dest;
            self.step = 0;
            return true;
        }

        false
    }

    /// Advances both cursors past a chunk handed to the transfer engine. For 2D
    /// commands a completed line snaps the external-side cursor to the start of the
    /// line plus `stride`.
    pub(crate) fn advance(&mut self, size: u32) {
        self.dest += size as u64;
        self.source += size as u64;
        self.size_to_read -= size;
        if self.is_2d {
            self.line_size_to_read -= size;
            if self.line_size_to_read == 0 {
                self.line_size_to_read = self.length;
                if self.loc2ext {
                    self.dest = self.dest_chunk + self.stride as u64;
                    self.dest_chunk = self.dest;
                } else {
                    self.source = self.source_chunk + self.stride as u64;
                    self.source_chunk = self.source;
                }
            }
        }
    }
}

/// Commands are pooled: slots are recycled through a free list and reinitialized on
/// allocation, never dropped.
#[derive(Debug, Default)]
pub(crate) struct CmdPool {
    slots: Vec<DmaCmd>,
    free: Vec<CmdId>,
}

impl CmdPool {
    pub(crate) fn alloc(&mut self) -> CmdId {
        match self.free.pop() {
            Some(id) => {
                self.slots[id.idx()] = DmaCmd::default();
                id
            }
            None => {
                let id = CmdId(self.slots.len() as u32);
                self.slots.push(DmaCmd::default());
                id
            }
        }
    }

    pub(crate) fn release(&mut self, id: CmdId) {
        self.free.push(id);
    }
}

impl Index<CmdId> for CmdPool {
    type Output = DmaCmd;

    fn index(&self, id: CmdId) -> &DmaCmd {
        &self.slots[id.idx()]
    }
}

impl IndexMut<CmdId> for CmdPool {
    fn index_mut(&mut self, id: CmdId) -> &mut DmaCmd {
        &mut self.slots[id.idx()]
    }
}

/// Bounded FIFO of command ids, used for the per-channel queues and the two global
/// direction queues.
#[derive(Debug)]
pub(crate) struct CmdQueue {
    ids: VecDeque<CmdId>,
    depth: usize,
}

impl CmdQueue {
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            ids: VecDeque::new(),
            depth,
        }
    }

    pub(crate) fn push(&mut self, id: CmdId) {
        self.ids.push_back(id);
    }

    pub(crate) fn pop(&mut self) -> Option<CmdId> {
        self.ids.pop_front()
    }

    /// Pops the oldest queued command moving in the given direction, skipping over
    /// commands headed the other way.
    pub(crate) fn pop_direction(&mut self, cmds: &CmdPool, loc2ext: bool) -> Option<CmdId> {
        let pos = self.ids.iter().position(|&id| cmds[id].loc2ext == loc2ext)?;
        self.ids.remove(pos)
    }

    pub(crate) fn is_full(&self) -> bool {
        self.ids.len() >= self.depth
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
