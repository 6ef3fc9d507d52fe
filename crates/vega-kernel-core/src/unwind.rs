//! Frame-pointer stack walker for diagnostics
//!
//! Walks a chain of saved frame pointers to produce a lazy, finite,
//! restartable sequence of stack frames: return address plus up to five
//! argument words per frame. The walk terminates when the chain reaches
//! the zero sentinel, when memory becomes unreadable, or at a depth cap
//! (a corrupt chain may cycle).
//!
//! Frame layout (64-bit words):
//!
//! ```text
//!   fp + 0   caller's saved frame pointer
//!   fp + 8   return address
//!   fp + 16  first argument word
//!   ...      up to MAX_FRAME_ARGS argument words
//! ```
//!
//! Memory access and symbol resolution are collaborator seams: the walker
//! reads words through [`FrameReader`] and pairs return addresses with
//! source locations through [`SymbolResolver`]. Both are read-only; this
//! module has no concurrency concerns and touches no kernel state.

use alloc::string::String;

use crate::types::VirtAddr;

/// Argument words captured per frame
pub const MAX_FRAME_ARGS: usize = 5;

/// Depth cap guarding against cyclic frame-pointer chains
pub const MAX_BACKTRACE_DEPTH: usize = 64;

const WORD: u64 = 8;

/// Read-only access to the stack memory of the environment being
/// inspected.
pub trait FrameReader {
    /// Read one word at `addr`; `None` if the address is unreadable.
    fn read_word(&self, addr: VirtAddr) -> Option<u64>;
}

/// Source-location lookup by instruction address (external collaborator).
pub trait SymbolResolver {
    /// Resolve `addr` to its enclosing function, or `None` if unknown.
    fn resolve(&self, addr: u64) -> Option<SymbolInfo>;
}

/// What the symbol table knows about an instruction address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolInfo {
    /// Source file name
    pub file: String,
    /// Source line number
    pub line: u32,
    /// Enclosing function name
    pub fn_name: String,
    /// Address where the enclosing function starts
    pub fn_addr: u64,
}

/// One walked stack frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackFrame {
    /// Frame pointer this frame was read from
    pub frame_ptr: VirtAddr,
    /// Saved return address
    pub return_addr: u64,
    /// Up to five argument words; unreadable slots read as zero
    pub args: [u64; MAX_FRAME_ARGS],
}

impl StackFrame {
    /// Offset of the return address into its enclosing function, if the
    /// resolver knows the address.
    pub fn resolve<S: SymbolResolver>(&self, symbols: &S) -> Option<(SymbolInfo, u64)> {
        let info = symbols.resolve(self.return_addr)?;
        let offset = self.return_addr.wrapping_sub(info.fn_addr);
        Some((info, offset))
    }
}

/// Lazy iterator over a frame-pointer chain.
///
/// Restartable: a new `Backtrace` can be created from any frame pointer
/// (for instance one yielded earlier) and walks the same suffix again.
pub struct Backtrace<'a, R: FrameReader> {
    reader: &'a R,
    fp: u64,
    depth: usize,
}

impl<'a, R: FrameReader> Backtrace<'a, R> {
    /// Start a walk from `fp` (typically the current frame pointer of the
    /// environment being inspected).
    pub fn new(reader: &'a R, fp: VirtAddr) -> Self {
        Self {
            reader,
            fp: fp.0,
            depth: 0,
        }
    }
}

impl<'a, R: FrameReader> Iterator for Backtrace<'a, R> {
    type Item = StackFrame;

    fn next(&mut self) -> Option<StackFrame> {
        if self.fp == 0 || self.depth >= MAX_BACKTRACE_DEPTH {
            return None;
        }

        let fp = self.fp;
        // A corrupt saved frame pointer can sit near the top of the
        // address range; slot addresses past it end the walk like any
        // other unreadable frame.
        let return_addr = fp
            .checked_add(WORD)
            .and_then(|addr| self.reader.read_word(VirtAddr(addr)))?;

        let mut args = [0u64; MAX_FRAME_ARGS];
        for (i, slot) in args.iter_mut().enumerate() {
            *slot = fp
                .checked_add(2 * WORD + i as u64 * WORD)
                .and_then(|addr| self.reader.read_word(VirtAddr(addr)))
                .unwrap_or(0);
        }

        // An unreadable saved frame pointer ends the walk after this frame
        self.fp = self.reader.read_word(VirtAddr(fp)).unwrap_or(0);
        self.depth += 1;

        Some(StackFrame {
            frame_ptr: VirtAddr(fp),
            return_addr,
            args,
        })
    }
}
